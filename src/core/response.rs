use std::sync::Arc;

use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, StatusCode, Version};
use url::Url;

use crate::core::error::{Error, ErrorCode};
use crate::core::request::RequestHead;

/// An informational (1xx) response collected while waiting for the final one.
#[derive(Clone, Debug)]
pub struct Interim {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Final response headers as reported by a transport lifecycle.
#[derive(Clone, Debug)]
pub struct ReceivedResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub informational: Vec<Interim>,
}

impl ReceivedResponse {
    pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers,
            informational: Vec::new(),
        }
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn informational(mut self, interim: Interim) -> Self {
        self.informational.push(interim);
        self
    }
}

/// Header-only view of a response, tied to the request that produced it.
#[derive(Clone, Debug)]
pub struct ResponseHead {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    request: Arc<RequestHead>,
}

impl ResponseHead {
    pub(crate) fn new(
        status: StatusCode,
        version: Version,
        headers: HeaderMap,
        request: Arc<RequestHead>,
    ) -> Self {
        Self {
            status,
            version,
            headers,
            request,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn request(&self) -> &RequestHead {
        &self.request
    }

    pub fn url(&self) -> &Url {
        self.request.url()
    }

    pub(crate) fn request_arc(&self) -> &Arc<RequestHead> {
        &self.request
    }

    pub fn raise_for_status(&self) -> crate::Result<()> {
        if self.status.as_u16() >= 400 {
            return Err(Error::HttpStatus {
                status: self.status.as_u16(),
                method: self.request.method().clone(),
                uri: self.request.url().to_string(),
            });
        }
        Ok(())
    }
}

/// An attempt that ended without a usable final response.
#[derive(Clone, Debug)]
pub struct FailedAttempt {
    request: Arc<RequestHead>,
    code: ErrorCode,
    message: String,
}

impl FailedAttempt {
    pub(crate) fn new(request: Arc<RequestHead>, error: &Error) -> Self {
        Self {
            request,
            code: error.code(),
            message: error.to_string(),
        }
    }

    pub fn request(&self) -> &RequestHead {
        &self.request
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// One superseded step of a logical request, in chronological order.
#[derive(Clone, Debug)]
pub enum HistoryEntry {
    Response(ResponseHead),
    Failed(FailedAttempt),
}

impl HistoryEntry {
    pub fn response(&self) -> Option<&ResponseHead> {
        match self {
            Self::Response(head) => Some(head),
            Self::Failed(_) => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.response().map(ResponseHead::status)
    }
}

/// Media type without parameters, `application/octet-stream` when absent.
pub(crate) fn content_type(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "application/octet-stream".to_owned())
}

/// `Content-Length`, only when every value present agrees.
pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
    let mut agreed = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        for item in value.to_str().ok()?.split(',') {
            let parsed = item.trim().parse::<u64>().ok()?;
            match agreed {
                None => agreed = Some(parsed),
                Some(existing) if existing == parsed => {}
                Some(_) => return None,
            }
        }
    }
    agreed
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Ascii,
    Latin1,
    /// Unrecognized label, decoded as lossy UTF-8.
    Other(String),
}

impl TextEncoding {
    pub fn from_label(label: &str) -> Self {
        let label = label.trim().trim_matches('"').to_ascii_lowercase();
        match label.as_str() {
            "utf-8" | "utf8" => Self::Utf8,
            "ascii" | "us-ascii" => Self::Ascii,
            "iso-8859-1" | "latin1" | "latin-1" | "l1" => Self::Latin1,
            _ => Self::Other(label),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Ascii => "ascii",
            Self::Latin1 => "iso-8859-1",
            Self::Other(label) => label,
        }
    }
}

pub(crate) fn encoding_from_headers(headers: &HeaderMap) -> Option<TextEncoding> {
    let charset = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value.split(';').skip(1).find_map(|param| {
                let (name, value) = param.split_once('=')?;
                name.trim()
                    .eq_ignore_ascii_case("charset")
                    .then(|| value.to_owned())
            })
        });
    if let Some(charset) = charset {
        return Some(TextEncoding::from_label(&charset));
    }
    if content_length(headers) == Some(0) {
        return Some(TextEncoding::Ascii);
    }
    None
}

/// Incremental decoder that keeps partial multi-byte sequences between chunks.
#[derive(Debug)]
pub(crate) struct TextDecoder {
    encoding: TextEncoding,
    pending: Vec<u8>,
}

impl TextDecoder {
    pub(crate) fn new(encoding: TextEncoding) -> Self {
        Self {
            encoding,
            pending: Vec::new(),
        }
    }

    pub(crate) fn decode(&mut self, chunk: &[u8], last: bool) -> String {
        match &self.encoding {
            TextEncoding::Ascii => chunk
                .iter()
                .map(|byte| {
                    if byte.is_ascii() {
                        *byte as char
                    } else {
                        '\u{FFFD}'
                    }
                })
                .collect(),
            TextEncoding::Latin1 => chunk.iter().map(|byte| *byte as char).collect(),
            TextEncoding::Utf8 | TextEncoding::Other(_) => self.decode_utf8(chunk, last),
        }
    }

    fn decode_utf8(&mut self, chunk: &[u8], last: bool) -> String {
        self.pending.extend_from_slice(chunk);
        let mut decoded = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    decoded.push_str(text);
                    self.pending.clear();
                    return decoded;
                }
                Err(error) => {
                    let valid = error.valid_up_to();
                    decoded.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match error.error_len() {
                        Some(invalid) => {
                            decoded.push('\u{FFFD}');
                            self.pending.drain(..valid + invalid);
                        }
                        None if last => {
                            decoded.push('\u{FFFD}');
                            self.pending.clear();
                            return decoded;
                        }
                        None => {
                            self.pending.drain(..valid);
                            return decoded;
                        }
                    }
                }
            }
        }
    }
}
