use http::header::{
    ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderValue, TRANSFER_ENCODING,
};
use http::{HeaderMap, Method};
use url::Url;

use crate::core::origin::Origin;

const ACCEPT_ENCODING_VALUE: &str = "gzip, deflate, br, zstd";

/// Request metadata: everything except the body.
///
/// The head is mutable while the request is being prepared; once an attempt has
/// been dispatched a clone of it is kept on the response for inspection.
#[derive(Clone, Debug)]
pub struct RequestHead {
    method: Method,
    url: Url,
    headers: HeaderMap,
    target: Option<String>,
}

impl RequestHead {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            target: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn origin(&self) -> crate::Result<Origin> {
        Origin::from_url(&self.url)
    }

    /// Request target for the request line. Defaults to `path[?query]`.
    pub fn target(&self) -> String {
        if let Some(target) = &self.target {
            return target.clone();
        }
        match self.url.query() {
            Some(query) => format!("{}?{query}", self.url.path()),
            None => self.url.path().to_owned(),
        }
    }

    pub fn set_target(&mut self, target: impl Into<String>) {
        self.target = Some(target.into());
    }

    pub(crate) fn clear_target(&mut self) {
        self.target = None;
    }

    pub(crate) fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub(crate) fn set_url(&mut self, url: Url) {
        self.url = url;
    }

    pub(crate) fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// What the attempt loop needs to know about a body without touching it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BodyShape {
    pub present: bool,
    pub content_length: Option<u64>,
    pub rewindable: bool,
    pub content_type: Option<&'static str>,
}

impl BodyShape {
    pub const fn empty() -> Self {
        Self {
            present: false,
            content_length: Some(0),
            rewindable: true,
            content_type: None,
        }
    }
}

pub(crate) fn apply_default_headers(headers: &mut HeaderMap, defaults: &HeaderMap) {
    for name in defaults.keys() {
        if headers.contains_key(name) {
            continue;
        }
        for value in defaults.get_all(name) {
            headers.append(name.clone(), value.clone());
        }
    }
}

pub(crate) fn apply_host_header(headers: &mut HeaderMap, origin: &Origin) {
    if let Ok(value) = HeaderValue::from_str(&origin.authority()) {
        headers.insert(HOST, value);
    }
}

pub(crate) fn apply_accept_encoding(headers: &mut HeaderMap) {
    if !headers.contains_key(ACCEPT_ENCODING) {
        headers.insert(
            ACCEPT_ENCODING,
            HeaderValue::from_static(ACCEPT_ENCODING_VALUE),
        );
    }
}

/// Sets `Content-Length` or `Transfer-Encoding: chunked` and a default
/// `Content-Type` for the body about to be sent.
pub(crate) fn apply_framing(headers: &mut HeaderMap, method: &Method, body: Option<&BodyShape>) {
    let Some(body) = body.filter(|body| body.present) else {
        headers.remove(TRANSFER_ENCODING);
        if matches!(*method, Method::POST | Method::PUT | Method::PATCH) {
            headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        } else {
            headers.remove(CONTENT_LENGTH);
        }
        return;
    };

    match body.content_length {
        Some(length) => {
            headers.remove(TRANSFER_ENCODING);
            headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        }
        None => {
            headers.remove(CONTENT_LENGTH);
            headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        }
    }
    if let Some(content_type) = body.content_type
        && !headers.contains_key(CONTENT_TYPE)
    {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
}
