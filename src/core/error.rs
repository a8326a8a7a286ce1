use http::Method;
use thiserror::Error;

use crate::core::request::RequestHead;
use crate::core::response::{HistoryEntry, ResponseHead};

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl TransportErrorKind {
    /// Whether the failure happened before any request bytes were accepted.
    pub const fn is_connect_phase(self) -> bool {
        matches!(self, Self::Dns | Self::Connect | Self::Tls)
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutPhase {
    Connect,
    ResponseHeaders,
    ResponseBody,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Connect => "connect",
            Self::ResponseHeaders => "response_headers",
            Self::ResponseBody => "response_body",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    SerializeJson,
    Deserialize,
    BodyRead,
    ReadBody,
    DecodeContentEncoding,
    Transport,
    Timeout,
    TrustVerification,
    TlsVersionMismatch,
    AlpnMismatch,
    UnsupportedFingerprint,
    InvalidTlsConfig,
    UnrewindableBody,
    HttpStatus,
    TooManyRedirects,
    RedirectLoop,
    InvalidRedirectLocation,
    Store,
    Canceled,
    InvalidNoProxyRule,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::SerializeJson => "serialize_json",
            Self::Deserialize => "deserialize",
            Self::BodyRead => "body_read",
            Self::ReadBody => "read_body",
            Self::DecodeContentEncoding => "decode_content_encoding",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::TrustVerification => "trust_verification",
            Self::TlsVersionMismatch => "tls_version_mismatch",
            Self::AlpnMismatch => "alpn_mismatch",
            Self::UnsupportedFingerprint => "unsupported_fingerprint",
            Self::InvalidTlsConfig => "invalid_tls_config",
            Self::UnrewindableBody => "unrewindable_body",
            Self::HttpStatus => "http_status",
            Self::TooManyRedirects => "too_many_redirects",
            Self::RedirectLoop => "redirect_loop",
            Self::InvalidRedirectLocation => "invalid_redirect_location",
            Self::Store => "store",
            Self::Canceled => "canceled",
            Self::InvalidNoProxyRule => "invalid_no_proxy_rule",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Context attached to every terminal failure of the attempt loop.
#[derive(Debug)]
pub struct FailedRequest {
    pub(crate) request: RequestHead,
    pub(crate) response: Option<ResponseHead>,
    pub(crate) history: Vec<HistoryEntry>,
    pub(crate) attempts: usize,
    pub(crate) retries_exhausted: bool,
    pub(crate) error: Error,
}

impl FailedRequest {
    pub fn request(&self) -> &RequestHead {
        &self.request
    }

    /// Last response received before failing, if the failure happened after headers arrived.
    pub fn response(&self) -> Option<&ResponseHead> {
        self.response.as_ref()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retries_exhausted
    }

    pub fn error(&self) -> &Error {
        &self.error
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to serialize request json: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("failed to read request body source: {source}")]
    BodyRead {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read response body for {method} {uri}: {source}")]
    ReadBody {
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to decode response content-encoding {encoding} for {method} {uri}: {message}")]
    DecodeContentEncoding {
        encoding: String,
        method: Method,
        uri: String,
        message: String,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out in {phase} for {method} {uri}")]
    Timeout {
        phase: TimeoutPhase,
        method: Method,
        uri: String,
    },
    #[error("peer certificate for {host} failed verification: {message}")]
    TrustVerification { host: String, message: String },
    #[error("negotiated tls version {negotiated} for {host} is outside the accepted range")]
    TlsVersionMismatch { host: String, negotiated: String },
    #[error("server for {host} selected alpn protocol {selected} which was not offered")]
    AlpnMismatch { host: String, selected: String },
    #[error("unsupported pinned certificate fingerprint {fingerprint}: {message}")]
    UnsupportedFingerprint {
        fingerprint: String,
        message: String,
    },
    #[error("invalid tls configuration: {message}")]
    InvalidTlsConfig { message: String },
    #[error("request body for {method} {uri} cannot be rewound for another attempt")]
    UnrewindableBody { method: Method, uri: String },
    #[error("http status error {status} for {method} {uri}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
    },
    #[error("redirect limit exceeded ({max_redirects}) for {method} {uri}")]
    TooManyRedirects {
        max_redirects: usize,
        method: Method,
        uri: String,
    },
    #[error("redirect loop detected at {uri}")]
    RedirectLoop { uri: String, chain: Vec<String> },
    #[error("invalid redirect location {location} for {method} {uri}")]
    InvalidRedirectLocation {
        location: String,
        method: Method,
        uri: String,
    },
    #[error("session store {operation} failed: {message}")]
    Store {
        operation: &'static str,
        message: String,
    },
    #[error("request {method} {uri} was canceled")]
    Canceled { method: Method, uri: String },
    #[error("invalid no_proxy rule: {rule}")]
    InvalidNoProxyRule { rule: String },
    #[error("{}", .0.error)]
    Request(Box<FailedRequest>),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::Serialize { .. } => ErrorCode::SerializeJson,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::BodyRead { .. } => ErrorCode::BodyRead,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::DecodeContentEncoding { .. } => ErrorCode::DecodeContentEncoding,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::TrustVerification { .. } => ErrorCode::TrustVerification,
            Self::TlsVersionMismatch { .. } => ErrorCode::TlsVersionMismatch,
            Self::AlpnMismatch { .. } => ErrorCode::AlpnMismatch,
            Self::UnsupportedFingerprint { .. } => ErrorCode::UnsupportedFingerprint,
            Self::InvalidTlsConfig { .. } => ErrorCode::InvalidTlsConfig,
            Self::UnrewindableBody { .. } => ErrorCode::UnrewindableBody,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::TooManyRedirects { .. } => ErrorCode::TooManyRedirects,
            Self::RedirectLoop { .. } => ErrorCode::RedirectLoop,
            Self::InvalidRedirectLocation { .. } => ErrorCode::InvalidRedirectLocation,
            Self::Store { .. } => ErrorCode::Store,
            Self::Canceled { .. } => ErrorCode::Canceled,
            Self::InvalidNoProxyRule { .. } => ErrorCode::InvalidNoProxyRule,
            Self::Request(failed) => failed.error.code(),
        }
    }

    /// The underlying error with any attempt-loop context stripped.
    pub fn root(&self) -> &Error {
        match self {
            Self::Request(failed) => failed.error.root(),
            other => other,
        }
    }

    pub fn failed_request(&self) -> Option<&FailedRequest> {
        match self {
            Self::Request(failed) => Some(failed),
            _ => None,
        }
    }

    pub fn history(&self) -> &[HistoryEntry] {
        self.failed_request()
            .map(FailedRequest::history)
            .unwrap_or_default()
    }

    pub fn response(&self) -> Option<&ResponseHead> {
        self.failed_request().and_then(FailedRequest::response)
    }

    pub fn retries_exhausted(&self) -> bool {
        self.failed_request()
            .is_some_and(FailedRequest::retries_exhausted)
    }

    pub fn transport(
        kind: TransportErrorKind,
        request: &RequestHead,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Transport {
            kind,
            method: request.method().clone(),
            uri: request.url().to_string(),
            source: source.into(),
        }
    }

    pub fn timeout(phase: TimeoutPhase, request: &RequestHead) -> Self {
        Self::Timeout {
            phase,
            method: request.method().clone(),
            uri: request.url().to_string(),
        }
    }

    pub fn store(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Store {
            operation,
            message: message.into(),
        }
    }

    /// Failures that end the logical request regardless of any retry budget.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            Self::TrustVerification { .. }
                | Self::TlsVersionMismatch { .. }
                | Self::AlpnMismatch { .. }
                | Self::UnrewindableBody { .. }
                | Self::BodyRead { .. }
                | Self::Canceled { .. }
        )
    }
}
