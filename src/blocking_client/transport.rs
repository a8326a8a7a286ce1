use bytes::Bytes;
use http::HeaderMap;

use crate::core::affinity::{ConnectionConfig, ConnectionKey, Negotiated};
use crate::core::request::RequestHead;
use crate::core::response::ReceivedResponse;

/// Connection Manager for the blocking session.
///
/// Implementations look up or open a connection satisfying `config` and start
/// one request/response exchange on it. Connect-phase failures are reported
/// as `Error::Transport { kind: Dns | Connect | Tls }` or a connect timeout;
/// the session decides whether they are retried.
pub trait Transport: Send + Sync {
    fn start_lifecycle(
        &self,
        request: &RequestHead,
        config: &ConnectionConfig,
    ) -> crate::Result<Box<dyn Lifecycle>>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn start_lifecycle(
        &self,
        request: &RequestHead,
        config: &ConnectionConfig,
    ) -> crate::Result<Box<dyn Lifecycle>> {
        (**self).start_lifecycle(request, config)
    }
}

/// One request/response exchange over one physical connection.
///
/// HTTP/1.1, HTTP/2 and HTTP/3 exchanges, proxied or direct, are all variants
/// of this interface.
pub trait Lifecycle: Send {
    /// What the TLS layer agreed on. Cleartext connections report the default.
    fn negotiated(&self) -> Negotiated;

    /// Registers the connection under `key`. Called once it is resolved, and
    /// again if the exchange made the connection private.
    fn assign_key(&mut self, key: ConnectionKey);

    fn send_request_data(&mut self, data: Bytes) -> crate::Result<()>;

    fn send_eof(&mut self, trailers: Option<HeaderMap>) -> crate::Result<()>;

    /// Collapses any 1xx responses into `informational` and returns the first
    /// final response.
    fn receive_response_headers(&mut self) -> crate::Result<ReceivedResponse>;

    /// Up to `max` body bytes; empty once the body is exhausted.
    fn receive_response_data(&mut self, max: usize) -> crate::Result<Bytes>;

    /// Absent until the body has been drained.
    fn response_trailers(&self) -> Option<HeaderMap> {
        None
    }

    /// Releases the connection. A lifecycle closed before its body was
    /// drained must not return the connection for reuse.
    fn close(&mut self);
}
