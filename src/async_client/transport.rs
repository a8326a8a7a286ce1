use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::HeaderMap;

use crate::core::affinity::{ConnectionConfig, ConnectionKey, Negotiated};
use crate::core::request::RequestHead;
use crate::core::response::ReceivedResponse;

/// Connection Manager for the async session. See the blocking `Transport`
/// for the error contract.
pub trait AsyncTransport: Send + Sync {
    fn start_lifecycle<'a>(
        &'a self,
        request: &'a RequestHead,
        config: &'a ConnectionConfig,
    ) -> BoxFuture<'a, crate::Result<Box<dyn AsyncLifecycle>>>;
}

impl<T: AsyncTransport + ?Sized> AsyncTransport for std::sync::Arc<T> {
    fn start_lifecycle<'a>(
        &'a self,
        request: &'a RequestHead,
        config: &'a ConnectionConfig,
    ) -> BoxFuture<'a, crate::Result<Box<dyn AsyncLifecycle>>> {
        (**self).start_lifecycle(request, config)
    }
}

/// One request/response exchange over one physical connection.
pub trait AsyncLifecycle: Send {
    fn negotiated(&self) -> Negotiated;

    fn assign_key(&mut self, key: ConnectionKey);

    fn send_request_data(&mut self, data: Bytes) -> BoxFuture<'_, crate::Result<()>>;

    fn send_eof(&mut self, trailers: Option<HeaderMap>) -> BoxFuture<'_, crate::Result<()>>;

    fn receive_response_headers(&mut self) -> BoxFuture<'_, crate::Result<ReceivedResponse>>;

    /// Up to `max` body bytes; empty once the body is exhausted.
    fn receive_response_data(&mut self, max: usize) -> BoxFuture<'_, crate::Result<Bytes>>;

    fn response_trailers(&self) -> Option<HeaderMap> {
        None
    }

    /// Must not block; it also runs from `Drop`.
    fn close(&mut self);
}
