use std::sync::Arc;

use http::Method;

use crate::core::affinity::SessionId;
use crate::core::config::SessionConfig;
use crate::core::metrics::SessionMetricsSnapshot;
use crate::core::orchestrator::SessionCore;
use crate::core::origin::Origin;
use crate::core::store::{SessionStore, StoreCategory};
use crate::core::util::parse_url;

mod body;
mod execute;
mod request;
mod response;
mod transport;

pub use body::AsyncRequestData;
pub use request::AsyncRequestBuilder;
pub use response::AsyncResponse;
pub use transport::{AsyncLifecycle, AsyncTransport};

/// The async counterpart of the blocking `Session`. Requests share the same
/// store and connection-affinity rules.
pub struct AsyncSession {
    core: Arc<SessionCore>,
    transport: Arc<dyn AsyncTransport>,
}

impl std::fmt::Debug for AsyncSession {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AsyncSession")
            .field("id", &self.core.id())
            .finish_non_exhaustive()
    }
}

impl AsyncSession {
    pub fn new<T>(config: SessionConfig, transport: T) -> crate::Result<Self>
    where
        T: AsyncTransport + 'static,
    {
        Self::with_transport_arc(config, Arc::new(transport))
    }

    pub fn with_transport_arc(
        config: SessionConfig,
        transport: Arc<dyn AsyncTransport>,
    ) -> crate::Result<Self> {
        Ok(Self {
            core: Arc::new(SessionCore::new(config)?),
            transport,
        })
    }

    pub fn id(&self) -> SessionId {
        self.core.id()
    }

    pub fn request(&self, method: Method, url: &str) -> AsyncRequestBuilder<'_> {
        AsyncRequestBuilder::new(self, method, parse_url(url))
    }

    pub fn get(&self, url: &str) -> AsyncRequestBuilder<'_> {
        self.request(Method::GET, url)
    }

    pub fn head(&self, url: &str) -> AsyncRequestBuilder<'_> {
        self.request(Method::HEAD, url)
    }

    pub fn post(&self, url: &str) -> AsyncRequestBuilder<'_> {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: &str) -> AsyncRequestBuilder<'_> {
        self.request(Method::PUT, url)
    }

    pub fn patch(&self, url: &str) -> AsyncRequestBuilder<'_> {
        self.request(Method::PATCH, url)
    }

    pub fn delete(&self, url: &str) -> AsyncRequestBuilder<'_> {
        self.request(Method::DELETE, url)
    }

    /// Drops stored state for `origin`; `None` clears every category.
    pub fn clear(
        &self,
        origin: &Origin,
        categories: Option<&[StoreCategory]>,
    ) -> crate::Result<()> {
        self.core.clear(origin, categories)
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        self.core.store().store()
    }

    pub fn metrics_snapshot(&self) -> SessionMetricsSnapshot {
        self.core.metrics_snapshot()
    }
}
