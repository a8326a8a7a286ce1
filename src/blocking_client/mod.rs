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

pub use body::RequestData;
pub use request::RequestBuilder;
pub use response::{Response, ResponseChunks, TextChunks};
pub use transport::{Lifecycle, Transport};

/// A blocking HTTP session.
///
/// Every request issued through one `Session` shares its cookie jar, HSTS and
/// Alt-Svc records, TLS tickets and response cache, and is sent over
/// connections keyed to this session's identity when it carries credentials.
pub struct Session {
    core: Arc<SessionCore>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Session")
            .field("id", &self.core.id())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new<T>(config: SessionConfig, transport: T) -> crate::Result<Self>
    where
        T: Transport + 'static,
    {
        Self::with_transport_arc(config, Arc::new(transport))
    }

    pub fn with_transport_arc(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
    ) -> crate::Result<Self> {
        Ok(Self {
            core: Arc::new(SessionCore::new(config)?),
            transport,
        })
    }

    pub fn id(&self) -> SessionId {
        self.core.id()
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, parse_url(url))
    }

    pub fn get(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::GET, url)
    }

    pub fn head(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::HEAD, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::PUT, url)
    }

    pub fn patch(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::PATCH, url)
    }

    pub fn delete(&self, url: &str) -> RequestBuilder<'_> {
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

    /// The backing store shared by this session's requests.
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        self.core.store().store()
    }

    pub fn metrics_snapshot(&self) -> SessionMetricsSnapshot {
        self.core.metrics_snapshot()
    }
}
