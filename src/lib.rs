//! `reqx-session` is the orchestration core of an HTTP client: it turns one
//! logical request into the wire attempts needed to answer it.
//!
//! A session owns the retry template, redirect policy, TLS identity and a
//! pluggable store for cookies, HSTS, Alt-Svc hints, permanent redirects,
//! TLS session tickets and cached responses. The wire itself is supplied by
//! the caller as a [`Transport`] (or [`AsyncTransport`]), which opens one
//! [`Lifecycle`] per attempt over a connection matching the
//! [`ConnectionConfig`] it is handed.
//!
//! # Quick Start
//!
//! ```no_run
//! # #[cfg(feature = "blocking")]
//! # fn run(transport: impl reqx_session::Transport + 'static) -> reqx_session::Result<()> {
//! use std::time::Duration;
//! use reqx_session::prelude::{RetryState, Session, SessionConfig};
//!
//! let config = SessionConfig::builder()
//!     .memory_store()
//!     .retry(
//!         RetryState::standard()
//!             .total_retries(3)
//!             .backoff_factor(Duration::from_millis(100)),
//!     )
//!     .build()?;
//! let session = Session::new(config, transport)?;
//!
//! let mut response = session.get("http://example.com/").send()?.raise_for_status()?;
//! println!("{} after {} redirects", response.text()?, response.history().len());
//! # Ok(())
//! # }
//! ```
//!
//! # Recommended Defaults
//!
//! - Keep `RetryState::standard()`; it only retries idempotent methods.
//! - Use a `FileStore` when HSTS and permanent redirects should survive restarts.
//! - Opt into cached answers per request with `prefer_cache()`.

mod core;

#[cfg(feature = "_async")]
mod async_client;
#[cfg(feature = "_blocking")]
mod blocking_client;

#[cfg(feature = "_async")]
pub use crate::async_client::{
    AsyncLifecycle, AsyncRequestBuilder, AsyncRequestData, AsyncResponse, AsyncSession,
    AsyncTransport,
};
#[cfg(feature = "_blocking")]
pub use crate::blocking_client::{
    Lifecycle, RequestBuilder, RequestData, Response, ResponseChunks, Session, TextChunks,
    Transport,
};
pub use crate::core::affinity::{
    ConnectionConfig, ConnectionKey, ConnectionRegistry, Negotiated, PoolEntry, SensitivitySignals,
    SessionId,
};
pub use crate::core::auth::{Authenticator, BasicAuth, BearerAuth};
pub use crate::core::cancel::CancelHandle;
pub use crate::core::config::{SessionConfig, SessionConfigBuilder};
pub use crate::core::directives::CacheDirectives;
pub use crate::core::error::{Error, ErrorCode, FailedRequest, TimeoutPhase, TransportErrorKind};
pub use crate::core::extensions::{Clock, ManualClock, SystemClock};
pub use crate::core::metrics::SessionMetricsSnapshot;
pub use crate::core::observe::Observer;
pub use crate::core::origin::{Origin, Scheme};
pub use crate::core::policy::{CacheMode, RedirectPolicy, RequestContext};
pub use crate::core::proxy::{ProxyConfig, ProxyTarget};
pub use crate::core::request::{BodyShape, RequestHead};
pub use crate::core::response::{
    FailedAttempt, HistoryEntry, Interim, ReceivedResponse, ResponseHead, TextEncoding,
};
pub use crate::core::retry::{
    AttemptOutcome, RetryCause, RetryClassifier, RetryDecision, RetryState,
};
pub use crate::core::store::{
    AltSvc, CachedResponse, FileStore, Hsts, MemoryStore, NoStore, OriginRecord, SessionStore,
    StoreCategory, StoreSelection, StoredCookie, select_store,
};
pub use crate::core::tls::{
    Alpn, CaTrust, CertFingerprint, ClientIdentity, FingerprintAlgorithm, TlsRootCertificate,
    TlsRootStore, TlsSessionTicket, TlsSettings, TlsVersion,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    #[cfg(feature = "_async")]
    pub use crate::{AsyncResponse, AsyncSession, AsyncTransport};
    #[cfg(feature = "_blocking")]
    pub use crate::{Response, Session, Transport};
    pub use crate::{
        CacheMode, CancelHandle, ConnectionConfig, ConnectionKey, Error, ErrorCode, HistoryEntry,
        Origin, RedirectPolicy, Result, RetryState, SessionConfig, SessionMetricsSnapshot,
        StoreCategory, StoreSelection, TlsSettings,
    };
}
