use http::Method;

use crate::core::affinity::SessionId;

const DEFAULT_MAX_REDIRECTS: usize = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedirectPolicy {
    enabled: bool,
    max_redirects: usize,
}

impl RedirectPolicy {
    /// Redirect responses are returned to the caller as-is.
    pub const fn none() -> Self {
        Self {
            enabled: false,
            max_redirects: 0,
        }
    }

    pub const fn limited(max_redirects: usize) -> Self {
        Self {
            enabled: true,
            max_redirects,
        }
    }

    pub const fn follow() -> Self {
        Self::limited(DEFAULT_MAX_REDIRECTS)
    }

    pub const fn enabled(self) -> bool {
        self.enabled
    }

    pub const fn max_redirects(self) -> usize {
        if self.enabled { self.max_redirects } else { 0 }
    }
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::follow()
    }
}

/// Whether a request may be answered from the session's response cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheMode {
    /// Always go to the network. Cacheable responses are still stored.
    #[default]
    Network,
    /// Serve a fresh cached response when one exists.
    PreferCache,
}

/// Snapshot of where a logical request stands, handed to observers.
#[derive(Clone, Debug)]
pub struct RequestContext {
    session: SessionId,
    method: Method,
    uri: String,
    attempt: usize,
    redirect_count: usize,
}

impl RequestContext {
    pub(crate) fn new(
        session: SessionId,
        method: Method,
        uri: String,
        attempt: usize,
        redirect_count: usize,
    ) -> Self {
        Self {
            session,
            method,
            uri,
            attempt,
            redirect_count,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Redacted request URI: no userinfo, query or fragment.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn redirect_count(&self) -> usize {
        self.redirect_count
    }
}
