use std::sync::Arc;

use http::header::{ACCEPT, HeaderName, HeaderValue, USER_AGENT};
use http::HeaderMap;

use crate::core::auth::Authenticator;
use crate::core::extensions::{Clock, SystemClock};
use crate::core::observe::{NoopObserver, Observer};
use crate::core::policy::RedirectPolicy;
use crate::core::proxy::ProxyConfig;
use crate::core::retry::RetryState;
use crate::core::store::{Hsts, StoreSelection};
use crate::core::tls::TlsSettings;
use crate::core::util::{parse_header_name, parse_header_value};

pub(crate) const DEFAULT_USER_AGENT: &str = concat!("reqx-session/", env!("CARGO_PKG_VERSION"));

/// Session-wide settings, fixed when the session is built.
#[derive(Clone)]
pub struct SessionConfig {
    pub(crate) default_headers: HeaderMap,
    pub(crate) retry: RetryState,
    pub(crate) redirect_policy: RedirectPolicy,
    pub(crate) tls: TlsSettings,
    pub(crate) proxy: Option<ProxyConfig>,
    pub(crate) store: StoreSelection,
    pub(crate) hsts_preload: Vec<Hsts>,
    pub(crate) metrics_enabled: bool,
    pub(crate) observer: Arc<dyn Observer>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SessionConfig")
            .field("default_headers", &self.default_headers)
            .field("retry", &self.retry)
            .field("redirect_policy", &self.redirect_policy)
            .field("tls", &self.tls)
            .field("proxy", &self.proxy)
            .field("store", &self.store)
            .field("hsts_preload", &self.hsts_preload)
            .field("metrics_enabled", &self.metrics_enabled)
            .field("authenticator", &self.authenticator.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    pub fn retry(&self) -> &RetryState {
        &self.retry
    }

    pub fn redirect_policy(&self) -> RedirectPolicy {
        self.redirect_policy
    }

    pub fn tls(&self) -> &TlsSettings {
        &self.tls
    }

    pub fn default_headers(&self) -> &HeaderMap {
        &self.default_headers
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfigBuilder::new().into_config()
    }
}

pub struct SessionConfigBuilder {
    default_headers: HeaderMap,
    retry: RetryState,
    redirect_policy: RedirectPolicy,
    tls: TlsSettings,
    proxy: Option<ProxyConfig>,
    trust_env: bool,
    store: StoreSelection,
    hsts_preload: Vec<Hsts>,
    metrics_enabled: bool,
    observer: Arc<dyn Observer>,
    clock: Arc<dyn Clock>,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl SessionConfigBuilder {
    fn new() -> Self {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        default_headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        Self {
            default_headers,
            retry: RetryState::standard(),
            redirect_policy: RedirectPolicy::follow(),
            tls: TlsSettings::default(),
            proxy: None,
            trust_env: false,
            store: StoreSelection::None,
            hsts_preload: Vec::new(),
            metrics_enabled: false,
            observer: Arc::new(NoopObserver),
            clock: Arc::new(SystemClock),
            authenticator: None,
        }
    }

    /// Replaces any default already set under `name`.
    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let header_name = parse_header_name(name)?;
        let header_value = parse_header_value(name, value)?;
        Ok(self.default_header(header_name, header_value))
    }

    pub fn clear_default_headers(mut self) -> Self {
        self.default_headers.clear();
        self
    }

    /// Template cloned into every request; requests may override it.
    pub fn retry(mut self, retry: RetryState) -> Self {
        self.retry = retry;
        self
    }

    pub fn redirect_policy(mut self, redirect_policy: RedirectPolicy) -> Self {
        self.redirect_policy = redirect_policy;
        self
    }

    pub fn tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Reads proxy settings from the environment at build time when no proxy
    /// was configured explicitly.
    pub fn trust_env(mut self, trust_env: bool) -> Self {
        self.trust_env = trust_env;
        self
    }

    pub fn store(mut self, store: impl Into<StoreSelection>) -> Self {
        self.store = store.into();
        self
    }

    pub fn memory_store(self) -> Self {
        self.store(StoreSelection::Memory)
    }

    pub fn hsts_preload(mut self, host: &str, include_subdomains: bool) -> Self {
        self.hsts_preload
            .push(Hsts::preloaded(host, include_subdomains));
        self
    }

    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn observer_arc(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn observer<O>(self, observer: O) -> Self
    where
        O: Observer + 'static,
    {
        self.observer_arc(Arc::new(observer))
    }

    pub fn clock_arc(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock<C>(self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock_arc(Arc::new(clock))
    }

    pub fn authenticator_arc(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn authenticator<A>(self, authenticator: A) -> Self
    where
        A: Authenticator + 'static,
    {
        self.authenticator_arc(Arc::new(authenticator))
    }

    pub fn build(self) -> crate::Result<SessionConfig> {
        self.tls.validate()?;
        Ok(self.into_config())
    }

    fn into_config(self) -> SessionConfig {
        let proxy = match self.proxy {
            Some(proxy) => Some(proxy),
            None if self.trust_env => ProxyConfig::from_env(),
            None => None,
        };
        SessionConfig {
            default_headers: self.default_headers,
            retry: self.retry,
            redirect_policy: self.redirect_policy,
            tls: self.tls,
            proxy,
            store: self.store,
            hsts_preload: self.hsts_preload,
            metrics_enabled: self.metrics_enabled,
            observer: self.observer,
            clock: self.clock,
            authenticator: self.authenticator,
        }
    }
}
