//! The attempt loop shared by the blocking and async sessions.
//!
//! [`Exchange`] owns every decision of one logical request: store read-path
//! adjustments, connection resolution, retry and redirect handling, history
//! and store write-back. It performs no I/O. The two drivers ask it for the
//! next [`Action`], run that action against their transport, and report what
//! happened through `on_connected`, `on_response` and `on_error`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{AUTHORIZATION, COOKIE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Version};
use tracing::{Span, debug, field, info, info_span, warn};
use url::Url;

use crate::core::affinity::{
    ConnectionConfig, ConnectionKey, Negotiated, SensitivitySignals, SessionId,
};
use crate::core::auth::{Authenticator, BasicAuth, take_userinfo};
use crate::core::cancel::CancelHandle;
use crate::core::config::SessionConfig;
use crate::core::error::{Error, FailedRequest};
use crate::core::metrics::{InFlightGuard, SessionMetrics, SessionMetricsSnapshot};
use crate::core::origin::{Origin, Scheme};
use crate::core::policy::{CacheMode, RedirectPolicy, RequestContext};
use crate::core::request::{
    BodyShape, RequestHead, apply_accept_encoding, apply_default_headers, apply_framing,
    apply_host_header,
};
use crate::core::response::{FailedAttempt, HistoryEntry, ReceivedResponse, ResponseHead};
use crate::core::retry::{AttemptOutcome, RetryCause, RetryState};
use crate::core::store::{
    CachePlan, CachedResponse, StoreCategory, StoreCoordinator, cached_status, select_store,
};
use crate::core::tls::TlsSessionTicket;
use crate::core::util::{
    is_redirect_status, keeps_credentials_on_redirect, redact_uri_for_logs, redirect_location,
    redirect_method, resolve_redirect_url, sanitize_headers_for_redirect,
};

/// State shared by every request of one session.
#[derive(Debug)]
pub(crate) struct SessionCore {
    id: SessionId,
    config: SessionConfig,
    store: StoreCoordinator,
    metrics: SessionMetrics,
}

impl SessionCore {
    pub(crate) fn new(config: SessionConfig) -> crate::Result<Self> {
        let metrics = if config.metrics_enabled {
            SessionMetrics::enabled()
        } else {
            SessionMetrics::disabled()
        };
        let backend = select_store(config.store.clone())?;
        let store = StoreCoordinator::new(
            backend,
            config.hsts_preload.iter().cloned(),
            Arc::clone(&config.clock),
            metrics.clone(),
            Arc::clone(&config.observer),
        );
        Ok(Self {
            id: SessionId::next(),
            config,
            store,
            metrics,
        })
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &StoreCoordinator {
        &self.store
    }

    pub(crate) fn metrics_snapshot(&self) -> SessionMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn clear(
        &self,
        origin: &Origin,
        categories: Option<&[StoreCategory]>,
    ) -> crate::Result<()> {
        self.store.clear(origin, categories)
    }
}

/// Per-request overrides of the session configuration.
#[derive(Clone, Default)]
pub(crate) struct RequestOptions {
    pub(crate) retry: Option<RetryState>,
    pub(crate) redirect_policy: Option<RedirectPolicy>,
    pub(crate) cache_mode: CacheMode,
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
    pub(crate) cancel: Option<CancelHandle>,
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestOptions")
            .field("retry", &self.retry)
            .field("redirect_policy", &self.redirect_policy)
            .field("cache_mode", &self.cache_mode)
            .field("authenticator", &self.authenticator.is_some())
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AttemptState {
    Preparing,
    Dispatching,
    AwaitingResponse,
    Retrying,
    Redirecting,
    Done,
    Failed,
}

impl AttemptState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Dispatching => "dispatching",
            Self::AwaitingResponse => "awaiting_response",
            Self::Retrying => "retrying",
            Self::Redirecting => "redirecting",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// One attempt the driver must perform.
#[derive(Debug)]
pub(crate) struct Dispatch {
    pub(crate) request: Arc<RequestHead>,
    pub(crate) connection: ConnectionConfig,
    /// A resend: the body must be back at its first byte before sending.
    pub(crate) rewind: bool,
    pub(crate) send_body: bool,
}

/// A fresh stored response that satisfies the request without the network.
#[derive(Debug)]
pub(crate) struct CachedHit {
    pub(crate) head: ResponseHead,
    pub(crate) history: Vec<HistoryEntry>,
    pub(crate) body: Bytes,
}

#[derive(Debug)]
pub(crate) enum Action {
    Cached(CachedHit),
    Dispatch(Dispatch),
}

/// The final response of a logical request, handed to the caller.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub(crate) head: ResponseHead,
    pub(crate) history: Vec<HistoryEntry>,
    pub(crate) cache: Option<CachePlan>,
}

#[derive(Debug)]
pub(crate) enum Verdict {
    Deliver(Delivery),
    Retry(Duration),
    Redirect,
    Fail(Error),
}

#[derive(Debug)]
struct Attempt {
    request: Arc<RequestHead>,
    origin: Origin,
    connection: ConnectionConfig,
    signals: SensitivitySignals,
    key: Option<ConnectionKey>,
    new_ticket: Option<TlsSessionTicket>,
}

pub(crate) struct Exchange {
    core: Arc<SessionCore>,
    request: RequestHead,
    body: BodyShape,
    body_dropped: bool,
    retry: RetryState,
    redirect_policy: RedirectPolicy,
    cache_mode: CacheMode,
    authenticator: Option<Arc<dyn Authenticator>>,
    userinfo: Option<BasicAuth>,
    credential_origin: Option<Origin>,
    cancel: Option<CancelHandle>,
    state: AttemptState,
    attempts: usize,
    redirects: usize,
    visited: Vec<Url>,
    history: Vec<HistoryEntry>,
    apply_stored_redirects: bool,
    needs_rewind: bool,
    retries_exhausted: bool,
    current: Option<Attempt>,
    rekey: Option<ConnectionKey>,
    span: Span,
    started: Instant,
    _in_flight: InFlightGuard,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Exchange")
            .field("method", self.request.method())
            .field("uri", &redact_uri_for_logs(self.request.url()))
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .field("redirects", &self.redirects)
            .finish_non_exhaustive()
    }
}

impl Exchange {
    pub(crate) fn new(
        core: Arc<SessionCore>,
        mut request: RequestHead,
        body: BodyShape,
        options: RequestOptions,
    ) -> Self {
        let mut url = request.url().clone();
        let userinfo = take_userinfo(&mut url);
        request.set_url(url);
        let credential_origin = request.origin().ok();

        let span = info_span!(
            "reqx.request",
            session = %core.id,
            method = %request.method(),
            uri = %redact_uri_for_logs(request.url()),
            attempt = field::Empty,
        );
        core.metrics.record_request_started();
        let in_flight = core.metrics.enter_in_flight();
        let retry = options.retry.unwrap_or_else(|| core.config.retry.clone());
        let redirect_policy = options
            .redirect_policy
            .unwrap_or(core.config.redirect_policy);
        let authenticator = options
            .authenticator
            .or_else(|| core.config.authenticator.clone());
        Self {
            retry,
            redirect_policy,
            cache_mode: options.cache_mode,
            authenticator,
            visited: vec![request.url().clone()],
            core,
            request,
            body,
            body_dropped: false,
            userinfo,
            credential_origin,
            cancel: options.cancel,
            state: AttemptState::Preparing,
            attempts: 0,
            redirects: 0,
            history: Vec::new(),
            apply_stored_redirects: true,
            needs_rewind: false,
            retries_exhausted: false,
            current: None,
            rekey: None,
            span,
            started: Instant::now(),
            _in_flight: in_flight,
        }
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    pub(crate) fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    pub(crate) fn cancel_handle(&self) -> Option<&CancelHandle> {
        self.cancel.as_ref()
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelHandle::is_canceled)
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts
    }

    fn transition(&mut self, next: AttemptState) {
        debug!(
            from = self.state.as_str(),
            to = next.as_str(),
            attempt = self.attempts,
            redirects = self.redirects,
            "attempt state changed"
        );
        self.state = next;
    }

    fn context(&self) -> RequestContext {
        RequestContext::new(
            self.core.id,
            self.request.method().clone(),
            redact_uri_for_logs(self.request.url()),
            self.attempts,
            self.redirects,
        )
    }

    fn canceled_error(&self) -> Error {
        Error::Canceled {
            method: self.request.method().clone(),
            uri: self.request.url().to_string(),
        }
    }

    /// Runs the store read path and builds the next attempt, or answers from
    /// the response cache. Errors returned here are already terminal.
    pub(crate) fn prepare(&mut self) -> crate::Result<Action> {
        let span = self.span.clone();
        let _entered = span.enter();
        if self.state != AttemptState::Preparing {
            self.transition(AttemptState::Preparing);
        }
        if self.is_canceled() {
            let error = self.canceled_error();
            return Err(self.fail(error));
        }
        match self.prepare_attempt() {
            Ok(action) => Ok(action),
            Err(error) => Err(self.fail(error)),
        }
    }

    fn prepare_attempt(&mut self) -> crate::Result<Action> {
        if self.apply_stored_redirects {
            self.apply_stored_redirects = false;
            self.apply_permanent_redirects();
        }
        self.apply_hsts()?;

        if self.cache_mode == CacheMode::PreferCache
            && let Some(hit) = self.cached_response()
        {
            return Ok(Action::Cached(hit));
        }

        let origin = self.request.origin()?;
        let config = &self.core.config;
        let mut headers = self.request.headers().clone();
        apply_default_headers(&mut headers, &config.default_headers);
        apply_host_header(&mut headers, &origin);
        apply_accept_encoding(&mut headers);
        if !headers.contains_key(COOKIE)
            && let Some(cookies) = self.core.store.cookie_header(&origin, self.request.url())
            && let Ok(value) = HeaderValue::from_str(&cookies)
        {
            headers.insert(COOKIE, value);
        }
        let authenticated = self.attach_authorization(&origin, &mut headers)?;
        let body = (!self.body_dropped).then_some(&self.body);
        apply_framing(&mut headers, self.request.method(), body);
        let wire = self.request.clone().with_headers(headers);

        let (connection, signals) = self.connection_config(&origin, &wire, authenticated);
        let send_body = self.body.present && !self.body_dropped;
        let rewind = send_body && self.needs_rewind;
        self.needs_rewind = false;

        self.attempts += 1;
        self.span.record("attempt", self.attempts);
        self.core.metrics.record_attempt();
        self.core.config.observer.on_attempt_start(&self.context());

        let request = Arc::new(wire);
        self.current = Some(Attempt {
            request: Arc::clone(&request),
            origin,
            connection: connection.clone(),
            signals,
            key: None,
            new_ticket: None,
        });
        self.transition(AttemptState::Dispatching);
        Ok(Action::Dispatch(Dispatch {
            request,
            connection,
            rewind,
            send_body,
        }))
    }

    fn apply_permanent_redirects(&mut self) {
        if !self.redirect_policy.enabled() {
            return;
        }
        let limit = self
            .redirect_policy
            .max_redirects()
            .saturating_sub(self.redirects);
        let Some(target) = self
            .core
            .store
            .resolve_permanent_redirects(self.request.url(), limit)
        else {
            return;
        };
        info!(
            from = %redact_uri_for_logs(self.request.url()),
            to = %redact_uri_for_logs(&target),
            "applying stored permanent redirect"
        );
        self.request.set_url(target.clone());
        self.request.clear_target();
        self.visited.push(target);
    }

    fn apply_hsts(&mut self) -> crate::Result<()> {
        if self.request.url().scheme() != Scheme::Http.as_str() {
            return Ok(());
        }
        let origin = self.request.origin()?;
        if self.core.store.get_hsts(&origin).is_none() {
            return Ok(());
        }
        let mut upgraded = self.request.url().clone();
        if upgraded.set_scheme(Scheme::Https.as_str()).is_err() {
            return Ok(());
        }
        info!(
            host = origin.host(),
            to = %redact_uri_for_logs(&upgraded),
            "upgrading request to https due to hsts"
        );
        self.core.metrics.record_hsts_upgrade();
        self.request.set_url(upgraded);
        Ok(())
    }

    fn cached_response(&mut self) -> Option<CachedHit> {
        let cached = self.core.store.get_cached_response(&self.request)?;
        let head = ResponseHead::new(
            cached_status(&cached),
            Version::HTTP_11,
            cached_headers(&cached),
            Arc::new(self.request.clone()),
        );
        debug!(status = cached.status, "serving response from session cache");
        self.core.metrics.record_cache_hit();
        self.core
            .metrics
            .record_request_succeeded(head.status(), self.started.elapsed());
        self.transition(AttemptState::Done);
        Some(CachedHit {
            head,
            history: std::mem::take(&mut self.history),
            body: Bytes::from(cached.body),
        })
    }

    /// Adds `Authorization` unless the caller set one. Returns whether
    /// credentials were attached here.
    fn attach_authorization(
        &self,
        origin: &Origin,
        headers: &mut HeaderMap,
    ) -> crate::Result<bool> {
        if headers.contains_key(AUTHORIZATION) {
            return Ok(false);
        }
        let trusted = self
            .credential_origin
            .as_ref()
            .is_some_and(|original| keeps_credentials_on_redirect(original, origin));
        if !trusted {
            return Ok(false);
        }
        let value = match (&self.authenticator, &self.userinfo) {
            (Some(authenticator), _) => authenticator.authorization(&self.request)?,
            (None, Some(userinfo)) => userinfo.authorization(&self.request)?,
            (None, None) => None,
        };
        match value {
            Some(value) => {
                headers.insert(AUTHORIZATION, value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn connection_config(
        &self,
        origin: &Origin,
        wire: &RequestHead,
        authenticated: bool,
    ) -> (ConnectionConfig, SensitivitySignals) {
        let config = &self.core.config;
        let tls = &config.tls;

        let alternate = if origin.is_tls() {
            self.core
                .store
                .get_altsvc(origin)
                .into_iter()
                .find(|entry| tls.alpn_protocols.contains(&entry.alpn))
        } else {
            None
        };
        let (endpoint, alpn_protocols) = match alternate {
            Some(alternate) => {
                debug!(
                    alpn = %alternate.alpn,
                    host = %alternate.host,
                    port = alternate.port,
                    "using alternate service"
                );
                (
                    origin.with_endpoint(alternate.host, alternate.port),
                    vec![alternate.alpn],
                )
            }
            None => (origin.clone(), tls.alpn_protocols.clone()),
        };
        let session_ticket = if origin.is_tls() {
            self.core.store.get_tls_session_ticket(origin)
        } else {
            None
        };

        let signals = SensitivitySignals::before_dispatch(
            tls.client_identity.as_ref(),
            wire.headers(),
            authenticated,
        );
        let session = signals.session_for(SessionId::SHARED, self.core.id);
        if !session.is_shared() {
            info!(session = %session, "connection is private to this session");
            self.core.metrics.record_private_escalation();
        }

        let connection = ConnectionConfig::new(endpoint)
            .server_hostname(origin.host())
            .ca_trust(tls.ca_trust.clone())
            .client_identity(tls.client_identity.clone())
            .tls_versions(tls.min_version, tls.max_version)
            .alpn_protocols(alpn_protocols)
            .pinned_certs(tls.pins_for(origin.host()))
            .proxy(
                config
                    .proxy
                    .as_ref()
                    .and_then(|proxy| proxy.target_for(origin)),
            )
            .session_ticket(session_ticket)
            .session_id(session);
        (connection, signals)
    }

    /// Resolves the exact connection identity once the transport has
    /// connected. Pin, version and protocol failures come back as errors for
    /// `on_error`.
    pub(crate) fn on_connected(
        &mut self,
        mut negotiated: Negotiated,
    ) -> crate::Result<ConnectionKey> {
        let span = self.span.clone();
        let _entered = span.enter();
        if self.is_canceled() {
            return Err(self.canceled_error());
        }
        let owner = self.core.id;
        let Some(attempt) = self.current.as_mut() else {
            return Err(self.canceled_error());
        };
        let mut key = attempt.connection.resolve(&negotiated)?;
        attempt.signals = attempt.signals.with_negotiation(&negotiated);
        if attempt.signals.session_for(key.session_id(), owner) != key.session_id() {
            key = key.escalate(owner);
            info!(session = %key.session_id(), "tls resumption made the connection private");
            self.core.metrics.record_private_escalation();
        }
        attempt.new_ticket = negotiated.new_session_ticket.take();
        attempt.key = Some(key.clone());
        self.transition(AttemptState::AwaitingResponse);
        Ok(key)
    }

    /// A key the live lifecycle must be re-registered under, set when the
    /// last response made a shared connection private.
    pub(crate) fn take_rekey(&mut self) -> Option<ConnectionKey> {
        self.rekey.take()
    }

    pub(crate) fn on_response(&mut self, received: ReceivedResponse) -> Verdict {
        let span = self.span.clone();
        let _entered = span.enter();
        if self.is_canceled() {
            let error = self.canceled_error();
            return Verdict::Fail(self.fail(error));
        }
        let Some(attempt) = self.current.take() else {
            let error = self.canceled_error();
            return Verdict::Fail(self.fail(error));
        };

        let ReceivedResponse {
            status,
            version,
            headers,
            informational,
        } = received;
        for interim in informational {
            self.history.push(HistoryEntry::Response(ResponseHead::new(
                interim.status,
                interim.version,
                interim.headers,
                Arc::clone(&attempt.request),
            )));
        }
        let head = ResponseHead::new(status, version, headers, Arc::clone(&attempt.request));

        self.core.store.record_response(&head);
        if let Some(ticket) = attempt.new_ticket {
            self.core.store.record_tls_ticket(&attempt.origin, ticket);
        }
        let signals = attempt.signals.with_response(head.headers());
        if let Some(key) = &attempt.key
            && signals.session_for(key.session_id(), self.core.id) != key.session_id()
        {
            let escalated = key.escalate(self.core.id);
            info!(session = %escalated.session_id(), "set-cookie made the connection private");
            self.core.metrics.record_private_escalation();
            self.rekey = Some(escalated);
        }

        if is_redirect_status(status)
            && self.redirect_policy.enabled()
            && let Some(location) = redirect_location(head.headers())
        {
            return self.follow_redirect(head, &attempt.origin, &location);
        }

        let outcome = AttemptOutcome::Response(&head);
        if let Some(cause) = self.retry.classify(outcome) {
            if self.retry.should_retry(&self.request, outcome).is_some() {
                let delay = self
                    .retry
                    .delay_before_next_request(Some(&head), self.core.config.clock.now_system());
                debug!(
                    status = status.as_u16(),
                    delay_ms = delay.as_millis() as u64,
                    "retrying request after retryable status"
                );
                self.history.push(HistoryEntry::Response(head));
                return self.schedule_retry(cause, delay);
            }
            self.retries_exhausted = !self.retry.has_budget(cause);
        }

        self.deliver(head)
    }

    fn follow_redirect(&mut self, head: ResponseHead, from: &Origin, location: &str) -> Verdict {
        let status = head.status();
        if self.redirects >= self.redirect_policy.max_redirects() {
            let error = Error::TooManyRedirects {
                max_redirects: self.redirect_policy.max_redirects(),
                method: self.request.method().clone(),
                uri: self.request.url().to_string(),
            };
            return Verdict::Fail(self.fail_with_response(error, Some(head)));
        }
        let Some(target) = resolve_redirect_url(head.url(), location) else {
            let error = Error::InvalidRedirectLocation {
                location: location.to_owned(),
                method: self.request.method().clone(),
                uri: self.request.url().to_string(),
            };
            return Verdict::Fail(self.fail_with_response(error, Some(head)));
        };
        if self.visited.contains(&target) {
            let mut chain: Vec<String> = self.visited.iter().map(redact_uri_for_logs).collect();
            chain.push(redact_uri_for_logs(&target));
            let error = Error::RedirectLoop {
                uri: redact_uri_for_logs(&target),
                chain,
            };
            return Verdict::Fail(self.fail_with_response(error, Some(head)));
        }
        let to = match Origin::from_url(&target) {
            Ok(origin) => origin,
            Err(error) => return Verdict::Fail(self.fail_with_response(error, Some(head))),
        };

        let method = redirect_method(self.request.method(), status);
        let changed_to_get = method == Method::GET && *self.request.method() != Method::GET;
        sanitize_headers_for_redirect(
            self.request.headers_mut(),
            changed_to_get,
            *from == to,
            keeps_credentials_on_redirect(from, &to),
        );
        if changed_to_get {
            self.body_dropped = true;
        } else if self.body.present && !self.body_dropped {
            self.needs_rewind = true;
        }

        let from_uri = redact_uri_for_logs(head.url());
        let to_uri = redact_uri_for_logs(&target);
        self.request.set_method(method);
        self.request.set_url(target.clone());
        self.request.clear_target();
        self.visited.push(target);
        self.retry = self.retry.performed_http_redirect();
        self.redirects += 1;
        self.apply_stored_redirects = true;
        self.history.push(HistoryEntry::Response(head));
        self.core.metrics.record_redirect();
        self.core
            .config
            .observer
            .on_redirect(&self.context(), &from_uri, &to_uri, status);
        debug!(status = status.as_u16(), to = %to_uri, "following redirect");
        self.transition(AttemptState::Redirecting);
        Verdict::Redirect
    }

    fn deliver(&mut self, head: ResponseHead) -> Verdict {
        let cache = self.core.store.plan_cache(&head);
        self.core
            .metrics
            .record_request_succeeded(head.status(), self.started.elapsed());
        self.transition(AttemptState::Done);
        Verdict::Deliver(Delivery {
            head,
            history: std::mem::take(&mut self.history),
            cache,
        })
    }

    /// Routes a dispatch, connect or read failure through the retry policy.
    pub(crate) fn on_error(&mut self, error: Error) -> Verdict {
        let span = self.span.clone();
        let _entered = span.enter();
        if self.is_canceled() {
            let error = self.canceled_error();
            return Verdict::Fail(self.fail(error));
        }
        if error.is_fatal() {
            return Verdict::Fail(self.fail(error));
        }

        let outcome = AttemptOutcome::Error(&error);
        let Some(cause) = self.retry.classify(outcome) else {
            return Verdict::Fail(self.fail(error));
        };
        if self.retry.should_retry(&self.request, outcome).is_none() {
            self.retries_exhausted = !self.retry.has_budget(cause);
            return Verdict::Fail(self.fail(error));
        }

        let delay = self
            .retry
            .delay_before_next_request(None, self.core.config.clock.now_system());
        warn!(
            delay_ms = delay.as_millis() as u64,
            error = %error,
            cause = %cause,
            "retrying request after transport error"
        );
        let request = self
            .current
            .take()
            .map(|attempt| attempt.request)
            .unwrap_or_else(|| Arc::new(self.request.clone()));
        self.history
            .push(HistoryEntry::Failed(FailedAttempt::new(request, &error)));
        self.schedule_retry(cause, delay)
    }

    fn schedule_retry(&mut self, cause: RetryCause, delay: Duration) -> Verdict {
        self.retry = self.retry.increment(cause);
        if self.body.present && !self.body_dropped {
            self.needs_rewind = true;
        }
        self.current = None;
        self.core.metrics.record_retry();
        self.core
            .config
            .observer
            .on_retry_scheduled(&self.context(), cause, delay);
        self.transition(AttemptState::Retrying);
        Verdict::Retry(delay)
    }

    /// Ends the logical request with `error`, wrapping it with the history
    /// collected so far.
    pub(crate) fn fail(&mut self, error: Error) -> Error {
        self.fail_with_response(error, None)
    }

    fn fail_with_response(&mut self, error: Error, response: Option<ResponseHead>) -> Error {
        if matches!(error, Error::Request(_)) || self.state.is_terminal() {
            return error;
        }
        let request = self
            .current
            .take()
            .map(|attempt| attempt.request.as_ref().clone())
            .unwrap_or_else(|| self.request.clone());
        let error = Error::Request(Box::new(FailedRequest {
            request,
            response,
            history: std::mem::take(&mut self.history),
            attempts: self.attempts,
            retries_exhausted: self.retries_exhausted,
            error,
        }));
        self.core
            .metrics
            .record_request_failed(&error, self.started.elapsed());
        debug!(error = %error, attempts = self.attempts, "request failed");
        self.transition(AttemptState::Failed);
        error
    }
}

fn cached_headers(cached: &CachedResponse) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(cached.headers.len());
    for (name, value) in &cached.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use http::{HeaderMap, HeaderValue, Method, StatusCode};
    use url::Url;

    use super::{Action, Exchange, RequestOptions, SessionCore, Verdict};
    use crate::core::affinity::Negotiated;
    use crate::core::config::SessionConfig;
    use crate::core::error::{Error, ErrorCode, TransportErrorKind};
    use crate::core::request::{BodyShape, RequestHead};
    use crate::core::response::ReceivedResponse;
    use crate::core::retry::RetryState;

    fn core() -> Arc<SessionCore> {
        let config = SessionConfig::builder()
            .memory_store()
            .retry(RetryState::standard().backoff_factor(Duration::ZERO))
            .build()
            .expect("config should build");
        Arc::new(SessionCore::new(config).expect("session should build"))
    }

    fn get(url: &str) -> RequestHead {
        RequestHead::new(Method::GET, Url::parse(url).expect("url should parse"))
    }

    fn dispatch(exchange: &mut Exchange) -> super::Dispatch {
        match exchange.prepare().expect("prepare should succeed") {
            Action::Dispatch(dispatch) => dispatch,
            Action::Cached(_) => panic!("expected a network attempt"),
        }
    }

    fn response(status: u16, headers: &[(&'static str, &str)]) -> ReceivedResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(*name, HeaderValue::from_str(value).expect("valid header"));
        }
        ReceivedResponse::new(
            StatusCode::from_u16(status).expect("valid status"),
            map,
        )
    }

    #[test]
    fn userinfo_becomes_basic_authorization() {
        let mut exchange = Exchange::new(
            core(),
            get("https://user:pw@example.com/private"),
            BodyShape::empty(),
            RequestOptions::default(),
        );
        let dispatch = dispatch(&mut exchange);
        assert_eq!(
            dispatch.request.url().as_str(),
            "https://example.com/private"
        );
        assert_eq!(
            dispatch.request.headers()[http::header::AUTHORIZATION],
            "Basic dXNlcjpwdw=="
        );
        assert!(!dispatch.connection.session().is_shared());
    }

    #[test]
    fn anonymous_request_uses_a_shared_connection() {
        let mut exchange = Exchange::new(
            core(),
            get("http://example.com/"),
            BodyShape::empty(),
            RequestOptions::default(),
        );
        let dispatch = dispatch(&mut exchange);
        assert!(dispatch.connection.session().is_shared());
        assert_eq!(
            dispatch.request.headers()[http::header::HOST],
            "example.com"
        );
        assert!(!dispatch.rewind);
    }

    #[test]
    fn set_cookie_escalates_the_live_connection() {
        let mut exchange = Exchange::new(
            core(),
            get("http://example.com/login"),
            BodyShape::empty(),
            RequestOptions::default(),
        );
        let _ = dispatch(&mut exchange);
        let key = exchange
            .on_connected(Negotiated::default())
            .expect("cleartext should resolve");
        assert!(key.session_id().is_shared());

        let verdict = exchange.on_response(response(200, &[("set-cookie", "sid=1")]));
        assert!(matches!(verdict, Verdict::Deliver(_)));
        let rekey = exchange
            .take_rekey()
            .expect("connection should be re-keyed");
        assert!(!rekey.session_id().is_shared());
    }

    #[test]
    fn redirect_loop_is_detected() {
        let mut exchange = Exchange::new(
            core(),
            get("http://example.com/a"),
            BodyShape::empty(),
            RequestOptions::default(),
        );
        let _ = dispatch(&mut exchange);
        let _ = exchange.on_connected(Negotiated::default());
        let verdict = exchange.on_response(response(302, &[("location", "/b")]));
        assert!(matches!(verdict, Verdict::Redirect));

        let _ = dispatch(&mut exchange);
        let _ = exchange.on_connected(Negotiated::default());
        let Verdict::Fail(error) = exchange.on_response(response(302, &[("location", "/a")]))
        else {
            panic!("expected a redirect loop");
        };
        assert_eq!(error.code(), ErrorCode::RedirectLoop);
        assert_eq!(error.history().len(), 1);
        assert!(error.response().is_some());
    }

    #[test]
    fn every_retry_with_a_body_requires_a_rewind() {
        let mut exchange = Exchange::new(
            core(),
            RequestHead::new(Method::PUT, Url::parse("http://example.com/").expect("url")),
            BodyShape {
                present: true,
                content_length: Some(3),
                rewindable: true,
                content_type: None,
            },
            RequestOptions::default(),
        );
        let first = dispatch(&mut exchange);
        let error = Error::transport(TransportErrorKind::Connect, &first.request, "refused");
        assert!(matches!(exchange.on_error(error), Verdict::Retry(_)));
        assert!(dispatch(&mut exchange).rewind);

        let read = Error::transport(TransportErrorKind::Read, &first.request, "reset");
        assert!(matches!(exchange.on_error(read), Verdict::Retry(_)));
        assert!(dispatch(&mut exchange).rewind);
    }
}
