use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use http::header::{
    ALT_SVC, CONTENT_ENCODING, CONTENT_LENGTH, SET_COOKIE, STRICT_TRANSPORT_SECURITY,
};
use http::{HeaderMap, Method, StatusCode};
use tracing::{debug, warn};
use url::Url;

use super::cookies::{cookie_header, merge_cookie, parse_set_cookie, prune_expired};
use super::{AltSvc, CachedResponse, Hsts, OriginRecord, SessionStore, StoreCategory, StoredCookie};
use crate::core::directives::{
    AltSvcHeader, CacheDirectives, freshness_lifetime, parse_alt_svc,
    parse_strict_transport_security,
};
use crate::core::extensions::Clock;
use crate::core::metrics::SessionMetrics;
use crate::core::observe::Observer;
use crate::core::origin::Origin;
use crate::core::request::RequestHead;
use crate::core::response::ResponseHead;
use crate::core::tls::TlsSessionTicket;
use crate::core::util::{
    is_permanent_redirect_status, lock_unpoisoned, redirect_location, resolve_redirect_url,
    unix_seconds,
};

const CACHEABLE_STATUSES: [u16; 10] = [200, 203, 204, 300, 301, 404, 405, 410, 414, 501];

/// A response that may be cached once its body has been read to the end.
#[derive(Clone, Debug)]
pub(crate) struct CachePlan {
    origin: Origin,
    key: String,
    status: u16,
    headers: Vec<(String, String)>,
    stored_at: u64,
    expires_at: u64,
}

/// Mediates every read and write of session state.
///
/// Store failures never reach the caller: they are logged, counted and
/// treated as an empty result. Read-modify-write sequences for one origin
/// run under that origin's lock.
pub(crate) struct StoreCoordinator {
    store: Arc<dyn SessionStore>,
    preload: BTreeMap<String, Hsts>,
    clock: Arc<dyn Clock>,
    metrics: SessionMetrics,
    observer: Arc<dyn Observer>,
    origin_locks: Mutex<HashMap<Origin, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for StoreCoordinator {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("StoreCoordinator")
            .field("preload", &self.preload.len())
            .finish_non_exhaustive()
    }
}

impl StoreCoordinator {
    pub(crate) fn new(
        store: Arc<dyn SessionStore>,
        preload: impl IntoIterator<Item = Hsts>,
        clock: Arc<dyn Clock>,
        metrics: SessionMetrics,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            store,
            preload: preload
                .into_iter()
                .map(|entry| (entry.host.clone(), entry))
                .collect(),
            clock,
            metrics,
            observer,
            origin_locks: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    fn now(&self) -> u64 {
        unix_seconds(self.clock.now_system())
    }

    fn soft<T: Default>(
        &self,
        operation: &'static str,
        subject: &str,
        result: crate::Result<T>,
    ) -> T {
        match result {
            Ok(value) => value,
            Err(error) => {
                warn!(
                    operation,
                    origin = subject,
                    error = %error,
                    "session store operation failed; continuing without it"
                );
                self.metrics.record_store_error(operation);
                self.observer.on_store_error(operation, &error);
                T::default()
            }
        }
    }

    /// Runs `critical` under the lock for `origin`. The lock entry is dropped
    /// again once no other caller holds or waits on it.
    fn with_origin_lock<T>(&self, origin: &Origin, critical: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = lock_unpoisoned(&self.origin_locks);
            Arc::clone(locks.entry(origin.clone()).or_default())
        };
        let guard = lock_unpoisoned(&lock);
        let result = critical();
        {
            let mut locks = lock_unpoisoned(&self.origin_locks);
            if Arc::strong_count(&lock) == 2 {
                locks.remove(origin);
            }
        }
        drop(guard);
        result
    }

    /// Loads, edits and saves one origin record without interleaving with
    /// other writers of the same origin.
    fn update_origin(&self, origin: &Origin, edit: impl FnOnce(&mut OriginRecord) -> bool) {
        self.with_origin_lock(origin, || self.edit_origin(origin, edit));
    }

    fn edit_origin(&self, origin: &Origin, edit: impl FnOnce(&mut OriginRecord) -> bool) {
        let subject = origin.to_string();
        let Some(mut record) = self.soft(
            "load_origin",
            &subject,
            self.store.load_origin(origin).map(Some),
        ) else {
            return;
        };
        if !edit(&mut record) {
            return;
        }
        let result = if record.is_empty() {
            self.store.remove_origin(origin)
        } else {
            self.store.save_origin(origin, record)
        };
        self.soft("save_origin", &subject, result);
    }

    pub(crate) fn get_altsvc(&self, origin: &Origin) -> Vec<AltSvc> {
        let now = self.now();
        let mut entries = self.soft(
            "get_altsvc",
            &origin.to_string(),
            self.store.get_altsvc(origin),
        );
        entries.retain(|entry| entry.expires_at > now);
        entries
    }

    pub(crate) fn get_cookies(&self, origin: &Origin) -> Vec<StoredCookie> {
        let mut cookies = self.soft(
            "get_cookies",
            &origin.to_string(),
            self.store.get_cookies(origin),
        );
        prune_expired(&mut cookies, self.now());
        cookies
    }

    pub(crate) fn cookie_header(&self, origin: &Origin, url: &Url) -> Option<String> {
        cookie_header(&self.get_cookies(origin), url, self.now())
    }

    pub(crate) fn get_redirect(&self, url: &Url) -> Option<Url> {
        let target = self.soft("get_redirect", url.as_str(), self.store.get_redirect(url))?;
        Url::parse(&target).ok()
    }

    /// Follows stored permanent redirects starting at `url`, at most `limit`
    /// hops, stopping before any URL seen twice.
    pub(crate) fn resolve_permanent_redirects(&self, url: &Url, limit: usize) -> Option<Url> {
        let mut visited = HashSet::from([url.to_string()]);
        let mut current: Option<Url> = None;
        for _ in 0..limit {
            let from = current.as_ref().unwrap_or(url);
            let Some(next) = self.get_redirect(from) else {
                break;
            };
            if !visited.insert(next.to_string()) {
                debug!(url = %next, "stored redirect chain loops; stopping");
                break;
            }
            current = Some(next);
        }
        current
    }

    /// Explicit entries, withdrawals included, shadow the preload list for the
    /// same host. Parent domains only apply when they include subdomains.
    pub(crate) fn get_hsts(&self, origin: &Origin) -> Option<Hsts> {
        let host = origin.host();
        let now = self.now();
        let exact = self.hsts_entry(host, now);
        if exact.is_some() || host.parse::<IpAddr>().is_ok() {
            return exact;
        }
        let mut rest = host;
        while let Some((_, parent)) = rest.split_once('.') {
            if !parent.contains('.') {
                break;
            }
            if let Some(entry) = self.hsts_entry(parent, now)
                && entry.include_subdomains
            {
                return Some(entry);
            }
            rest = parent;
        }
        None
    }

    fn hsts_entry(&self, host: &str, now: u64) -> Option<Hsts> {
        let explicit = self.soft("get_hsts", host, self.store.get_hsts(host));
        match explicit {
            Some(entry) if entry.expires_at.is_none_or(|expires_at| expires_at > now) => {
                Some(entry)
            }
            Some(_) => None,
            None => self.preload.get(host).cloned(),
        }
    }

    pub(crate) fn get_tls_session_ticket(&self, origin: &Origin) -> Option<TlsSessionTicket> {
        self.soft(
            "get_tls_session_ticket",
            &origin.to_string(),
            self.store.get_tls_session_ticket(origin),
        )
    }

    /// A fresh cached response for `request`, if its own directives allow one.
    pub(crate) fn get_cached_response(&self, request: &RequestHead) -> Option<CachedResponse> {
        if *request.method() != Method::GET
            || CacheDirectives::from_headers(request.headers()).forbids_caching()
        {
            return None;
        }
        let origin = request.origin().ok()?;
        let key = cache_key(request.method(), request.url());
        let cached = self.soft(
            "get_cached_response",
            &origin.to_string(),
            self.store.get_cached_response(&origin, &key),
        )?;
        (cached.expires_at > self.now()).then_some(cached)
    }

    pub(crate) fn clear(
        &self,
        origin: &Origin,
        categories: Option<&[StoreCategory]>,
    ) -> crate::Result<()> {
        self.with_origin_lock(origin, || {
            self.store.clear(origin, categories)?;
            let hsts_cleared =
                categories.is_none_or(|categories| categories.contains(&StoreCategory::Hsts));
            if hsts_cleared && let Some(revoked) = self.withdrawn_hsts(origin.host()) {
                self.store.save_hsts(origin.host(), Some(revoked))?;
            }
            Ok(())
        })
    }

    /// What to store when the policy for `host` is withdrawn: nothing, unless
    /// a preload entry for the same host would otherwise take over again.
    fn withdrawn_hsts(&self, host: &str) -> Option<Hsts> {
        self.preload.contains_key(host).then(|| Hsts::revoked(host))
    }

    /// Learns HSTS, Alt-Svc, cookies and permanent redirects from a response.
    pub(crate) fn record_response(&self, response: &ResponseHead) {
        let Ok(origin) = response.request().origin() else {
            return;
        };
        let headers = response.headers();
        let now = self.now();

        if origin.is_tls()
            && let Some(value) = header_str(headers, &STRICT_TRANSPORT_SECURITY)
            && let Some(sts) = parse_strict_transport_security(value)
        {
            let entry = if sts.max_age > 0 {
                Some(Hsts {
                    host: origin.host().to_owned(),
                    include_subdomains: sts.include_subdomains,
                    expires_at: Some(now.saturating_add(sts.max_age)),
                    preload: sts.preload,
                })
            } else {
                self.withdrawn_hsts(origin.host())
            };
            let result = self.store.save_hsts(origin.host(), entry);
            self.soft("save_hsts", origin.host(), result);
        }

        let alt_svc: Vec<&str> = if origin.is_tls() {
            headers
                .get_all(ALT_SVC)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .collect()
        } else {
            Vec::new()
        };
        let set_cookies: Vec<&str> = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();
        let redirect = permanent_redirect(response);
        if alt_svc.is_empty() && set_cookies.is_empty() && redirect.is_none() {
            return;
        }

        let url = response.url();
        self.update_origin(&origin, |record| {
            let mut changed = false;
            for value in &alt_svc {
                changed |= merge_alt_svc(&mut record.alt_svc, &origin, value, now);
            }
            for value in &set_cookies {
                if let Some(update) = parse_set_cookie(value, url, now) {
                    merge_cookie(&mut record.cookies, update);
                    changed = true;
                }
            }
            changed |= prune_expired(&mut record.cookies, now);
            if let Some(target) = &redirect {
                record.redirects.insert(url.to_string(), target.to_string());
                changed = true;
            }
            changed
        });
    }

    pub(crate) fn record_tls_ticket(&self, origin: &Origin, ticket: TlsSessionTicket) {
        self.update_origin(origin, |record| {
            record.tls_session_ticket = Some(ticket);
            true
        });
    }

    /// Decides whether `response` may be cached once its body has been fully read.
    pub(crate) fn plan_cache(&self, response: &ResponseHead) -> Option<CachePlan> {
        let request = response.request();
        if *request.method() != Method::GET
            || !CACHEABLE_STATUSES.contains(&response.status().as_u16())
        {
            return None;
        }
        let request_directives = CacheDirectives::from_headers(request.headers());
        let response_directives = CacheDirectives::from_headers(response.headers());
        if request_directives.forbids_caching() || response_directives.forbids_caching() {
            return None;
        }
        let now = self.clock.now_system();
        let lifetime = freshness_lifetime(&response_directives, response.headers(), now)?;
        if lifetime == 0 {
            return None;
        }
        let stored_at = unix_seconds(now);
        Some(CachePlan {
            origin: request.origin().ok()?,
            key: cache_key(request.method(), request.url()),
            status: response.status().as_u16(),
            headers: stored_headers(response.headers()),
            stored_at,
            expires_at: stored_at.saturating_add(lifetime),
        })
    }

    pub(crate) fn store_cached_response(&self, plan: CachePlan, body: Vec<u8>) {
        let CachePlan {
            origin,
            key,
            status,
            headers,
            stored_at,
            expires_at,
        } = plan;
        debug!(origin = %origin, key = %key, bytes = body.len(), "caching response");
        self.update_origin(&origin, |record| {
            record.responses.insert(
                key,
                CachedResponse {
                    status,
                    headers,
                    body,
                    stored_at,
                    expires_at,
                },
            );
            true
        });
    }
}

/// Method plus normalized URL. `url` already lowercases scheme and host and
/// drops default ports; the fragment is removed here.
pub(crate) fn cache_key(method: &Method, url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    format!("{method} {normalized}")
}

fn permanent_redirect(response: &ResponseHead) -> Option<Url> {
    if !is_permanent_redirect_status(response.status()) {
        return None;
    }
    let location = redirect_location(response.headers())?;
    resolve_redirect_url(response.url(), &location)
}

fn merge_alt_svc(entries: &mut Vec<AltSvc>, origin: &Origin, value: &str, now: u64) -> bool {
    let before = entries.clone();
    match parse_alt_svc(value) {
        AltSvcHeader::Clear => entries.clear(),
        AltSvcHeader::Adverts(adverts) => {
            for advert in adverts {
                let host = advert.host.unwrap_or_else(|| origin.host().to_owned());
                entries.retain(|entry| {
                    !(entry.alpn == advert.alpn && entry.host == host && entry.port == advert.port)
                });
                if advert.max_age > 0 {
                    entries.push(AltSvc {
                        alpn: advert.alpn,
                        host,
                        port: advert.port,
                        expires_at: now.saturating_add(advert.max_age),
                    });
                }
            }
        }
    }
    entries.retain(|entry| entry.expires_at > now);
    *entries != before
}

/// Headers kept with a cached body. The body is stored decoded, so framing and
/// coding headers no longer describe it.
fn stored_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            *name != CONTENT_ENCODING && *name != CONTENT_LENGTH && *name != SET_COOKIE
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_owned(), value.to_owned()))
        })
        .collect()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &http::header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

pub(crate) fn cached_status(cached: &CachedResponse) -> StatusCode {
    StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK)
}
