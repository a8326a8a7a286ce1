use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use http::StatusCode;

use crate::core::error::Error;
use crate::core::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionMetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub attempts: u64,
    pub retries: u64,
    pub redirects_followed: u64,
    pub cache_hits: u64,
    pub hsts_upgrades: u64,
    pub store_errors: u64,
    pub private_escalations: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

/// Atomic counters shared by every clone of a session. Disabled metrics are a
/// `None` and every recorder returns immediately.
#[derive(Clone, Debug, Default)]
pub(crate) struct SessionMetrics {
    inner: Option<Arc<SessionMetricsInner>>,
}

#[derive(Debug, Default)]
struct SessionMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    redirects_followed: AtomicU64,
    cache_hits: AtomicU64,
    hsts_upgrades: AtomicU64,
    store_errors: AtomicU64,
    private_escalations: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    inner: Option<Arc<SessionMetricsInner>>,
}

macro_rules! counter {
    ($name:ident, $field:ident) => {
        pub(crate) fn $name(&self) {
            if let Some(inner) = &self.inner {
                inner.$field.fetch_add(1, Ordering::Relaxed);
            }
        }
    };
}

impl SessionMetrics {
    pub(crate) fn enabled() -> Self {
        Self {
            inner: Some(Arc::new(SessionMetricsInner::default())),
        }
    }

    pub(crate) fn disabled() -> Self {
        Self::default()
    }

    counter!(record_request_started, requests_started);
    counter!(record_attempt, attempts);
    counter!(record_retry, retries);
    counter!(record_redirect, redirects_followed);
    counter!(record_cache_hit, cache_hits);
    counter!(record_hsts_upgrade, hsts_upgrades);
    counter!(record_private_escalation, private_escalations);

    pub(crate) fn record_store_error(&self, operation: &'static str) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.store_errors.fetch_add(1, Ordering::Relaxed);
        self.add_error_count(format!("store:{operation}"));
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        match &self.inner {
            Some(inner) => {
                inner.in_flight.fetch_add(1, Ordering::Relaxed);
                InFlightGuard {
                    inner: Some(Arc::clone(inner)),
                }
            }
            None => InFlightGuard { inner: None },
        }
    }

    pub(crate) fn record_request_succeeded(&self, status: StatusCode, latency: Duration) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.requests_succeeded.fetch_add(1, Ordering::Relaxed);
        self.add_status_count(status.as_u16());
        self.record_latency(latency);
    }

    pub(crate) fn record_request_failed(&self, error: &Error, latency: Duration) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.requests_failed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
        if let Some(response) = error.response() {
            self.add_status_count(response.status().as_u16());
        }
        let key = match error.root() {
            Error::Transport { kind, .. } => format!("transport:{kind}"),
            Error::Timeout { phase, .. } => format!("timeout:{phase}"),
            Error::HttpStatus { status, .. } => format!("http_status:{status}"),
            other => other.code().as_str().to_owned(),
        };
        self.add_error_count(key);
    }

    pub(crate) fn snapshot(&self) -> SessionMetricsSnapshot {
        let Some(inner) = &self.inner else {
            return SessionMetricsSnapshot::default();
        };

        let latency_samples = inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        SessionMetricsSnapshot {
            requests_started: inner.requests_started.load(Ordering::Relaxed),
            requests_succeeded: inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: inner.requests_failed.load(Ordering::Relaxed),
            attempts: inner.attempts.load(Ordering::Relaxed),
            retries: inner.retries.load(Ordering::Relaxed),
            redirects_followed: inner.redirects_followed.load(Ordering::Relaxed),
            cache_hits: inner.cache_hits.load(Ordering::Relaxed),
            hsts_upgrades: inner.hsts_upgrades.load(Ordering::Relaxed),
            store_errors: inner.store_errors.load(Ordering::Relaxed),
            private_escalations: inner.private_escalations.load(Ordering::Relaxed),
            in_flight: inner.in_flight.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&inner.error_counts).clone(),
        }
    }

    fn record_latency(&self, latency: Duration) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        inner.latency_total_ms.fetch_add(
            latency.as_millis().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
    }

    fn add_status_count(&self, status: u16) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut status_counts = lock_unpoisoned(&inner.status_counts);
        *status_counts.entry(status).or_insert(0) += 1;
    }

    fn add_error_count(&self, error_key: String) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut error_counts = lock_unpoisoned(&inner.error_counts);
        *error_counts.entry(error_key).or_insert(0) += 1;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(inner) = &self.inner {
            inner.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::StatusCode;

    use super::SessionMetrics;
    use crate::core::error::Error;

    #[test]
    fn disabled_metrics_report_zeroes() {
        let metrics = SessionMetrics::disabled();
        metrics.record_request_started();
        metrics.record_retry();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_started, 0);
        assert_eq!(snapshot.retries, 0);
    }

    #[test]
    fn in_flight_guard_decrements_on_drop() {
        let metrics = SessionMetrics::enabled();
        let guard = metrics.enter_in_flight();
        assert_eq!(metrics.snapshot().in_flight, 1);
        drop(guard);
        assert_eq!(metrics.snapshot().in_flight, 0);
    }

    #[test]
    fn outcomes_are_counted_by_status_and_error_code() {
        let metrics = SessionMetrics::enabled();
        metrics.record_request_succeeded(StatusCode::OK, Duration::from_millis(10));
        metrics.record_request_failed(
            &Error::store("save_origin", "disk full"),
            Duration::from_millis(30),
        );
        metrics.record_store_error("save_origin");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_succeeded, 1);
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.store_errors, 1);
        assert_eq!(snapshot.status_counts.get(&200), Some(&1));
        assert_eq!(snapshot.error_counts.get("store"), Some(&1));
        assert_eq!(snapshot.error_counts.get("store:save_origin"), Some(&1));
        assert_eq!(snapshot.latency_avg_ms, 20.0);
    }
}
