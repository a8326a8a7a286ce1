use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::{Method, StatusCode};
use rand::RngExt;

use crate::core::error::{Error, TimeoutPhase};
use crate::core::request::RequestHead;
use crate::core::response::ResponseHead;
use crate::core::util::parse_retry_after;

/// Which budget an attempt outcome draws from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryCause {
    Connect,
    Read,
    Response(StatusCode),
}

impl std::fmt::Display for RetryCause {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => formatter.write_str("connect"),
            Self::Read => formatter.write_str("read"),
            Self::Response(status) => write!(formatter, "response:{}", status.as_u16()),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum AttemptOutcome<'a> {
    Response(&'a ResponseHead),
    Error(&'a Error),
}

#[derive(Clone, Debug)]
pub struct RetryDecision {
    pub method: Method,
    pub uri: String,
    pub cause: RetryCause,
    pub back_to_back_errors: u32,
}

/// Replaces the retryable-method check with caller logic. Budgets still apply.
pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, decision: &RetryDecision) -> bool;
}

/// Retry budgets and backoff shape for one logical request.
///
/// Every mutator returns a new value, so a session-level template can be shared
/// freely between concurrent requests.
#[derive(Clone)]
pub struct RetryState {
    total_retries: Option<u32>,
    connect_retries: Option<u32>,
    read_retries: Option<u32>,
    response_retries: Option<u32>,
    retryable_methods: Vec<Method>,
    retryable_status_codes: BTreeSet<u16>,
    retry_after_status_codes: BTreeSet<u16>,
    max_retry_after: Option<Duration>,
    backoff_factor: Duration,
    backoff_jitter: Duration,
    max_backoff: Option<Duration>,
    back_to_back_errors: u32,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
}

impl std::fmt::Debug for RetryState {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryState")
            .field("total_retries", &self.total_retries)
            .field("connect_retries", &self.connect_retries)
            .field("read_retries", &self.read_retries)
            .field("response_retries", &self.response_retries)
            .field("retryable_methods", &self.retryable_methods)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field("retry_after_status_codes", &self.retry_after_status_codes)
            .field("max_retry_after", &self.max_retry_after)
            .field("backoff_factor", &self.backoff_factor)
            .field("backoff_jitter", &self.backoff_jitter)
            .field("max_backoff", &self.max_backoff)
            .field("back_to_back_errors", &self.back_to_back_errors)
            .finish()
    }
}

impl RetryState {
    pub fn disabled() -> Self {
        Self::standard().total_retries(0)
    }

    pub fn standard() -> Self {
        Self {
            total_retries: Some(3),
            connect_retries: None,
            read_retries: None,
            response_retries: None,
            retryable_methods: default_retryable_methods(),
            retryable_status_codes: BTreeSet::new(),
            retry_after_status_codes: default_retry_after_status_codes(),
            max_retry_after: Some(Duration::from_secs(30)),
            backoff_factor: Duration::ZERO,
            backoff_jitter: Duration::ZERO,
            max_backoff: Some(Duration::from_secs(120)),
            back_to_back_errors: 0,
            retry_classifier: None,
        }
    }

    pub fn total_retries(mut self, retries: u32) -> Self {
        self.total_retries = Some(retries);
        self
    }

    /// Removes the overall cap; only the per-category budgets apply.
    pub fn unlimited_total(mut self) -> Self {
        self.total_retries = None;
        self
    }

    pub fn connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = Some(retries);
        self
    }

    pub fn read_retries(mut self, retries: u32) -> Self {
        self.read_retries = Some(retries);
        self
    }

    pub fn response_retries(mut self, retries: u32) -> Self {
        self.response_retries = Some(retries);
        self
    }

    pub fn retryable_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.retryable_methods = methods.into_iter().collect();
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retry_after_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retry_after_status_codes = codes.into_iter().collect();
        self
    }

    pub fn max_retry_after(mut self, max_retry_after: Option<Duration>) -> Self {
        self.max_retry_after = max_retry_after;
        self
    }

    pub fn backoff_factor(mut self, backoff_factor: Duration) -> Self {
        self.backoff_factor = backoff_factor;
        self
    }

    pub fn backoff_jitter(mut self, backoff_jitter: Duration) -> Self {
        self.backoff_jitter = backoff_jitter;
        self
    }

    pub fn max_backoff(mut self, max_backoff: Option<Duration>) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn retry_classifier(mut self, retry_classifier: Arc<dyn RetryClassifier>) -> Self {
        self.retry_classifier = Some(retry_classifier);
        self
    }

    pub fn remaining_total(&self) -> Option<u32> {
        self.total_retries
    }

    pub fn remaining_connect(&self) -> Option<u32> {
        self.connect_retries
    }

    pub fn remaining_read(&self) -> Option<u32> {
        self.read_retries
    }

    pub fn remaining_response(&self) -> Option<u32> {
        self.response_retries
    }

    pub fn back_to_back_errors(&self) -> u32 {
        self.back_to_back_errors
    }

    /// Maps an attempt outcome to the budget it would draw from, or `None` when
    /// the outcome is final no matter what budget remains.
    pub fn classify(&self, outcome: AttemptOutcome<'_>) -> Option<RetryCause> {
        match outcome {
            AttemptOutcome::Response(response) => {
                let status = response.status().as_u16();
                (self.retryable_status_codes.contains(&status)
                    || self.retry_after_status_codes.contains(&status))
                .then_some(RetryCause::Response(response.status()))
            }
            AttemptOutcome::Error(error) => match error.root() {
                Error::Transport { kind, .. } if kind.is_connect_phase() => {
                    Some(RetryCause::Connect)
                }
                Error::Transport { .. } | Error::ReadBody { .. } => Some(RetryCause::Read),
                Error::Timeout {
                    phase: TimeoutPhase::Connect,
                    ..
                } => Some(RetryCause::Connect),
                Error::Timeout { .. } => Some(RetryCause::Read),
                _ => None,
            },
        }
    }

    /// Whether the budgets drawn by `cause` still allow another attempt.
    pub fn has_budget(&self, cause: RetryCause) -> bool {
        let category = match cause {
            RetryCause::Connect => self.connect_retries,
            RetryCause::Read => self.read_retries,
            RetryCause::Response(_) => self.response_retries,
        };
        self.total_retries != Some(0) && category != Some(0)
    }

    /// Returns the request to send next, or `None` when `outcome` is final.
    pub fn should_retry(
        &self,
        request: &RequestHead,
        outcome: AttemptOutcome<'_>,
    ) -> Option<RequestHead> {
        let cause = self.classify(outcome)?;
        if !self.has_budget(cause) {
            return None;
        }

        let allowed = match &self.retry_classifier {
            Some(classifier) => classifier.should_retry(&RetryDecision {
                method: request.method().clone(),
                uri: request.url().to_string(),
                cause,
                back_to_back_errors: self.back_to_back_errors,
            }),
            None => self.retryable_methods.contains(request.method()),
        };
        allowed.then(|| request.clone())
    }

    /// `Retry-After` when present and within `max_retry_after`, otherwise the
    /// exponential backoff for the current back-to-back error count.
    pub fn delay_before_next_request(
        &self,
        response: Option<&ResponseHead>,
        now: SystemTime,
    ) -> Duration {
        if let Some(response) = response
            && let Some(retry_after) = parse_retry_after(response.headers(), now)
            && self
                .max_retry_after
                .is_none_or(|ceiling| retry_after <= ceiling)
        {
            return retry_after;
        }
        self.backoff()
    }

    fn backoff(&self) -> Duration {
        let multiplier = 2_u32.saturating_pow(self.back_to_back_errors);
        let mut delay = self.backoff_factor.saturating_mul(multiplier);
        if !self.backoff_jitter.is_zero() {
            let span = self.backoff_jitter.as_nanos().min(u64::MAX as u128) as u64;
            let mut rng = rand::rng();
            delay = delay.saturating_add(Duration::from_nanos(rng.random_range(0..=span)));
        }
        match self.max_backoff {
            Some(max_backoff) => delay.min(max_backoff),
            None => delay,
        }
    }

    /// New state with the budgets for `cause` spent and one more back-to-back error.
    pub fn increment(&self, cause: RetryCause) -> Self {
        let mut next = self.clone();
        next.total_retries = next.total_retries.map(|left| left.saturating_sub(1));
        let category = match cause {
            RetryCause::Connect => &mut next.connect_retries,
            RetryCause::Read => &mut next.read_retries,
            RetryCause::Response(_) => &mut next.response_retries,
        };
        *category = category.map(|left| left.saturating_sub(1));
        next.back_to_back_errors = next.back_to_back_errors.saturating_add(1);
        next
    }

    /// New state after a redirect was followed transparently.
    pub fn performed_http_redirect(&self) -> Self {
        let mut next = self.clone();
        next.back_to_back_errors = 0;
        next
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::standard()
    }
}

fn default_retryable_methods() -> Vec<Method> {
    vec![
        Method::HEAD,
        Method::GET,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
        Method::TRACE,
    ]
}

fn default_retry_after_status_codes() -> BTreeSet<u16> {
    [413_u16, 429, 503].into_iter().collect()
}
