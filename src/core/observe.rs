use std::time::Duration;

use http::StatusCode;

use crate::core::error::Error;
use crate::core::policy::RequestContext;
use crate::core::retry::RetryCause;

/// Hooks into the attempt loop. Every method defaults to a no-op.
pub trait Observer: Send + Sync {
    fn on_attempt_start(&self, _context: &RequestContext) {}

    fn on_retry_scheduled(&self, _context: &RequestContext, _cause: RetryCause, _delay: Duration) {
    }

    fn on_redirect(&self, _context: &RequestContext, _from: &str, _to: &str, _status: StatusCode) {}

    /// A session store failure that was logged and ignored.
    fn on_store_error(&self, _operation: &'static str, _error: &Error) {}
}

#[derive(Debug, Default)]
pub(crate) struct NoopObserver;

impl Observer for NoopObserver {}
