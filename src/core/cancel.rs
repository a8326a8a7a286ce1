use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::core::util::lock_unpoisoned;

#[derive(Debug, Default)]
struct CancelInner {
    canceled: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
    #[cfg(feature = "_async")]
    notify: tokio::sync::Notify,
}

/// Cancels an in-flight request from another thread or task.
///
/// Cancellation is observed before dispatch, after connecting, after headers,
/// during backoff waits and during body reads. A canceled attempt writes
/// nothing to the session store.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
        {
            let _guard = lock_unpoisoned(&self.inner.lock);
            self.inner.condvar.notify_all();
        }
        #[cfg(feature = "_async")]
        self.inner.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Blocks for `duration` unless canceled first. Returns `true` on cancel.
    pub(crate) fn sleep_blocking(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = lock_unpoisoned(&self.inner.lock);
        loop {
            if self.is_canceled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.inner.condvar.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Resolves once `cancel` has been called.
    #[cfg(feature = "_async")]
    pub(crate) async fn canceled(&self) {
        loop {
            let mut notified = std::pin::pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleeps for `duration` unless canceled first. Returns `true` on cancel.
    #[cfg(feature = "_async")]
    pub(crate) async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.canceled() => true,
            () = tokio::time::sleep(duration) => self.is_canceled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::CancelHandle;

    #[test]
    fn cancel_interrupts_a_blocking_wait() {
        let handle = CancelHandle::new();
        let canceler = handle.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            canceler.cancel();
        });

        let started = Instant::now();
        assert!(handle.sleep_blocking(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(5));
        thread.join().expect("canceler thread should finish");
    }

    #[test]
    fn uncanceled_wait_runs_to_completion() {
        let handle = CancelHandle::new();
        assert!(!handle.sleep_blocking(Duration::from_millis(5)));
        assert!(!handle.is_canceled());
    }
}
