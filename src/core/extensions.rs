use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::core::util::lock_unpoisoned;

/// Wall-clock source for expiry, freshness and `Retry-After` dates.
pub trait Clock: Send + Sync {
    fn now_system(&self) -> SystemTime;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock_unpoisoned(&self.now);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now_system(&self) -> SystemTime {
        *lock_unpoisoned(&self.now)
    }
}
