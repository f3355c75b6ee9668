//! Injectable time source
//!
//! All components read wall-clock time through [`Clock`] so that tests
//! can substitute a controllable source. Production code uses
//! [`SystemClock`]; tests use [`ManualClock`] and advance it explicitly.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::time::Duration;

/// Wall-clock UTC source
pub trait Clock: Send + Sync {
    /// Current UTC time
    fn utc_now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that only moves when told to
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a manual clock starting at the given instant
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Set the current time
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write() = now;
    }

    /// Advance the current time by a duration
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write();
        *now += ChronoDuration::from_std(by).unwrap_or_else(|_| ChronoDuration::zero());
    }
}

impl Clock for ManualClock {
    fn utc_now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}
