//! Retry backoff policy
//!
//! Exponential backoff with a cap and optional jitter. The delay is a
//! pure function of the attempt counter carried on the envelope, so any
//! storage backend can compute `next_visible_at` without consulting the
//! processing strategy.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay applied after the first failed attempt
    pub initial: Duration,
    /// Multiplier applied per additional attempt
    pub multiplier: f64,
    /// Upper bound on the computed delay, before jitter
    pub cap: Duration,
    /// Jitter fraction in `[0, 1)`; the delay is scaled by a uniform
    /// factor in `[1 - jitter, 1 + jitter]`
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            multiplier: 2.0,
            cap: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Fixed delay with no growth and no jitter
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            multiplier: 1.0,
            cap: delay,
            jitter: 0.0,
        }
    }

    /// Base delay for the given attempt (1-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = self.initial.as_secs_f64() * factor;
        let capped = raw.min(self.cap.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Delay for the given attempt with the jitter factor applied
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((base.as_secs_f64() * (1.0 + spread)).max(0.0))
    }
}

/// Retry policy: bounded attempts plus the backoff curve between them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Dispatch attempts before a message is dead-lettered
    pub max_attempts: u32,
    /// Backoff applied between attempts
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// Whether a failure at this attempt count exhausts the policy
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}
