//! Exponential retry backoff with jitter

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use tradeloop_contracts::duration_millis;

/// Exponential backoff policy for task retries
///
/// `delay(n) = min(base * 2^n, cap) + jitter`, with jitter drawn uniformly
/// from `[0, base)` to avoid thundering herds.
///
/// # Example
///
/// ```
/// use tradeloop_orchestrator::BackoffPolicy;
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
/// // retry 0 -> ~1s, retry 1 -> ~2s, retry 2 -> ~4s, ... capped at 60s
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay before the first retry
    #[serde(with = "duration_millis")]
    pub base: Duration,

    /// Upper bound on the exponential term
    #[serde(with = "duration_millis")]
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before the retry following the `retry_count`-th failure
    /// (0-based), jitter included.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let jitter = if self.base.is_zero() {
            Duration::ZERO
        } else {
            let mut rng = rand::thread_rng();
            Duration::from_secs_f64(rng.gen_range(0.0..self.base.as_secs_f64()))
        };
        self.delay_without_jitter(retry_count) + jitter
    }

    /// The deterministic exponential term, `min(base * 2^n, cap)`
    pub fn delay_without_jitter(&self, retry_count: u32) -> Duration {
        let exp = 2f64.powi(retry_count.min(63) as i32);
        let raw = self.base.as_secs_f64() * exp;
        Duration::from_secs_f64(raw.min(self.cap.as_secs_f64()))
    }
}
