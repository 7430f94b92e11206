//! Per-API rate budgets
//!
//! One token bucket per (api, key) with round-robin key rotation. `acquire`
//! never blocks; the caller decides whether to sleep, re-arm the task, or
//! reject.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use tradeloop_contracts::ExternalApi;

use crate::config::RateApiConfig;

/// Outcome of an `acquire` call
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    /// Quota granted against the named key
    Granted { key: String },

    /// All keys dry; the shortest wait until one refills enough
    WaitFor(Duration),

    /// The API has no configured keys
    Exhausted,
}

struct Bucket {
    key: String,
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    /// Upstream-imposed penalty (Retry-After); no grants until it elapses
    penalty_until: Option<Instant>,
}

impl Bucket {
    fn new(key: String, capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            key,
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
            penalty_until: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Time until `cost` tokens are available, penalty included
    fn wait_for(&self, cost: f64, now: Instant) -> Duration {
        let penalty = self
            .penalty_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);

        let missing = (cost - self.tokens).max(0.0);
        let refill = if missing == 0.0 {
            Duration::ZERO
        } else if self.refill_per_sec > 0.0 {
            Duration::from_secs_f64(missing / self.refill_per_sec)
        } else {
            Duration::MAX
        };

        penalty.max(refill)
    }
}

struct ApiBuckets {
    buckets: Vec<Bucket>,
    /// Round-robin cursor for key rotation
    cursor: usize,
}

/// Rate budget across all external APIs
pub struct RateBudget {
    apis: Mutex<HashMap<ExternalApi, ApiBuckets>>,
}

impl RateBudget {
    pub fn new(configs: &HashMap<ExternalApi, RateApiConfig>) -> Self {
        let apis = configs
            .iter()
            .map(|(api, cfg)| {
                let buckets = cfg
                    .keys
                    .iter()
                    .map(|key| Bucket::new(key.clone(), cfg.capacity, cfg.refill_per_sec))
                    .collect();
                (*api, ApiBuckets { buckets, cursor: 0 })
            })
            .collect();
        Self {
            apis: Mutex::new(apis),
        }
    }

    /// Non-blocking quota check for `cost` tokens against `api`
    pub fn acquire(&self, api: ExternalApi, cost: f64) -> RateDecision {
        let now = Instant::now();
        let mut apis = self.apis.lock();

        let entry = match apis.get_mut(&api) {
            Some(entry) if !entry.buckets.is_empty() => entry,
            _ => return RateDecision::Exhausted,
        };

        let len = entry.buckets.len();
        let start = entry.cursor % len;

        let mut min_wait = Duration::MAX;
        for offset in 0..len {
            let idx = (start + offset) % len;
            let bucket = &mut entry.buckets[idx];
            bucket.refill(now);

            let penalized = bucket
                .penalty_until
                .map(|until| now < until)
                .unwrap_or(false);

            if !penalized && bucket.tokens >= cost {
                bucket.tokens -= cost;
                let key = bucket.key.clone();
                entry.cursor = (idx + 1) % len;
                return RateDecision::Granted { key };
            }

            min_wait = min_wait.min(bucket.wait_for(cost, now));
        }

        RateDecision::WaitFor(min_wait)
    }

    /// Report the outcome of a granted call; failures with a retry-after
    /// hint put the key into a penalty window and rotate away from it.
    pub fn report(
        &self,
        api: ExternalApi,
        key: &str,
        success: bool,
        retry_after: Option<Duration>,
    ) {
        let mut apis = self.apis.lock();
        let entry = match apis.get_mut(&api) {
            Some(entry) => entry,
            None => return,
        };

        let len = entry.buckets.len();
        if let Some(idx) = entry.buckets.iter().position(|b| b.key == key) {
            if !success {
                if let Some(delay) = retry_after {
                    entry.buckets[idx].penalty_until = Some(Instant::now() + delay);
                    debug!(api = %api, key, ?delay, "rate key penalized");
                }
                // Rotate past the failed key
                entry.cursor = (idx + 1) % len.max(1);
            }
        }
    }

    /// Charge additional usage-based cost (e.g. LLM token accounting) against
    /// the named key.
    pub fn consume(&self, api: ExternalApi, key: &str, cost: f64) {
        let now = Instant::now();
        let mut apis = self.apis.lock();
        if let Some(entry) = apis.get_mut(&api) {
            if let Some(bucket) = entry.buckets.iter_mut().find(|b| b.key == key) {
                bucket.refill(now);
                bucket.tokens = (bucket.tokens - cost).max(0.0);
            }
        }
    }

    /// Remaining tokens per key (observability)
    pub fn remaining(&self, api: ExternalApi) -> Vec<(String, f64)> {
        let now = Instant::now();
        let mut apis = self.apis.lock();
        match apis.get_mut(&api) {
            Some(entry) => entry
                .buckets
                .iter_mut()
                .map(|b| {
                    b.refill(now);
                    (b.key.clone(), b.tokens)
                })
                .collect(),
            None => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(capacity: f64, refill: f64, keys: &[&str]) -> RateBudget {
        let mut configs = HashMap::new();
        configs.insert(
            ExternalApi::MarketData,
            RateApiConfig::new(
                capacity,
                refill,
                keys.iter().map(|k| k.to_string()).collect(),
            ),
        );
        RateBudget::new(&configs)
    }

    #[test]
    fn test_grant_until_empty() {
        let b = budget(2.0, 0.0, &["k1"]);
        assert!(matches!(
            b.acquire(ExternalApi::MarketData, 1.0),
            RateDecision::Granted { .. }
        ));
        assert!(matches!(
            b.acquire(ExternalApi::MarketData, 1.0),
            RateDecision::Granted { .. }
        ));
        assert!(matches!(
            b.acquire(ExternalApi::MarketData, 1.0),
            RateDecision::WaitFor(_)
        ));
    }

    #[test]
    fn test_wait_for_reflects_refill_rate() {
        let b = budget(1.0, 2.0, &["k1"]);
        assert!(matches!(
            b.acquire(ExternalApi::MarketData, 1.0),
            RateDecision::Granted { .. }
        ));
        match b.acquire(ExternalApi::MarketData, 1.0) {
            RateDecision::WaitFor(d) => {
                // one token at 2/s is ~500ms away
                assert!(d <= Duration::from_millis(550), "wait {d:?}");
            }
            other => panic!("expected WaitFor, got {other:?}"),
        }
    }

    #[test]
    fn test_key_rotation_round_robin() {
        let b = budget(10.0, 0.0, &["k1", "k2"]);
        let first = match b.acquire(ExternalApi::MarketData, 1.0) {
            RateDecision::Granted { key } => key,
            other => panic!("{other:?}"),
        };
        let second = match b.acquire(ExternalApi::MarketData, 1.0) {
            RateDecision::Granted { key } => key,
            other => panic!("{other:?}"),
        };
        assert_ne!(first, second);
    }

    #[test]
    fn test_fallback_to_other_key_when_one_dry() {
        let b = budget(1.0, 0.0, &["k1", "k2"]);
        // drain both
        assert!(matches!(
            b.acquire(ExternalApi::MarketData, 1.0),
            RateDecision::Granted { .. }
        ));
        assert!(matches!(
            b.acquire(ExternalApi::MarketData, 1.0),
            RateDecision::Granted { .. }
        ));
        assert!(matches!(
            b.acquire(ExternalApi::MarketData, 1.0),
            RateDecision::WaitFor(_)
        ));
    }

    #[test]
    fn test_penalty_skips_key() {
        let b = budget(10.0, 0.0, &["k1", "k2"]);
        b.report(
            ExternalApi::MarketData,
            "k1",
            false,
            Some(Duration::from_secs(60)),
        );
        // k1 penalized; every grant should land on k2
        for _ in 0..3 {
            match b.acquire(ExternalApi::MarketData, 1.0) {
                RateDecision::Granted { key } => assert_eq!(key, "k2"),
                other => panic!("{other:?}"),
            }
        }
    }

    #[test]
    fn test_unknown_api_exhausted() {
        let b = budget(1.0, 1.0, &["k1"]);
        assert_eq!(b.acquire(ExternalApi::Broker, 1.0), RateDecision::Exhausted);
    }

    #[test]
    fn test_consume_draws_down() {
        let b = budget(10.0, 0.0, &["k1"]);
        b.consume(ExternalApi::MarketData, "k1", 9.5);
        assert!(matches!(
            b.acquire(ExternalApi::MarketData, 1.0),
            RateDecision::WaitFor(_)
        ));
    }
}
