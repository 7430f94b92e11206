//! Configuration surface of the core
//!
//! Config is consumed as a read-only snapshot at batch boundaries; the engine
//! re-reads it between admission batches, never mid-task. Live updates go
//! through `Engine::update_queue_config`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use tradeloop_contracts::{duration_millis, option_duration_millis, ExternalApi, QueueName};

use crate::reliability::{BackoffPolicy, CircuitBreakerConfig};

/// Per-queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// When false the run loop parks; Submits are still persisted as Pending
    pub enabled: bool,

    /// Concurrency slots
    pub max_concurrent: usize,

    /// Default retry allowance for tasks that do not override it
    pub max_retries: u32,

    /// Default per-task wall-clock limit
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,

    /// Age after which a still-unstarted task is Expired (None = never)
    #[serde(with = "option_duration_millis", default)]
    pub max_task_age: Option<Duration>,

    pub circuit: CircuitBreakerConfig,

    pub backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 4,
            max_retries: 3,
            default_timeout: Duration::from_secs(300),
            max_task_age: None,
            circuit: CircuitBreakerConfig::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_circuit(mut self, circuit: CircuitBreakerConfig) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Token-bucket parameters for one external API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateApiConfig {
    /// Bucket capacity per key
    pub capacity: f64,

    /// Refill rate per key, tokens per second
    pub refill_per_sec: f64,

    /// API keys rotated round-robin
    pub keys: Vec<String>,
}

impl RateApiConfig {
    pub fn new(capacity: f64, refill_per_sec: f64, keys: Vec<String>) -> Self {
        Self {
            capacity,
            refill_per_sec,
            keys,
        }
    }
}

/// Retention thresholds for terminal tasks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionConfig {
    /// Completed tasks older than this are deleted
    #[serde(with = "duration_millis")]
    pub completed: Duration,

    /// Failed/Cancelled/Expired tasks older than this are deleted
    #[serde(with = "duration_millis")]
    pub failed: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed: Duration::from_secs(24 * 3600),
            failed: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Trading-hours window in a fixed-offset timezone
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketHoursConfig {
    /// Offset from UTC in minutes (default 330 = UTC+05:30)
    pub utc_offset_minutes: i32,

    pub open: NaiveTime,

    pub close: NaiveTime,
}

impl Default for MarketHoursConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 330,
            open: NaiveTime::from_hms_opt(9, 15, 0).expect("valid time"),
            close: NaiveTime::from_hms_opt(15, 30, 0).expect("valid time"),
        }
    }
}

impl MarketHoursConfig {
    /// Whether the instant falls inside the market window on a weekday
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        let offset = match FixedOffset::east_opt(self.utc_offset_minutes * 60) {
            Some(o) => o,
            None => return false,
        };
        let local = ts.with_timezone(&offset);
        let weekday = local.weekday().number_from_monday();
        if weekday > 5 {
            return false;
        }
        let t = local.time();
        t >= self.open && t <= self.close
    }
}

/// Complete configuration snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    pub portfolio_sync: QueueConfig,
    pub data_fetcher: QueueConfig,
    pub ai_analysis: QueueConfig,

    pub rate: HashMap<ExternalApi, RateApiConfig>,

    pub retention: RetentionConfig,

    pub market: MarketHoursConfig,

    /// Ready tasks older than this start aging upward in priority
    #[serde(with = "duration_millis")]
    pub starvation_threshold: Duration,

    /// RateLimited re-arms allowed per task before it is failed
    pub rate_retry_cap: u32,

    /// Grace given to a cancelled handler before it is declared unresponsive
    #[serde(with = "duration_millis")]
    pub cancel_grace: Duration,

    /// Retention sweep cadence
    #[serde(with = "duration_millis")]
    pub retention_sweep_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut rate = HashMap::new();
        rate.insert(
            ExternalApi::Broker,
            RateApiConfig::new(10.0, 2.0, vec!["broker-key-1".into()]),
        );
        rate.insert(
            ExternalApi::Llm,
            RateApiConfig::new(20.0, 0.5, vec!["llm-key-1".into()]),
        );
        rate.insert(
            ExternalApi::MarketData,
            RateApiConfig::new(30.0, 5.0, vec!["data-key-1".into()]),
        );

        Self {
            portfolio_sync: QueueConfig::default(),
            data_fetcher: QueueConfig::default(),
            ai_analysis: QueueConfig::default(),
            rate,
            retention: RetentionConfig::default(),
            market: MarketHoursConfig::default(),
            starvation_threshold: Duration::from_secs(600),
            rate_retry_cap: 10,
            cancel_grace: Duration::from_secs(5),
            retention_sweep_interval: Duration::from_secs(3600),
        }
    }
}

impl OrchestratorConfig {
    pub fn queue(&self, name: QueueName) -> &QueueConfig {
        match name {
            QueueName::PortfolioSync => &self.portfolio_sync,
            QueueName::DataFetcher => &self.data_fetcher,
            QueueName::AiAnalysis => &self.ai_analysis,
        }
    }

    pub fn queue_mut(&mut self, name: QueueName) -> &mut QueueConfig {
        match name {
            QueueName::PortfolioSync => &mut self.portfolio_sync,
            QueueName::DataFetcher => &mut self.data_fetcher,
            QueueName::AiAnalysis => &mut self.ai_analysis,
        }
    }

    pub fn with_queue(mut self, name: QueueName, config: QueueConfig) -> Self {
        *self.queue_mut(name) = config;
        self
    }

    pub fn with_rate(mut self, api: ExternalApi, config: RateApiConfig) -> Self {
        self.rate.insert(api, config);
        self
    }

    pub fn with_starvation_threshold(mut self, threshold: Duration) -> Self {
        self.starvation_threshold = threshold;
        self
    }
}
