//! Event protocol
//!
//! All lifecycle and domain notifications flow through one closed enum of
//! event kinds with wire-stable snake_case names. Events are immutable after
//! publication; per-subscriber delivery order equals publication order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::CorrelationId;

/// Closed set of event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Task lifecycle
    TaskCreated,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskRetried,

    // Queue control
    QueuePaused,
    QueueResumed,

    // Reliability
    CircuitOpened,
    CircuitClosed,
    RateLimitExceeded,

    // Orchestration
    WorkflowCompleted,

    // Domain
    PortfolioUpdated,
    NewsIngested,
    EarningsIngested,
    RecommendationProduced,

    // Platform
    EmergencyStop,
    DeliveryDropped,
    AlertRaised,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "task_created",
            Self::TaskStarted => "task_started",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::TaskRetried => "task_retried",
            Self::QueuePaused => "queue_paused",
            Self::QueueResumed => "queue_resumed",
            Self::CircuitOpened => "circuit_opened",
            Self::CircuitClosed => "circuit_closed",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::WorkflowCompleted => "workflow_completed",
            Self::PortfolioUpdated => "portfolio_updated",
            Self::NewsIngested => "news_ingested",
            Self::EarningsIngested => "earnings_ingested",
            Self::RecommendationProduced => "recommendation_produced",
            Self::EmergencyStop => "emergency_stop",
            Self::DeliveryDropped => "delivery_dropped",
            Self::AlertRaised => "alert_raised",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity for `AlertRaised` events
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => f.write_str("info"),
            Self::Warning => f.write_str("warning"),
            Self::Error => f.write_str("error"),
            Self::Critical => f.write_str("critical"),
        }
    }
}

/// An immutable published event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier (UUID v7, monotonically increasing)
    pub id: Uuid,

    pub kind: EventKind,

    /// Emitting component, e.g. "engine.data_fetcher" or "monitor"
    pub source: String,

    pub timestamp: DateTime<Utc>,

    pub correlation_id: Option<CorrelationId>,

    /// Kind-specific payload
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, source: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            source: source.into(),
            timestamp: Utc::now(),
            correlation_id: None,
            payload,
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}
