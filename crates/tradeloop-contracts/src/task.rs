//! The task model: the unit of work the scheduling engine admits, orders,
//! dispatches, and drives to a terminal state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;
use crate::workflow::WorkflowId;

/// Unique, stable task identifier (UUID v7, monotonically increasing)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a new time-ordered id
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation id threading tasks and events of one logical request
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three work streams of the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    /// Broker-facing portfolio synchronization
    PortfolioSync,

    /// External market/news/earnings data fetching
    DataFetcher,

    /// LLM-backed analysis and recommendation generation
    AiAnalysis,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [
        QueueName::PortfolioSync,
        QueueName::DataFetcher,
        QueueName::AiAnalysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PortfolioSync => "portfolio_sync",
            Self::DataFetcher => "data_fetcher",
            Self::AiAnalysis => "ai_analysis",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "portfolio_sync" => Ok(Self::PortfolioSync),
            "data_fetcher" => Ok(Self::DataFetcher),
            "ai_analysis" => Ok(Self::AiAnalysis),
            other => Err(format!("unknown queue: {other}")),
        }
    }
}

/// Scheduling priority, clamped to 1..=10 (higher runs first)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(1);
    pub const MAX: Priority = Priority(10);

    /// Create a priority, clamping out-of-range values into 1..=10
    pub fn new(value: u8) -> Self {
        Self(value.clamp(1, 10))
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(5)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task lifecycle states
///
/// Terminal states (Completed, Failed, Cancelled, Expired) are final; the
/// store rejects transitions out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Admitted; waiting on dependencies or a retry timer
    Pending,

    /// Runnable: all dependencies completed, no pending retry timer
    Ready,

    /// A handler is executing; holds exactly one queue slot
    Running,

    /// Handler returned success (terminal)
    Completed,

    /// Handler failed fatally or exhausted retries (terminal)
    Failed,

    /// Cancelled by caller, cascade, or emergency stop (terminal)
    Cancelled,

    /// Exceeded its admission-to-execution lifetime (terminal)
    Expired,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// Typed task payloads, one variant per registered task type
///
/// Handlers receive the concrete variant; there is no untyped payload map.
/// The queue a task belongs to is derived from its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task_type", rename_all = "snake_case")]
pub enum TaskPayload {
    // =========================================================================
    // PortfolioSync queue
    // =========================================================================
    /// Pull cash balances from the broker and reconcile the local ledger
    SyncBalances { account_id: String },

    /// Refresh open positions from the broker
    UpdatePositions { account_id: String },

    /// Compute realized/unrealized P&L from the latest positions snapshot
    ComputePnl {
        account_id: String,
        as_of: DateTime<Utc>,
    },

    /// Check exposure and drawdown against configured risk limits
    ValidateRiskLimits { account_id: String },

    // =========================================================================
    // DataFetcher queue
    // =========================================================================
    /// Fetch recent news for a symbol set
    FetchNews {
        symbols: Vec<String>,
        lookback_hours: u32,
    },

    /// Fetch the latest earnings report for a symbol
    FetchEarnings { symbol: String },

    /// Fetch fundamentals for a symbol
    FetchFundamentals { symbol: String },

    /// Fetch an option chain for a symbol and expiry
    FetchOptionChain {
        symbol: String,
        expiry: Option<String>,
    },

    // =========================================================================
    // AiAnalysis queue
    // =========================================================================
    /// Pre-market briefing over the watchlist
    MorningPrep { symbols: Vec<String> },

    /// Post-market review over the watchlist
    EveningReview { symbols: Vec<String> },

    /// Produce a buy/hold/sell recommendation for one symbol
    GenerateRecommendation { symbol: String },

    /// Score a strategy against recent outcomes
    EvaluateStrategy { strategy_id: String },

    /// Interpret a freshly ingested earnings report
    AnalyzeEarnings { symbol: String },
}

impl TaskPayload {
    /// The queue this payload is dispatched on
    pub fn queue(&self) -> QueueName {
        match self {
            Self::SyncBalances { .. }
            | Self::UpdatePositions { .. }
            | Self::ComputePnl { .. }
            | Self::ValidateRiskLimits { .. } => QueueName::PortfolioSync,

            Self::FetchNews { .. }
            | Self::FetchEarnings { .. }
            | Self::FetchFundamentals { .. }
            | Self::FetchOptionChain { .. } => QueueName::DataFetcher,

            Self::MorningPrep { .. }
            | Self::EveningReview { .. }
            | Self::GenerateRecommendation { .. }
            | Self::EvaluateStrategy { .. }
            | Self::AnalyzeEarnings { .. } => QueueName::AiAnalysis,
        }
    }

    /// Stable wire name of the task type (matches the serde tag)
    pub fn task_type(&self) -> &'static str {
        match self {
            Self::SyncBalances { .. } => "sync_balances",
            Self::UpdatePositions { .. } => "update_positions",
            Self::ComputePnl { .. } => "compute_pnl",
            Self::ValidateRiskLimits { .. } => "validate_risk_limits",
            Self::FetchNews { .. } => "fetch_news",
            Self::FetchEarnings { .. } => "fetch_earnings",
            Self::FetchFundamentals { .. } => "fetch_fundamentals",
            Self::FetchOptionChain { .. } => "fetch_option_chain",
            Self::MorningPrep { .. } => "morning_prep",
            Self::EveningReview { .. } => "evening_review",
            Self::GenerateRecommendation { .. } => "generate_recommendation",
            Self::EvaluateStrategy { .. } => "evaluate_strategy",
            Self::AnalyzeEarnings { .. } => "analyze_earnings",
        }
    }
}

/// The unit of work
///
/// A task is admitted Pending (or Ready when it has no dependencies), picked
/// by its queue's run loop in (priority desc, created_at asc, id asc) order,
/// and driven to exactly one terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub payload: TaskPayload,
    pub priority: Priority,

    /// Task ids that must reach Completed before this task becomes Ready
    pub dependencies: Vec<TaskId>,

    pub state: TaskState,

    /// Retries consumed by Transient/Timeout failures
    pub retry_count: u32,
    pub max_retries: u32,

    /// RateLimited re-arms tracked separately; they do not consume retries
    /// until `rate_retry_cap` is exceeded
    pub rate_retry_count: u32,

    /// When a Pending task becomes eligible to re-enter Ready
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Per-invocation wall-clock limit
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Queue-specific success value
    pub result: Option<serde_json::Value>,

    /// Latest structured failure
    pub error: Option<TaskError>,

    pub correlation_id: CorrelationId,

    /// Set when emitted by the orchestration layer
    pub parent_workflow_id: Option<WorkflowId>,

    /// Step name within the parent workflow; lets the orchestration layer
    /// rebuild its step-to-task mapping after a restart
    pub workflow_step: Option<String>,

    /// Background-schedule entry name that emitted this task, if any
    pub scheduled_by: Option<String>,

    /// Human-readable reason recorded on Cancelled
    pub cancel_reason: Option<String>,
}

impl Task {
    /// Default per-task timeout when the queue config does not override it
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

    pub fn new(payload: TaskPayload) -> Self {
        Self {
            id: TaskId::generate(),
            payload,
            priority: Priority::default(),
            dependencies: vec![],
            state: TaskState::Pending,
            retry_count: 0,
            max_retries: 3,
            rate_retry_count: 0,
            next_retry_at: None,
            timeout: Self::DEFAULT_TIMEOUT,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            correlation_id: CorrelationId::generate(),
            parent_workflow_id: None,
            workflow_step: None,
            scheduled_by: None,
            cancel_reason: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_parent_workflow(mut self, workflow_id: WorkflowId) -> Self {
        self.parent_workflow_id = Some(workflow_id);
        self
    }

    pub fn with_workflow_step(mut self, step: impl Into<String>) -> Self {
        self.workflow_step = Some(step.into());
        self
    }

    pub fn with_scheduled_by(mut self, name: impl Into<String>) -> Self {
        self.scheduled_by = Some(name.into());
        self
    }

    pub fn queue(&self) -> QueueName {
        self.payload.queue()
    }

    pub fn task_type(&self) -> &'static str {
        self.payload.task_type()
    }

    /// Priority after starvation aging: +1 per full minute waited beyond
    /// `starvation_threshold`, capped at the maximum priority.
    pub fn effective_priority(
        &self,
        now: DateTime<Utc>,
        starvation_threshold: Duration,
    ) -> u8 {
        let waited = now
            .signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);

        if waited <= starvation_threshold {
            return self.priority.get();
        }

        let overdue_minutes = (waited - starvation_threshold).as_secs() / 60;
        let boost = u8::try_from(overdue_minutes).unwrap_or(u8::MAX);
        self.priority
            .get()
            .saturating_add(boost)
            .min(Priority::MAX.get())
    }
}

/// Serde support for Duration as milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
pub mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
