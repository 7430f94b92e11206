//! Queue processors: the per-queue handler registries and the execution
//! context handed to every handler invocation
//!
//! Handlers are registered per (queue, task_type) and receive the concrete
//! payload variant. They must be idempotent (the engine may invoke them more
//! than once across retries) and must respect `ctx.cancellation` at
//! suspension points.

pub mod ai_analysis;
pub mod data_fetcher;
pub mod portfolio;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use tradeloop_contracts::{
    BrokerClient, CorrelationId, ExternalApi, IdempotencyKey, LlmClient, MarketDataClient,
    QueueName, TaskError, TaskId, TaskPayload,
};

use crate::bus::EventBus;
use crate::reliability::RateBudget;

/// Read-only service bundle available to handlers
#[derive(Clone)]
pub struct ContextServices {
    pub broker: Arc<dyn BrokerClient>,
    pub llm: Arc<dyn LlmClient>,
    pub market_data: Arc<dyn MarketDataClient>,
    pub bus: EventBus,
    pub rate_budget: Arc<RateBudget>,
}

/// Execution context for one handler invocation
pub struct TaskContext {
    pub task_id: TaskId,
    pub correlation_id: CorrelationId,

    /// 1-based attempt number
    pub attempt: u32,

    /// Wall-clock deadline derived from the task timeout
    pub deadline: DateTime<Utc>,

    /// Cooperative cancellation, tied to the engine's shutdown and the
    /// task's individual cancel signal
    pub cancellation: CancellationToken,

    /// Rate-budget grants held for this invocation, per declared API
    pub rate_grants: Vec<(ExternalApi, String)>,

    pub services: ContextServices,
}

impl TaskContext {
    /// The idempotency key handlers pass to non-idempotent upstream calls
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::new(self.task_id.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Charge usage-based cost (e.g. LLM tokens) against the key granted for
    /// this invocation.
    pub fn report_usage(&self, api: ExternalApi, cost: f64) {
        if let Some((_, key)) = self.rate_grants.iter().find(|(a, _)| *a == api) {
            self.services.rate_budget.consume(api, key, cost);
        }
    }

    /// Remaining time until the deadline
    pub fn remaining(&self) -> std::time::Duration {
        self.deadline
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

/// A task-type handler registered within a queue
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The task type this handler executes (matches the payload tag)
    fn task_type(&self) -> &'static str;

    /// External APIs this handler calls; the engine acquires rate budget for
    /// each before dispatch
    fn required_apis(&self) -> &'static [ExternalApi];

    /// Execute the task body
    ///
    /// The payload is read-only; the returned value becomes the task result.
    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &TaskPayload,
    ) -> Result<serde_json::Value, TaskError>;
}

/// Registry mapping (queue, task_type) to handlers
pub struct HandlerRegistry {
    handlers: DashMap<(QueueName, String), Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register a handler under a queue; replaces any existing registration
    /// for the same task type.
    pub fn register(&self, queue: QueueName, handler: Arc<dyn TaskHandler>) {
        self.handlers
            .insert((queue, handler.task_type().to_string()), handler);
    }

    pub fn get(&self, queue: QueueName, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .get(&(queue, task_type.to_string()))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn has(&self, queue: QueueName, task_type: &str) -> bool {
        self.handlers.contains_key(&(queue, task_type.to_string()))
    }

    /// Registered task types for a queue
    pub fn task_types(&self, queue: QueueName) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .iter()
            .filter(|entry| entry.key().0 == queue)
            .map(|entry| entry.key().1.clone())
            .collect();
        types.sort_unstable();
        types
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Register the full built-in handler set for all three queues
pub fn register_default_handlers(registry: &HandlerRegistry) {
    portfolio::register(registry);
    data_fetcher::register(registry);
    ai_analysis::register(registry);
}
