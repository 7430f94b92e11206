//! # Queue Orchestration & Task Scheduling Core
//!
//! The coordination layer of the trading platform: a multi-queue,
//! dependency-aware task scheduler driving three interdependent work streams
//! (portfolio synchronization, external data fetching, AI analysis) under
//! priority, concurrency, rate-limit, and failure-recovery constraints.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            BackgroundScheduler / Orchestrator                │
//! │  (periodic emission, workflow composition, event triggers)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ submit
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │  (admission, dependency resolution, per-queue run loops,    │
//! │   slots, rate budgets, circuit breakers, retry/backoff)     │
//! └─────────────────────────────────────────────────────────────┘
//!                     │                        │
//!                     ▼                        ▼
//! ┌───────────────────────────┐  ┌─────────────────────────────┐
//! │         TaskStore          │  │          EventBus           │
//! │  (SQLite / in-memory,     │  │  (typed pub/sub, per-       │
//! │   CAS state transitions)  │  │   subscriber FIFO delivery) │
//! └───────────────────────────┘  └─────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tradeloop_orchestrator::prelude::*;
//!
//! let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
//! let bus = EventBus::new(BusConfig::default());
//!
//! let registry = Arc::new(HandlerRegistry::new());
//! register_default_handlers(&registry);
//!
//! let clients = EngineClients {
//!     broker: Arc::new(my_broker),
//!     llm: Arc::new(my_llm),
//!     market_data: Arc::new(my_market_data),
//! };
//!
//! let engine = Engine::new(store, bus, registry, clients, OrchestratorConfig::default());
//! engine.start();
//!
//! let id = engine
//!     .submit(Task::new(TaskPayload::SyncBalances { account_id: "a1".into() }))
//!     .await?;
//! ```

pub mod background;
pub mod bus;
pub mod config;
pub mod engine;
pub mod monitoring;
pub mod orchestration;
pub mod persistence;
pub mod queues;
pub mod reliability;
pub mod sim;

/// Prelude for common imports
pub mod prelude {
    pub use crate::background::{BackgroundScheduler, PeriodicEntry};
    pub use crate::bus::{BusConfig, EventBus, Subscription};
    pub use crate::config::{OrchestratorConfig, QueueConfig};
    pub use crate::engine::{Engine, EngineClients, EngineError, QueueStatusSnapshot};
    pub use crate::monitoring::{Monitor, MonitorThresholds};
    pub use crate::orchestration::Orchestrator;
    pub use crate::persistence::{
        InMemoryTaskStore, SqliteTaskStore, StoreError, TaskStore, TransitionPatch,
        WorkflowRecord,
    };
    pub use crate::queues::{
        register_default_handlers, ContextServices, HandlerRegistry, TaskContext, TaskHandler,
    };
    pub use crate::reliability::{
        BackoffPolicy, CircuitBreaker, CircuitBreakerConfig, CircuitState, RateBudget,
        RateDecision,
    };
    pub use tradeloop_contracts::*;
}

// Re-export key types at crate root
pub use background::{BackgroundScheduler, PeriodicEntry};
pub use bus::{BusConfig, EventBus, Subscription};
pub use config::{OrchestratorConfig, QueueConfig};
pub use engine::{Engine, EngineClients, EngineError, QueueStatusSnapshot};
pub use monitoring::{Monitor, MonitorThresholds};
pub use orchestration::Orchestrator;
pub use persistence::{InMemoryTaskStore, SqliteTaskStore, StoreError, TaskStore};
pub use queues::{
    register_default_handlers, ContextServices, HandlerRegistry, TaskContext, TaskHandler,
};
pub use reliability::{
    BackoffPolicy, CircuitBreaker, CircuitBreakerConfig, CircuitState, RateBudget, RateDecision,
};
