//! TaskStore trait definition
//!
//! The store is the single durable source of truth for tasks, workflows,
//! and the event journal. Implementations serialize writers per logical
//! table and enforce CAS semantics on task state transitions; terminal
//! states are final by construction.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tradeloop_contracts::{
    CorrelationId, Event, Task, TaskError, TaskId, TaskState, WorkflowId, WorkflowSpec,
    WorkflowState,
};

use crate::config::RetentionConfig;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// Duplicate admission
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),

    /// CAS transition lost the race
    #[error("stale state for task {id}: expected {expected}, found {actual}")]
    StaleState {
        id: TaskId,
        expected: TaskState,
        actual: TaskState,
    },

    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    /// Backend I/O or busy error; worth retrying
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the operation is worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Field updates applied atomically with a state transition
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
    pub rate_retry_count: Option<u32>,
    /// `Some(None)` clears the retry timer, `Some(Some(t))` arms it
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub cancel_reason: Option<String>,
}

impl TransitionPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn with_rate_retry_count(mut self, count: u32) -> Self {
        self.rate_retry_count = Some(count);
        self
    }

    pub fn with_next_retry_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: TaskError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_cancel_reason(mut self, reason: impl Into<String>) -> Self {
        self.cancel_reason = Some(reason.into());
        self
    }

    /// Apply this patch to a task row
    pub fn apply(&self, task: &mut Task) {
        if let Some(at) = self.started_at {
            task.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            task.completed_at = Some(at);
        }
        if let Some(count) = self.retry_count {
            task.retry_count = count;
        }
        if let Some(count) = self.rate_retry_count {
            task.rate_retry_count = count;
        }
        if let Some(at) = self.next_retry_at {
            task.next_retry_at = at;
        }
        if let Some(result) = &self.result {
            task.result = Some(result.clone());
        }
        if let Some(error) = &self.error {
            task.error = Some(error.clone());
        }
        if let Some(reason) = &self.cancel_reason {
            task.cancel_reason = Some(reason.clone());
        }
    }
}

/// Durable workflow row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: WorkflowId,
    pub spec: WorkflowSpec,
    pub state: WorkflowState,
    pub correlation_id: CorrelationId,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRecord {
    pub fn new(spec: WorkflowSpec, correlation_id: CorrelationId) -> Self {
        Self {
            id: WorkflowId::generate(),
            spec,
            state: WorkflowState::Pending,
            correlation_id,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Store for tasks, workflows, and the event journal
///
/// Implementations must be thread-safe; every mutation acquires one lock per
/// logical table and holds it only for the minimum span. No external calls
/// happen under a lock.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    // =========================================================================
    // Task Operations
    // =========================================================================

    /// Insert a new task row; rejects duplicates by id
    async fn admit(&self, task: &Task) -> Result<(), StoreError>;

    /// Load a task by id
    async fn get(&self, id: TaskId) -> Result<Task, StoreError>;

    /// Whether a task row exists
    async fn contains(&self, id: TaskId) -> Result<bool, StoreError>;

    /// CAS-style state update; fails with `StaleState` when the current
    /// state differs from `from`. The patch is applied atomically with the
    /// transition. Returns the updated row.
    async fn transition(
        &self,
        id: TaskId,
        from: TaskState,
        to: TaskState,
        patch: TransitionPatch,
    ) -> Result<Task, StoreError>;

    /// Up to `limit` Ready tasks of the queue, ordered by effective priority
    /// desc (starvation aging included), then created_at asc, then id asc.
    async fn load_ready(
        &self,
        queue: tradeloop_contracts::QueueName,
        limit: usize,
        now: DateTime<Utc>,
        starvation_threshold: Duration,
    ) -> Result<Vec<Task>, StoreError>;

    /// Pending tasks of the queue whose retry timer has elapsed
    async fn due_retries(
        &self,
        queue: tradeloop_contracts::QueueName,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, StoreError>;

    /// Earliest armed retry timer for the queue
    async fn next_retry_at(
        &self,
        queue: tradeloop_contracts::QueueName,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Tasks that declared `id` as a dependency
    async fn load_dependents(&self, id: TaskId) -> Result<Vec<TaskId>, StoreError>;

    /// Persist the success value atomically with Running -> Completed
    async fn record_result(
        &self,
        id: TaskId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError>;

    /// Tasks emitted by a workflow
    async fn list_by_workflow(&self, workflow_id: WorkflowId) -> Result<Vec<Task>, StoreError>;

    /// All tasks in a non-terminal state, across queues
    async fn list_non_terminal(&self) -> Result<Vec<Task>, StoreError>;

    /// State counters for one queue
    async fn counts_by_state(
        &self,
        queue: tradeloop_contracts::QueueName,
    ) -> Result<HashMap<TaskState, u64>, StoreError>;

    /// Age of the oldest Pending/Ready task in the queue
    async fn oldest_pending_age(
        &self,
        queue: tradeloop_contracts::QueueName,
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>, StoreError>;

    /// Delete terminal tasks past their retention threshold; returns the
    /// number of rows removed.
    async fn retain(
        &self,
        retention: &RetentionConfig,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    // =========================================================================
    // Event Journal Operations
    // =========================================================================

    /// Append one event to the journal (append-only)
    async fn append_event(&self, event: &Event) -> Result<(), StoreError>;

    /// Journaled events for one correlation, in publication order
    async fn load_events(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Vec<Event>, StoreError>;

    // =========================================================================
    // Workflow Operations
    // =========================================================================

    /// Insert or replace a workflow row
    async fn put_workflow(&self, record: &WorkflowRecord) -> Result<(), StoreError>;

    /// Load a workflow row
    async fn get_workflow(&self, id: WorkflowId) -> Result<WorkflowRecord, StoreError>;

    /// Update workflow state
    async fn update_workflow_state(
        &self,
        id: WorkflowId,
        state: WorkflowState,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Workflows in a non-terminal state (restart recovery)
    async fn list_active_workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError>;

    // =========================================================================
    // Background Scheduler Recovery
    // =========================================================================

    /// Most recent admission time of a task emitted by the named schedule
    async fn last_scheduled(&self, name: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Whether a task emitted by the named schedule is still non-terminal
    async fn has_active_scheduled(&self, name: &str) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_apply() {
        let mut task = Task::new(tradeloop_contracts::TaskPayload::FetchEarnings {
            symbol: "ACME".into(),
        });
        let now = Utc::now();

        TransitionPatch::new()
            .with_started_at(now)
            .with_retry_count(2)
            .with_next_retry_at(Some(now))
            .apply(&mut task);

        assert_eq!(task.started_at, Some(now));
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.next_retry_at, Some(now));

        TransitionPatch::new()
            .with_next_retry_at(None)
            .apply(&mut task);
        assert_eq!(task.next_retry_at, None);
    }
}
