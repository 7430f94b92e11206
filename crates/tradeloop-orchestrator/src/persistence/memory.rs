//! In-memory implementation of TaskStore
//!
//! Primarily for tests; provides the same semantics as the SQLite
//! implementation. One RwLock per logical table (tasks, workflows, events).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use tradeloop_contracts::{
    CorrelationId, Event, QueueName, Task, TaskId, TaskState, WorkflowId, WorkflowState,
};

use super::store::{StoreError, TaskStore, TransitionPatch, WorkflowRecord};
use crate::config::RetentionConfig;

/// In-memory TaskStore
///
/// # Example
///
/// ```
/// use tradeloop_orchestrator::InMemoryTaskStore;
///
/// let store = InMemoryTaskStore::new();
/// ```
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    workflows: RwLock<HashMap<WorkflowId, WorkflowRecord>>,
    events: RwLock<Vec<Event>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            workflows: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
        }
    }

    /// Total task rows (test helper)
    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }

    /// Journaled event count (test helper)
    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }

    /// All journaled events in publication order (test helper)
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Clear all tables (test helper)
    pub fn clear(&self) {
        self.tasks.write().clear();
        self.workflows.write().clear();
        self.events.write().clear();
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn admit(&self, task: &Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists(task.id));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Task, StoreError> {
        self.tasks
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(id))
    }

    async fn contains(&self, id: TaskId) -> Result<bool, StoreError> {
        Ok(self.tasks.read().contains_key(&id))
    }

    async fn transition(
        &self,
        id: TaskId,
        from: TaskState,
        to: TaskState,
        patch: TransitionPatch,
    ) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;

        if task.state != from {
            return Err(StoreError::StaleState {
                id,
                expected: from,
                actual: task.state,
            });
        }

        task.state = to;
        patch.apply(task);
        Ok(task.clone())
    }

    async fn load_ready(
        &self,
        queue: QueueName,
        limit: usize,
        now: DateTime<Utc>,
        starvation_threshold: Duration,
    ) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.read();
        let mut ready: Vec<&Task> = tasks
            .values()
            .filter(|t| t.state == TaskState::Ready && t.queue() == queue)
            .collect();

        ready.sort_by(|a, b| {
            let pa = a.effective_priority(now, starvation_threshold);
            let pb = b.effective_priority(now, starvation_threshold);
            pb.cmp(&pa)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        Ok(ready.into_iter().take(limit).cloned().collect())
    }

    async fn due_retries(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, StoreError> {
        let tasks = self.tasks.read();
        Ok(tasks
            .values()
            .filter(|t| {
                t.state == TaskState::Pending
                    && t.queue() == queue
                    && t.next_retry_at.map(|at| at <= now).unwrap_or(false)
            })
            .map(|t| t.id)
            .collect())
    }

    async fn next_retry_at(&self, queue: QueueName) -> Result<Option<DateTime<Utc>>, StoreError> {
        let tasks = self.tasks.read();
        Ok(tasks
            .values()
            .filter(|t| t.state == TaskState::Pending && t.queue() == queue)
            .filter_map(|t| t.next_retry_at)
            .min())
    }

    async fn load_dependents(&self, id: TaskId) -> Result<Vec<TaskId>, StoreError> {
        let tasks = self.tasks.read();
        Ok(tasks
            .values()
            .filter(|t| t.dependencies.contains(&id))
            .map(|t| t.id)
            .collect())
    }

    async fn record_result(
        &self,
        id: TaskId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        self.transition(
            id,
            TaskState::Running,
            TaskState::Completed,
            TransitionPatch::new()
                .with_completed_at(now)
                .with_result(result)
                .with_next_retry_at(None),
        )
        .await
    }

    async fn list_by_workflow(&self, workflow_id: WorkflowId) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.read();
        let mut out: Vec<Task> = tasks
            .values()
            .filter(|t| t.parent_workflow_id == Some(workflow_id))
            .cloned()
            .collect();
        out.sort_by_key(|t| t.id);
        Ok(out)
    }

    async fn list_non_terminal(&self) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.read();
        let mut out: Vec<Task> = tasks
            .values()
            .filter(|t| !t.state.is_terminal())
            .cloned()
            .collect();
        out.sort_by_key(|t| t.id);
        Ok(out)
    }

    async fn counts_by_state(
        &self,
        queue: QueueName,
    ) -> Result<HashMap<TaskState, u64>, StoreError> {
        let tasks = self.tasks.read();
        let mut counts = HashMap::new();
        for task in tasks.values().filter(|t| t.queue() == queue) {
            *counts.entry(task.state).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn oldest_pending_age(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>, StoreError> {
        let tasks = self.tasks.read();
        Ok(tasks
            .values()
            .filter(|t| {
                t.queue() == queue
                    && matches!(t.state, TaskState::Pending | TaskState::Ready)
            })
            .map(|t| t.created_at)
            .min()
            .map(|oldest| {
                now.signed_duration_since(oldest)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            }))
    }

    async fn retain(
        &self,
        retention: &RetentionConfig,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.write();
        let before = tasks.len();

        tasks.retain(|_, task| {
            let reference = task.completed_at.unwrap_or(task.created_at);
            let age = now
                .signed_duration_since(reference)
                .to_std()
                .unwrap_or(Duration::ZERO);
            match task.state {
                TaskState::Completed => age < retention.completed,
                TaskState::Failed | TaskState::Cancelled | TaskState::Expired => {
                    age < retention.failed
                }
                _ => true,
            }
        });

        Ok((before - tasks.len()) as u64)
    }

    async fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        self.events.write().push(event.clone());
        Ok(())
    }

    async fn load_events(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Vec<Event>, StoreError> {
        let events = self.events.read();
        Ok(events
            .iter()
            .filter(|e| e.correlation_id == Some(correlation_id))
            .cloned()
            .collect())
    }

    async fn put_workflow(&self, record: &WorkflowRecord) -> Result<(), StoreError> {
        self.workflows.write().insert(record.id, record.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<WorkflowRecord, StoreError> {
        self.workflows
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(id))
    }

    async fn update_workflow_state(
        &self,
        id: WorkflowId,
        state: WorkflowState,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let record = workflows
            .get_mut(&id)
            .ok_or(StoreError::WorkflowNotFound(id))?;
        record.state = state;
        if completed_at.is_some() {
            record.completed_at = completed_at;
        }
        Ok(())
    }

    async fn list_active_workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        let workflows = self.workflows.read();
        let mut out: Vec<WorkflowRecord> = workflows
            .values()
            .filter(|w| !w.state.is_terminal())
            .cloned()
            .collect();
        out.sort_by_key(|w| w.id);
        Ok(out)
    }

    async fn last_scheduled(&self, name: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let tasks = self.tasks.read();
        Ok(tasks
            .values()
            .filter(|t| t.scheduled_by.as_deref() == Some(name))
            .map(|t| t.created_at)
            .max())
    }

    async fn has_active_scheduled(&self, name: &str) -> Result<bool, StoreError> {
        let tasks = self.tasks.read();
        Ok(tasks
            .values()
            .any(|t| t.scheduled_by.as_deref() == Some(name) && !t.state.is_terminal()))
    }
}
