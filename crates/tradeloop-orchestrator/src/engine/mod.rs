//! The scheduling engine
//!
//! Turns admitted tasks into executions while respecting priority,
//! dependencies, per-queue concurrency, rate budgets, circuit breakers, and
//! timeouts. One run loop per queue; all cross-task coordination flows
//! through the store's CAS transitions and the event bus.

mod admission;
mod run_loop;

pub use admission::AdmissionError;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tradeloop_contracts::{
    BrokerClient, Event, EventKind, LlmClient, MarketDataClient, QueueName, Task, TaskError,
    TaskErrorKind, TaskId, TaskState,
};

use crate::bus::EventBus;
use crate::config::{OrchestratorConfig, QueueConfig, RetentionConfig};
use crate::persistence::{with_store_retry, StoreError, TaskStore, TransitionPatch};
use crate::queues::{ContextServices, HandlerRegistry};
use crate::reliability::{CircuitBreaker, CircuitState, CircuitTransition, RateBudget};

/// Engine operation errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The store failed fatally; the engine refuses new work
    #[error("task store unavailable; engine refuses new work")]
    StoreUnavailable,

    /// Submission rejected at admission
    #[error("submission rejected: {0}")]
    Rejected(#[from] AdmissionError),

    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outbound collaborator clients injected at construction
#[derive(Clone)]
pub struct EngineClients {
    pub broker: Arc<dyn BrokerClient>,
    pub llm: Arc<dyn LlmClient>,
    pub market_data: Arc<dyn MarketDataClient>,
}

/// Point-in-time view of one queue
#[derive(Debug, Clone)]
pub struct QueueStatusSnapshot {
    pub queue: QueueName,
    pub enabled: bool,
    pub paused: bool,
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub counts: HashMap<TaskState, u64>,
    pub circuit: CircuitState,
    pub handler_unresponsive: u64,
    pub oldest_pending: Option<Duration>,
}

/// The external dependency a queue's circuit protects
fn queue_dependency(queue: QueueName) -> &'static str {
    match queue {
        QueueName::PortfolioSync => "broker",
        QueueName::DataFetcher => "market_data",
        QueueName::AiAnalysis => "llm",
    }
}

/// Per-queue runtime state
pub(crate) struct QueueRuntime {
    pub(crate) name: QueueName,
    pub(crate) notify: Notify,
    pub(crate) in_flight: AtomicUsize,
    pub(crate) paused: AtomicBool,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) cancel_tokens: DashMap<TaskId, CancellationToken>,
    pub(crate) handler_unresponsive: AtomicU64,
}

impl QueueRuntime {
    fn new(name: QueueName, config: &QueueConfig) -> Self {
        Self {
            name,
            notify: Notify::new(),
            in_flight: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            breaker: CircuitBreaker::new(queue_dependency(name), config.circuit.clone()),
            cancel_tokens: DashMap::new(),
            handler_unresponsive: AtomicU64::new(0),
        }
    }

    /// Claim one concurrency slot if any is free
    pub(crate) fn try_acquire_slot(&self, max_concurrent: usize) -> bool {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= max_concurrent {
                return false;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Release a slot and wake the run loop
    pub(crate) fn release_slot(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_one();
    }
}

pub(crate) struct EngineInner {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) bus: EventBus,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) services: ContextServices,
    pub(crate) rate_budget: Arc<RateBudget>,
    pub(crate) config: RwLock<Arc<OrchestratorConfig>>,
    pub(crate) queues: HashMap<QueueName, Arc<QueueRuntime>>,
    shutdown_tx: watch::Sender<bool>,
    store_failed: AtomicBool,
    started: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// The scheduling engine; cheap to clone, all clones share state
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        bus: EventBus,
        registry: Arc<HandlerRegistry>,
        clients: EngineClients,
        config: OrchestratorConfig,
    ) -> Self {
        let rate_budget = Arc::new(RateBudget::new(&config.rate));
        let services = ContextServices {
            broker: clients.broker,
            llm: clients.llm,
            market_data: clients.market_data,
            bus: bus.clone(),
            rate_budget: Arc::clone(&rate_budget),
        };

        let queues = QueueName::ALL
            .iter()
            .map(|&name| {
                (
                    name,
                    Arc::new(QueueRuntime::new(name, config.queue(name))),
                )
            })
            .collect();

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(EngineInner {
                store,
                bus,
                registry,
                services,
                rate_budget,
                config: RwLock::new(Arc::new(config)),
                queues,
                shutdown_tx,
                store_failed: AtomicBool::new(false),
                started: AtomicBool::new(false),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the per-queue run loops and the retention sweeper; idempotent
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("starting scheduling engine");

        let mut handles = self.inner.handles.lock();
        for queue_rt in self.inner.queues.values() {
            let inner = Arc::clone(&self.inner);
            let queue_rt = Arc::clone(queue_rt);
            let shutdown_rx = self.inner.shutdown_tx.subscribe();
            handles.push(tokio::spawn(run_loop::run_queue_loop(
                inner, queue_rt, shutdown_rx,
            )));
        }

        let inner = Arc::clone(&self.inner);
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        handles.push(tokio::spawn(retention_loop(inner, shutdown_rx)));
    }

    /// Graceful shutdown: stop the loops, cancel in-flight handlers, and
    /// wait for them to settle.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);

        for queue_rt in self.inner.queues.values() {
            for entry in queue_rt.cancel_tokens.iter() {
                entry.value().cancel();
            }
            queue_rt.notify.notify_one();
        }

        let handles: Vec<JoinHandle<()>> = self.inner.handles.lock().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .is_err()
            {
                warn!("engine task did not settle before shutdown deadline");
            }
        }
        info!("scheduling engine stopped");
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<OrchestratorConfig> {
        self.inner.config.read().clone()
    }

    /// Replace one queue's configuration; applied at the next batch boundary
    pub fn update_queue_config(&self, queue: QueueName, config: QueueConfig) {
        {
            let mut guard = self.inner.config.write();
            let mut next = (**guard).clone();
            *next.queue_mut(queue) = config;
            *guard = Arc::new(next);
        }
        self.inner.queue_rt(queue).notify.notify_one();
    }

    /// Validate and persist one task (see §admission); emits `TaskCreated`.
    pub async fn submit(&self, task: Task) -> Result<TaskId, EngineError> {
        self.submit_all(vec![task]).await.map(|mut ids| {
            debug_assert_eq!(ids.len(), 1);
            ids.remove(0)
        })
    }

    /// Validate and persist a batch that may carry internal dependencies
    pub async fn submit_all(&self, tasks: Vec<Task>) -> Result<Vec<TaskId>, EngineError> {
        let inner = &self.inner;
        if inner.store_failed.load(Ordering::SeqCst) {
            return Err(EngineError::StoreUnavailable);
        }

        // Validate the whole batch before admitting anything
        let batch_ids: std::collections::HashSet<TaskId> =
            tasks.iter().map(|t| t.id).collect();
        for task in &tasks {
            admission::validate_payload(&task.payload)?;
            if !inner.registry.has(task.queue(), task.task_type()) {
                return Err(AdmissionError::UnregisteredTaskType {
                    queue: task.queue(),
                    task_type: task.task_type().to_string(),
                }
                .into());
            }
            for dep in &task.dependencies {
                if *dep == task.id {
                    return Err(AdmissionError::CycleDetected(task.id).into());
                }
                if !batch_ids.contains(dep) && !inner.guarded_contains(*dep).await? {
                    return Err(AdmissionError::UnknownDependency {
                        task: task.id,
                        dep: *dep,
                    }
                    .into());
                }
            }
        }
        if let Some(id) = admission::detect_cycle(&tasks) {
            return Err(AdmissionError::CycleDetected(id).into());
        }

        let mut admitted = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            let initial = inner.initial_state(&task, &batch_ids).await?;
            task.state = initial;
            if initial == TaskState::Cancelled {
                task.completed_at = Some(Utc::now());
                task.cancel_reason = Some("dependency_failed".into());
                task.error = Some(TaskError::dependency_failed(
                    "dependency already failed at admission",
                ));
            }

            let stored = task.clone();
            let result = inner
                .guarded(
                    "admit",
                    with_store_retry("admit", || inner.store.admit(&stored)),
                )
                .await;
            match result {
                Ok(()) => {}
                Err(StoreError::AlreadyExists(id)) => {
                    return Err(AdmissionError::AlreadyExists(id).into())
                }
                Err(err) => return Err(err.into()),
            }

            inner
                .emit(
                    Event::new(
                        EventKind::TaskCreated,
                        format!("engine.{}", task.queue()),
                        json!({
                            "task_id": task.id,
                            "queue": task.queue().as_str(),
                            "task_type": task.task_type(),
                            "priority": task.priority.get(),
                        }),
                    )
                    .with_correlation(task.correlation_id),
                )
                .await;

            if initial == TaskState::Cancelled {
                inner
                    .emit_task_failed(&task, "dependency_failed", "dependency already failed")
                    .await;
            }

            inner.queue_rt(task.queue()).notify.notify_one();
            admitted.push(task.id);
        }

        Ok(admitted)
    }

    /// Cancel a task
    ///
    /// Pending/Ready tasks transition immediately; Running tasks get their
    /// cancellation signal and are settled by the execution wrapper within
    /// the configured grace.
    pub async fn cancel(&self, id: TaskId, reason: &str) -> Result<(), EngineError> {
        let inner = &self.inner;
        let task = inner.store.get(id).await?;

        match task.state {
            TaskState::Pending | TaskState::Ready => {
                let patch = TransitionPatch::new()
                    .with_completed_at(Utc::now())
                    .with_cancel_reason(reason)
                    .with_error(TaskError::cancelled(reason));
                match inner
                    .store
                    .transition(id, task.state, TaskState::Cancelled, patch)
                    .await
                {
                    Ok(cancelled) => {
                        inner.emit_task_failed(&cancelled, "cancelled", reason).await;
                        inner.cascade_dependents(id).await;
                        inner.queue_rt(task.queue()).notify.notify_one();
                    }
                    Err(StoreError::StaleState { .. }) => {
                        debug!(%id, "cancel lost the race; task moved on");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            TaskState::Running => {
                if let Some(token) = inner.queue_rt(task.queue()).cancel_tokens.get(&id) {
                    token.cancel();
                }
            }
            // Terminal states are final; cancelling them is a no-op
            _ => {}
        }
        Ok(())
    }

    /// Park a queue's run loop; Submits continue to persist
    pub async fn pause_queue(&self, queue: QueueName) {
        self.inner.queue_rt(queue).paused.store(true, Ordering::SeqCst);
        self.inner
            .emit(Event::new(
                EventKind::QueuePaused,
                format!("engine.{queue}"),
                json!({ "queue": queue.as_str() }),
            ))
            .await;
    }

    /// Resume a paused queue
    pub async fn resume_queue(&self, queue: QueueName) {
        let rt = self.inner.queue_rt(queue);
        rt.paused.store(false, Ordering::SeqCst);
        rt.notify.notify_one();
        self.inner
            .emit(Event::new(
                EventKind::QueueResumed,
                format!("engine.{queue}"),
                json!({ "queue": queue.as_str() }),
            ))
            .await;
    }

    /// Cancel every non-terminal task and pause all queues
    pub async fn emergency_stop(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        warn!("emergency stop requested");

        for &queue in QueueName::ALL.iter() {
            self.pause_queue(queue).await;
        }
        inner
            .emit(Event::new(
                EventKind::EmergencyStop,
                "engine",
                json!({}),
            ))
            .await;

        let tasks = inner.store.list_non_terminal().await?;
        for task in tasks {
            match task.state {
                TaskState::Running => {
                    if let Some(token) =
                        inner.queue_rt(task.queue()).cancel_tokens.get(&task.id)
                    {
                        token.cancel();
                    }
                }
                state @ (TaskState::Pending | TaskState::Ready) => {
                    let patch = TransitionPatch::new()
                        .with_completed_at(Utc::now())
                        .with_cancel_reason("emergency_stop")
                        .with_error(TaskError::cancelled("emergency stop"));
                    match inner
                        .store
                        .transition(task.id, state, TaskState::Cancelled, patch)
                        .await
                    {
                        Ok(cancelled) => {
                            inner
                                .emit_task_failed(&cancelled, "cancelled", "emergency stop")
                                .await;
                        }
                        Err(StoreError::StaleState { .. }) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Delete all Completed tasks immediately (terminal failures keep their
    /// normal retention).
    pub async fn clear_completed(&self) -> Result<u64, EngineError> {
        let retention = RetentionConfig {
            completed: Duration::ZERO,
            failed: Duration::from_secs(100 * 365 * 24 * 3600),
        };
        Ok(self.inner.store.retain(&retention, Utc::now()).await?)
    }

    /// Point-in-time status for one queue
    pub async fn queue_status(&self, queue: QueueName) -> Result<QueueStatusSnapshot, EngineError> {
        let inner = &self.inner;
        let rt = inner.queue_rt(queue);
        let config = inner.config.read().clone();
        let counts = inner.store.counts_by_state(queue).await?;
        let oldest_pending = inner.store.oldest_pending_age(queue, Utc::now()).await?;

        Ok(QueueStatusSnapshot {
            queue,
            enabled: config.queue(queue).enabled,
            paused: rt.paused.load(Ordering::SeqCst),
            in_flight: rt.in_flight.load(Ordering::SeqCst),
            max_concurrent: config.queue(queue).max_concurrent,
            counts,
            circuit: rt.breaker.state(),
            handler_unresponsive: rt.handler_unresponsive.load(Ordering::SeqCst),
            oldest_pending,
        })
    }

    /// Task history for the control API
    pub async fn task(&self, id: TaskId) -> Result<Task, EngineError> {
        Ok(self.inner.store.get(id).await?)
    }
}

impl EngineInner {
    pub(crate) fn queue_rt(&self, queue: QueueName) -> &Arc<QueueRuntime> {
        self.queues
            .get(&queue)
            .expect("all queues are constructed at engine creation")
    }

    pub(crate) fn config_snapshot(&self) -> Arc<OrchestratorConfig> {
        self.config.read().clone()
    }

    pub(crate) async fn emit(&self, event: Event) {
        self.bus.publish(event).await;
    }

    async fn emit_task_failed(&self, task: &Task, reason: &str, message: &str) {
        self.emit(
            Event::new(
                EventKind::TaskFailed,
                format!("engine.{}", task.queue()),
                json!({
                    "task_id": task.id,
                    "queue": task.queue().as_str(),
                    "reason": reason,
                    "message": message,
                }),
            )
            .with_correlation(task.correlation_id),
        )
        .await;
    }

    /// Run a store operation, flagging the engine on fatal store failure
    async fn guarded<T>(
        &self,
        op: &str,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match fut.await {
            Ok(value) => Ok(value),
            Err(err) => {
                if err.is_transient() {
                    self.mark_store_failure(op).await;
                }
                Err(err)
            }
        }
    }

    async fn guarded_contains(&self, id: TaskId) -> Result<bool, StoreError> {
        self.guarded(
            "contains",
            with_store_retry("contains", || self.store.contains(id)),
        )
        .await
    }

    async fn mark_store_failure(&self, op: &str) {
        if !self.store_failed.swap(true, Ordering::SeqCst) {
            tracing::error!(op, "fatal store failure; engine refuses new work");
            self.emit(Event::new(
                EventKind::CircuitOpened,
                "engine",
                json!({ "dependency": "store" }),
            ))
            .await;
        }
    }

    /// Initial state for an admitted task given the current dep states
    async fn initial_state(
        &self,
        task: &Task,
        batch_ids: &std::collections::HashSet<TaskId>,
    ) -> Result<TaskState, StoreError> {
        if task.dependencies.is_empty() {
            return Ok(TaskState::Ready);
        }

        let mut all_completed = true;
        for dep in &task.dependencies {
            if batch_ids.contains(dep) {
                // Batch members are admitted Pending/Ready, never Completed
                all_completed = false;
                continue;
            }
            let state = self.store.get(*dep).await?.state;
            match state {
                TaskState::Completed => {}
                TaskState::Failed | TaskState::Cancelled | TaskState::Expired => {
                    return Ok(TaskState::Cancelled);
                }
                _ => all_completed = false,
            }
        }

        Ok(if all_completed {
            TaskState::Ready
        } else {
            TaskState::Pending
        })
    }

    /// Settle a finished handler invocation
    pub(crate) async fn finish_task(
        &self,
        queue_rt: &Arc<QueueRuntime>,
        task: Task,
        outcome: Result<serde_json::Value, TaskError>,
    ) {
        let now = Utc::now();
        match outcome {
            Ok(value) => {
                if let Some(CircuitTransition::Closed) = queue_rt.breaker.record_success() {
                    self.emit(Event::new(
                        EventKind::CircuitClosed,
                        format!("engine.{}", queue_rt.name),
                        json!({ "dependency": queue_rt.breaker.dependency() }),
                    ))
                    .await;
                }

                match self.store.record_result(task.id, value, now).await {
                    Ok(completed) => {
                        self.emit(
                            Event::new(
                                EventKind::TaskCompleted,
                                format!("engine.{}", completed.queue()),
                                json!({
                                    "task_id": completed.id,
                                    "queue": completed.queue().as_str(),
                                    "task_type": completed.task_type(),
                                }),
                            )
                            .with_correlation(completed.correlation_id),
                        )
                        .await;
                        self.promote_dependents(task.id).await;
                    }
                    Err(StoreError::StaleState { .. }) => {
                        // Cancelled or emergency-stopped while finishing
                        debug!(task_id = %task.id, "completion lost the race");
                    }
                    Err(err) => {
                        warn!(task_id = %task.id, "failed to record result: {err}");
                    }
                }
            }
            Err(err) => self.handle_failure(queue_rt, task, err, now).await,
        }
    }

    async fn handle_failure(
        &self,
        queue_rt: &Arc<QueueRuntime>,
        task: Task,
        err: TaskError,
        now: DateTime<Utc>,
    ) {
        let config = self.config_snapshot();
        let queue_config = config.queue(queue_rt.name);

        match err.kind {
            TaskErrorKind::Cancelled => {
                let patch = TransitionPatch::new()
                    .with_completed_at(now)
                    .with_cancel_reason(err.message.clone())
                    .with_error(err.clone());
                match self
                    .store
                    .transition(task.id, TaskState::Running, TaskState::Cancelled, patch)
                    .await
                {
                    Ok(cancelled) => {
                        self.emit_task_failed(&cancelled, "cancelled", &err.message)
                            .await;
                        self.cascade_dependents(task.id).await;
                    }
                    Err(StoreError::StaleState { .. }) => {}
                    Err(store_err) => {
                        warn!(task_id = %task.id, "failed to record cancellation: {store_err}")
                    }
                }
            }

            TaskErrorKind::RateLimited => {
                if task.rate_retry_count < config.rate_retry_cap {
                    let delay = err
                        .retry_after
                        .unwrap_or_else(|| queue_config.backoff.delay(task.retry_count));
                    self.rearm(
                        queue_rt,
                        &task,
                        err.clone(),
                        now,
                        delay,
                        TransitionPatch::new()
                            .with_rate_retry_count(task.rate_retry_count + 1),
                    )
                    .await;
                } else {
                    self.terminal_fail(&task, err, now).await;
                }
            }

            TaskErrorKind::CircuitOpen => {
                // Requeued at cooldown expiry; does not consume a retry
                let delay = err.retry_after.unwrap_or(queue_config.circuit.cooldown);
                self.rearm(queue_rt, &task, err, now, delay, TransitionPatch::new())
                    .await;
            }

            _ => {
                // Upstream-shaped failures count toward the queue's circuit
                if matches!(
                    err.kind,
                    TaskErrorKind::Transient | TaskErrorKind::Timeout | TaskErrorKind::Fatal
                ) {
                    if let Some(CircuitTransition::Opened) = queue_rt.breaker.record_failure()
                    {
                        self.emit(Event::new(
                            EventKind::CircuitOpened,
                            format!("engine.{}", queue_rt.name),
                            json!({ "dependency": queue_rt.breaker.dependency() }),
                        ))
                        .await;
                    }
                }

                if err.recoverable && task.retry_count < task.max_retries {
                    let delay = queue_config.backoff.delay(task.retry_count);
                    self.rearm(
                        queue_rt,
                        &task,
                        err.clone(),
                        now,
                        delay,
                        TransitionPatch::new().with_retry_count(task.retry_count + 1),
                    )
                    .await;
                } else {
                    self.terminal_fail(&task, err, now).await;
                }
            }
        }
    }

    /// Running -> Pending with an armed retry timer
    async fn rearm(
        &self,
        queue_rt: &Arc<QueueRuntime>,
        task: &Task,
        err: TaskError,
        now: DateTime<Utc>,
        delay: Duration,
        extra: TransitionPatch,
    ) {
        let next_retry_at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| {
            chrono::Duration::seconds(60)
        });
        let patch = extra
            .with_next_retry_at(Some(next_retry_at))
            .with_error(err.clone());

        match self
            .store
            .transition(task.id, TaskState::Running, TaskState::Pending, patch)
            .await
        {
            Ok(rearmed) => {
                self.emit(
                    Event::new(
                        EventKind::TaskRetried,
                        format!("engine.{}", rearmed.queue()),
                        json!({
                            "task_id": rearmed.id,
                            "queue": rearmed.queue().as_str(),
                            "retry_count": rearmed.retry_count,
                            "rate_retry_count": rearmed.rate_retry_count,
                            "error_kind": err.kind.as_str(),
                            "next_retry_at": next_retry_at,
                        }),
                    )
                    .with_correlation(rearmed.correlation_id),
                )
                .await;
                queue_rt.notify.notify_one();
            }
            Err(StoreError::StaleState { .. }) => {}
            Err(store_err) => {
                warn!(task_id = %task.id, "failed to re-arm retry: {store_err}")
            }
        }
    }

    async fn terminal_fail(&self, task: &Task, err: TaskError, now: DateTime<Utc>) {
        let patch = TransitionPatch::new()
            .with_completed_at(now)
            .with_error(err.clone());
        match self
            .store
            .transition(task.id, TaskState::Running, TaskState::Failed, patch)
            .await
        {
            Ok(failed) => {
                self.emit_task_failed(&failed, err.kind.as_str(), &err.message)
                    .await;
                if err.kind == TaskErrorKind::Fatal {
                    self.emit(
                        Event::new(
                            EventKind::AlertRaised,
                            format!("engine.{}", failed.queue()),
                            json!({
                                "severity": tradeloop_contracts::AlertSeverity::Critical,
                                "task_id": failed.id,
                                "message": err.message,
                            }),
                        )
                        .with_correlation(failed.correlation_id),
                    )
                    .await;
                }
                self.cascade_dependents(task.id).await;
            }
            Err(StoreError::StaleState { .. }) => {}
            Err(store_err) => {
                warn!(task_id = %task.id, "failed to record failure: {store_err}")
            }
        }
    }

    /// After a task completes, promote dependents whose dependencies are now
    /// all terminal-success.
    async fn promote_dependents(&self, id: TaskId) {
        let dependents = match self.store.load_dependents(id).await {
            Ok(deps) => deps,
            Err(err) => {
                warn!(task_id = %id, "failed to load dependents: {err}");
                return;
            }
        };

        for dep_id in dependents {
            let Ok(candidate) = self.store.get(dep_id).await else {
                continue;
            };
            if candidate.state != TaskState::Pending || candidate.next_retry_at.is_some() {
                continue;
            }

            let mut all_completed = true;
            for dep in &candidate.dependencies {
                match self.store.get(*dep).await.map(|t| t.state) {
                    Ok(TaskState::Completed) => {}
                    _ => {
                        all_completed = false;
                        break;
                    }
                }
            }

            if all_completed {
                match self
                    .store
                    .transition(
                        dep_id,
                        TaskState::Pending,
                        TaskState::Ready,
                        TransitionPatch::new(),
                    )
                    .await
                {
                    Ok(ready) => {
                        self.queue_rt(ready.queue()).notify.notify_one();
                    }
                    Err(StoreError::StaleState { .. }) => {}
                    Err(err) => warn!(task_id = %dep_id, "failed to promote: {err}"),
                }
            }
        }
    }

    /// Cascade-cancel everything downstream of a non-Completed terminal
    pub(crate) async fn cascade_dependents(&self, id: TaskId) {
        let mut worklist = vec![id];
        while let Some(current) = worklist.pop() {
            let dependents = match self.store.load_dependents(current).await {
                Ok(deps) => deps,
                Err(err) => {
                    warn!(task_id = %current, "failed to load dependents: {err}");
                    continue;
                }
            };

            for dep_id in dependents {
                let patch = || {
                    TransitionPatch::new()
                        .with_completed_at(Utc::now())
                        .with_cancel_reason("dependency_failed")
                        .with_error(TaskError::dependency_failed(format!(
                            "dependency {current} reached a terminal failure"
                        )))
                };

                let cancelled = match self
                    .store
                    .transition(dep_id, TaskState::Pending, TaskState::Cancelled, patch())
                    .await
                {
                    Ok(t) => Some(t),
                    Err(StoreError::StaleState { .. }) => {
                        match self
                            .store
                            .transition(dep_id, TaskState::Ready, TaskState::Cancelled, patch())
                            .await
                        {
                            Ok(t) => Some(t),
                            Err(_) => None,
                        }
                    }
                    Err(_) => None,
                };

                if let Some(task) = cancelled {
                    self.emit_task_failed(
                        &task,
                        "dependency_failed",
                        &format!("dependency {current} failed"),
                    )
                    .await;
                    worklist.push(dep_id);
                }
            }
        }
    }
}

/// Periodic retention sweep plus age-based expiry
async fn retention_loop(inner: Arc<EngineInner>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        let config = inner.config_snapshot();
        let sleep = config.retention_sweep_interval;

        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = shutdown_rx.changed() => break,
        }

        let now = Utc::now();
        match inner.store.retain(&config.retention, now).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "retention sweep removed terminal tasks"),
            Err(err) => warn!("retention sweep failed: {err}"),
        }

        // Age-based expiry for queues that configure it
        let has_expiry = QueueName::ALL
            .iter()
            .any(|&q| config.queue(q).max_task_age.is_some());
        if !has_expiry {
            continue;
        }

        let tasks = match inner.store.list_non_terminal().await {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!("expiry scan failed: {err}");
                continue;
            }
        };
        for task in tasks {
            let Some(max_age) = config.queue(task.queue()).max_task_age else {
                continue;
            };
            if task.state == TaskState::Running {
                continue;
            }
            let age = now
                .signed_duration_since(task.created_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age <= max_age {
                continue;
            }

            let patch = TransitionPatch::new()
                .with_completed_at(now)
                .with_error(TaskError::new(
                    TaskErrorKind::Validation,
                    "task exceeded its maximum pending age",
                ));
            match inner
                .store
                .transition(task.id, task.state, TaskState::Expired, patch)
                .await
            {
                Ok(expired) => {
                    inner
                        .emit_task_failed(&expired, "expired", "maximum pending age exceeded")
                        .await;
                    inner.cascade_dependents(task.id).await;
                }
                Err(StoreError::StaleState { .. }) => {}
                Err(err) => warn!(task_id = %task.id, "failed to expire: {err}"),
            }
        }
    }
}
