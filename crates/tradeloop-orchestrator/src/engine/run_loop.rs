//! The per-queue run loop
//!
//! Each queue gets one coordinator task. It wakes on new Ready work, retry
//! timers, slot releases, and shutdown; pulls an admission batch ordered by
//! effective priority; gates it through the circuit breaker and rate budget;
//! and dispatches handlers on their own tasks with cancellation and timeout.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tradeloop_contracts::{
    Event, EventKind, ExternalApi, Task, TaskError, TaskErrorKind, TaskState,
};

use crate::config::{OrchestratorConfig, QueueConfig};
use crate::persistence::{StoreError, TransitionPatch};
use crate::queues::{TaskContext, TaskHandler};
use crate::reliability::{CircuitDecision, RateDecision};

use super::{EngineInner, QueueRuntime};

/// Fallback delay when an API has no configured keys at all
const EXHAUSTED_DELAY: Duration = Duration::from_secs(60);

pub(crate) async fn run_queue_loop(
    inner: Arc<EngineInner>,
    queue_rt: Arc<QueueRuntime>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let queue = queue_rt.name;
    debug!(%queue, "run loop started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Config is a read-only snapshot per iteration; changes apply at
        // batch boundaries, never mid-task.
        let config = inner.config_snapshot();
        let queue_config = config.queue(queue).clone();
        let parked = queue_rt.paused.load(Ordering::SeqCst) || !queue_config.enabled;

        let mut timer: Option<Duration> = None;

        if !parked {
            promote_due_retries(&inner, &queue_rt).await;

            // Circuit open: no admission until the cooldown elapses
            let mut admitting = true;
            if let Some(remaining) = queue_rt.breaker.cooldown_remaining() {
                if remaining > Duration::ZERO {
                    admitting = false;
                    timer = merge_timer(timer, remaining);
                }
            }

            if admitting {
                let in_flight = queue_rt.in_flight.load(Ordering::SeqCst);
                let free = queue_config.max_concurrent.saturating_sub(in_flight);
                if free > 0 {
                    match inner
                        .store
                        .load_ready(queue, free, Utc::now(), config.starvation_threshold)
                        .await
                    {
                        Ok(batch) => {
                            for task in batch {
                                match try_dispatch(
                                    &inner,
                                    &queue_rt,
                                    &config,
                                    &queue_config,
                                    task,
                                )
                                .await
                                {
                                    DispatchOutcome::Dispatched
                                    | DispatchOutcome::Skipped => {}
                                    DispatchOutcome::NoSlot => break,
                                    DispatchOutcome::CircuitRejected { retry_in } => {
                                        timer = merge_timer(timer, retry_in);
                                        break;
                                    }
                                }
                            }
                        }
                        Err(err) => warn!(%queue, "failed to load ready batch: {err}"),
                    }
                }
            }

            // Earliest armed retry timer decides how long we may sleep
            if let Ok(Some(next)) = inner.store.next_retry_at(queue).await {
                let wait = next
                    .signed_duration_since(Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .max(Duration::from_millis(10));
                timer = merge_timer(timer, wait);
            }
        }

        tokio::select! {
            _ = queue_rt.notify.notified() => {}
            _ = sleep_or_park(timer) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    debug!(%queue, "run loop exited");
}

fn merge_timer(current: Option<Duration>, candidate: Duration) -> Option<Duration> {
    Some(current.map_or(candidate, |c| c.min(candidate)))
}

async fn sleep_or_park(timer: Option<Duration>) {
    match timer {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending::<()>().await,
    }
}

/// Move Pending tasks whose retry timer elapsed back to Ready
async fn promote_due_retries(inner: &Arc<EngineInner>, queue_rt: &Arc<QueueRuntime>) {
    let now = Utc::now();
    let due = match inner.store.due_retries(queue_rt.name, now).await {
        Ok(due) => due,
        Err(err) => {
            warn!(queue = %queue_rt.name, "failed to scan retry timers: {err}");
            return;
        }
    };

    for id in due {
        match inner
            .store
            .transition(
                id,
                TaskState::Pending,
                TaskState::Ready,
                TransitionPatch::new().with_next_retry_at(None),
            )
            .await
        {
            Ok(_) | Err(StoreError::StaleState { .. }) => {}
            Err(err) => warn!(task_id = %id, "failed to promote retry: {err}"),
        }
    }
}

enum DispatchOutcome {
    /// Handler is running on its own task
    Dispatched,
    /// Candidate was deferred or lost a race; batch continues
    Skipped,
    /// No concurrency slot free; stop the batch
    NoSlot,
    /// Circuit rejected the candidate; stop the batch
    CircuitRejected { retry_in: Duration },
}

async fn try_dispatch(
    inner: &Arc<EngineInner>,
    queue_rt: &Arc<QueueRuntime>,
    config: &Arc<OrchestratorConfig>,
    queue_config: &QueueConfig,
    task: Task,
) -> DispatchOutcome {
    if !queue_rt.try_acquire_slot(queue_config.max_concurrent) {
        return DispatchOutcome::NoSlot;
    }

    let probing = match queue_rt.breaker.acquire() {
        CircuitDecision::Allow => false,
        CircuitDecision::Probe => true,
        CircuitDecision::Rejected { retry_in } => {
            queue_rt.release_slot();
            return DispatchOutcome::CircuitRejected { retry_in };
        }
    };

    let abort = |held_probe: bool| {
        if held_probe {
            queue_rt.breaker.release_probe();
        }
        queue_rt.release_slot();
    };

    let Some(handler) = inner.registry.get(queue_rt.name, task.task_type()) else {
        // Handler was deregistered after admission; fail at dispatch
        let patch = TransitionPatch::new()
            .with_completed_at(Utc::now())
            .with_error(TaskError::validation(format!(
                "no handler for {}",
                task.task_type()
            )));
        if let Ok(failed) = inner
            .store
            .transition(task.id, TaskState::Ready, TaskState::Failed, patch)
            .await
        {
            inner
                .emit(
                    Event::new(
                        EventKind::TaskFailed,
                        format!("engine.{}", queue_rt.name),
                        json!({
                            "task_id": failed.id,
                            "queue": failed.queue().as_str(),
                            "reason": "validation",
                            "message": "no handler registered at dispatch",
                        }),
                    )
                    .with_correlation(failed.correlation_id),
                )
                .await;
            inner.cascade_dependents(task.id).await;
        }
        abort(probing);
        return DispatchOutcome::Skipped;
    };

    // Rate budget for every API the handler declares
    let mut grants: Vec<(ExternalApi, String)> = Vec::new();
    let mut deferral: Option<(ExternalApi, Duration)> = None;
    for api in handler.required_apis() {
        match inner.rate_budget.acquire(*api, 1.0) {
            RateDecision::Granted { key } => grants.push((*api, key)),
            RateDecision::WaitFor(wait) => {
                deferral = Some((*api, wait));
                break;
            }
            RateDecision::Exhausted => {
                deferral = Some((*api, EXHAUSTED_DELAY));
                break;
            }
        }
    }

    if let Some((api, wait)) = deferral {
        // Re-armed without consuming a retry
        let next_retry_at = Utc::now()
            + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::seconds(60));
        match inner
            .store
            .transition(
                task.id,
                TaskState::Ready,
                TaskState::Pending,
                TransitionPatch::new().with_next_retry_at(Some(next_retry_at)),
            )
            .await
        {
            Ok(deferred) => {
                inner
                    .emit(
                        Event::new(
                            EventKind::RateLimitExceeded,
                            format!("engine.{}", queue_rt.name),
                            json!({
                                "api": api.as_str(),
                                "task_id": deferred.id,
                                "wait_ms": wait.as_millis() as u64,
                            }),
                        )
                        .with_correlation(deferred.correlation_id),
                    )
                    .await;
            }
            Err(StoreError::StaleState { .. }) => {}
            Err(err) => warn!(task_id = %task.id, "failed to defer for rate budget: {err}"),
        }
        abort(probing);
        queue_rt.notify.notify_one();
        return DispatchOutcome::Skipped;
    }

    // Claim the task; a concurrent cancel wins this race
    let now = Utc::now();
    let running = match inner
        .store
        .transition(
            task.id,
            TaskState::Ready,
            TaskState::Running,
            TransitionPatch::new()
                .with_started_at(now)
                .with_next_retry_at(None),
        )
        .await
    {
        Ok(running) => running,
        Err(StoreError::StaleState { .. }) => {
            abort(probing);
            return DispatchOutcome::Skipped;
        }
        Err(err) => {
            warn!(task_id = %task.id, "failed to claim task: {err}");
            abort(probing);
            return DispatchOutcome::Skipped;
        }
    };

    let token = CancellationToken::new();
    queue_rt.cancel_tokens.insert(running.id, token.clone());

    inner
        .emit(
            Event::new(
                EventKind::TaskStarted,
                format!("engine.{}", queue_rt.name),
                json!({
                    "task_id": running.id,
                    "queue": running.queue().as_str(),
                    "task_type": running.task_type(),
                    "attempt": running.retry_count + 1,
                }),
            )
            .with_correlation(running.correlation_id),
        )
        .await;

    tokio::spawn(execute_task(
        Arc::clone(inner),
        Arc::clone(queue_rt),
        running,
        handler,
        token,
        grants,
        config.cancel_grace,
    ));

    DispatchOutcome::Dispatched
}

/// Run one handler invocation to a settled outcome
async fn execute_task(
    inner: Arc<EngineInner>,
    queue_rt: Arc<QueueRuntime>,
    task: Task,
    handler: Arc<dyn TaskHandler>,
    token: CancellationToken,
    grants: Vec<(ExternalApi, String)>,
    cancel_grace: Duration,
) {
    let ctx = TaskContext {
        task_id: task.id,
        correlation_id: task.correlation_id,
        attempt: task.retry_count + 1,
        deadline: Utc::now()
            + chrono::Duration::from_std(task.timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
        cancellation: token.clone(),
        rate_grants: grants.clone(),
        services: inner.services.clone(),
    };

    let outcome = {
        let fut = handler.handle(&ctx, &task.payload);
        tokio::pin!(fut);
        let deadline = tokio::time::Instant::now() + task.timeout;

        tokio::select! {
            res = &mut fut => res,
            _ = token.cancelled() => {
                // Bounded grace for the handler to observe cancellation; a
                // late return is ignored for state purposes either way.
                if tokio::time::timeout(cancel_grace, &mut fut).await.is_err() {
                    queue_rt.handler_unresponsive.fetch_add(1, Ordering::SeqCst);
                    warn!(task_id = %task.id, "handler unresponsive after cancellation grace");
                }
                Err(TaskError::cancelled("task cancelled"))
            }
            _ = tokio::time::sleep_until(deadline) => {
                token.cancel();
                Err(TaskError::timeout(format!(
                    "handler exceeded {:?} timeout",
                    task.timeout
                )))
            }
        }
    };

    for (api, key) in &grants {
        let retry_after = outcome.as_ref().err().and_then(|e| {
            if e.kind == TaskErrorKind::RateLimited {
                e.retry_after
            } else {
                None
            }
        });
        inner
            .rate_budget
            .report(*api, key, outcome.is_ok(), retry_after);
    }

    // Outcomes that say nothing about the dependency hand back the probe
    match &outcome {
        Ok(_) => {}
        Err(e)
            if matches!(
                e.kind,
                TaskErrorKind::Transient | TaskErrorKind::Timeout | TaskErrorKind::Fatal
            ) => {}
        Err(_) => queue_rt.breaker.release_probe(),
    }

    queue_rt.cancel_tokens.remove(&task.id);
    inner.finish_task(&queue_rt, task, outcome).await;
    queue_rt.release_slot();
}
