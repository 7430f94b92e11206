//! Workflow orchestration
//!
//! Composes tasks into workflows and tracks their progress. Advancement is
//! driven solely by `TaskCompleted`/`TaskFailed` events from the bus; the
//! layer never polls. On restart, state is rebuilt by scanning tasks whose
//! `parent_workflow_id` is set.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use tradeloop_contracts::{
    CorrelationId, Event, EventKind, StepOutcome, StepPredicate, StepSpec, Task, TaskId,
    TaskState, TriggerFilter, WorkflowId, WorkflowMode, WorkflowSpec, WorkflowState,
};

use crate::bus::{EventBus, Subscription};
use crate::engine::{Engine, EngineError};
use crate::persistence::{StoreError, TaskStore, WorkflowRecord};

/// Orchestration errors
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(WorkflowId),

    #[error("invalid workflow spec: {0}")]
    InvalidSpec(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepState {
    /// Not yet emitted (initial, or predicate still false)
    Waiting,
    Emitted,
    Succeeded,
    Failed,
}

struct StepRuntime {
    spec: StepSpec,
    task_id: Option<TaskId>,
    state: StepState,
}

struct WorkflowRuntime {
    record: WorkflowRecord,
    steps: Vec<StepRuntime>,
    outcomes: HashMap<String, StepOutcome>,
}

/// Actions computed under the state lock, executed outside it
#[derive(Default)]
struct ProgressActions {
    emit: Vec<StepSpec>,
    cancel: Vec<TaskId>,
    finish: Option<WorkflowState>,
}

impl WorkflowRuntime {
    fn step_mut(&mut self, name: &str) -> Option<&mut StepRuntime> {
        self.steps.iter_mut().find(|s| s.spec.name == name)
    }

    fn emitted_non_terminal_tasks(&self) -> Vec<TaskId> {
        self.steps
            .iter()
            .filter(|s| s.state == StepState::Emitted)
            .filter_map(|s| s.task_id)
            .collect()
    }

    /// Decide what to do next given the current step states
    fn progress(&self) -> ProgressActions {
        let mut actions = ProgressActions::default();
        if self.record.state.is_terminal() {
            return actions;
        }

        match self.record.spec.mode {
            WorkflowMode::Sequential => {
                if self.steps.iter().any(|s| s.state == StepState::Failed) {
                    actions.finish = Some(WorkflowState::Failed);
                    return actions;
                }
                match self.steps.iter().position(|s| s.state == StepState::Waiting) {
                    Some(idx) => {
                        let prior_done = self.steps[..idx]
                            .iter()
                            .all(|s| s.state == StepState::Succeeded);
                        if prior_done {
                            actions.emit.push(self.steps[idx].spec.clone());
                        }
                    }
                    None => {
                        if self
                            .steps
                            .iter()
                            .all(|s| s.state == StepState::Succeeded)
                        {
                            actions.finish = Some(WorkflowState::Completed);
                        }
                    }
                }
            }

            WorkflowMode::Parallel => {
                let any_failed = self.steps.iter().any(|s| s.state == StepState::Failed);
                if any_failed && self.record.spec.fail_fast {
                    actions.cancel = self.emitted_non_terminal_tasks();
                    actions.finish = Some(WorkflowState::Failed);
                    return actions;
                }

                for step in &self.steps {
                    if step.state == StepState::Waiting {
                        actions.emit.push(step.spec.clone());
                    }
                }
                if actions.emit.is_empty()
                    && self
                        .steps
                        .iter()
                        .all(|s| matches!(s.state, StepState::Succeeded | StepState::Failed))
                {
                    actions.finish = Some(if any_failed {
                        WorkflowState::Failed
                    } else {
                        WorkflowState::Completed
                    });
                }
            }

            WorkflowMode::Conditional => {
                for step in &self.steps {
                    if step.state != StepState::Waiting {
                        continue;
                    }
                    let gate = step
                        .spec
                        .predicate
                        .clone()
                        .unwrap_or(StepPredicate::Always);
                    if gate.evaluate(&self.outcomes) {
                        actions.emit.push(step.spec.clone());
                    }
                }
                if actions.emit.is_empty() {
                    let running = self.steps.iter().any(|s| s.state == StepState::Emitted);
                    if !running {
                        let failed: Vec<&str> = self
                            .steps
                            .iter()
                            .filter(|s| s.state == StepState::Failed)
                            .map(|s| s.spec.name.as_str())
                            .collect();
                        if failed.is_empty() {
                            actions.finish = Some(WorkflowState::Completed);
                        } else {
                            // A failure is tolerated only when a compensating
                            // branch keyed on it ran and succeeded
                            let all_compensated = failed.iter().all(|name| {
                                self.steps.iter().any(|s| {
                                    s.state == StepState::Succeeded
                                        && s.spec
                                            .predicate
                                            .as_ref()
                                            .map(|p| references_failure(p, name))
                                            .unwrap_or(false)
                                })
                            });
                            actions.finish = Some(if all_compensated {
                                WorkflowState::Completed
                            } else {
                                WorkflowState::Failed
                            });
                        }
                    }
                }
            }

            // Trigger rules stay Running until cancelled
            WorkflowMode::EventDriven => {}
        }

        actions
    }
}

/// Whether a predicate tree conditions on the named step failing
fn references_failure(predicate: &StepPredicate, failed_step: &str) -> bool {
    match predicate {
        StepPredicate::StepFailed { step } => step == failed_step,
        StepPredicate::All { all } => all.iter().any(|p| references_failure(p, failed_step)),
        StepPredicate::Any { any } => any.iter().any(|p| references_failure(p, failed_step)),
        StepPredicate::Not { not } => references_failure(not, failed_step),
        _ => false,
    }
}

struct TriggerRuntime {
    workflow_id: WorkflowId,
    filter: TriggerFilter,
    steps: Vec<StepSpec>,
}

struct OrchestratorInner {
    engine: Engine,
    store: Arc<dyn TaskStore>,
    bus: EventBus,
    workflows: Mutex<HashMap<WorkflowId, WorkflowRuntime>>,
    task_index: Mutex<HashMap<TaskId, (WorkflowId, String)>>,
    triggers: Mutex<Vec<TriggerRuntime>>,
}

/// The orchestration layer; cheap to clone
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(engine: Engine, store: Arc<dyn TaskStore>, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                engine,
                store,
                bus,
                workflows: Mutex::new(HashMap::new()),
                task_index: Mutex::new(HashMap::new()),
                triggers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Subscribe to task lifecycle events and rebuild state from the store
    pub async fn start(&self) -> Result<(Subscription, Subscription), OrchestratorError> {
        self.recover().await?;

        let inner = Arc::clone(&self.inner);
        let lifecycle = self.inner.bus.subscribe(
            "orchestrator",
            Some(vec![EventKind::TaskCompleted, EventKind::TaskFailed]),
            Arc::new(move |event| {
                let inner = Arc::clone(&inner);
                async move {
                    inner.on_task_event(event).await;
                    Ok(())
                }
                .boxed()
            }),
        );

        let inner = Arc::clone(&self.inner);
        let triggers = self.inner.bus.subscribe(
            "orchestrator.triggers",
            None,
            Arc::new(move |event| {
                let inner = Arc::clone(&inner);
                async move {
                    inner.on_trigger_event(event).await;
                    Ok(())
                }
                .boxed()
            }),
        );

        Ok((lifecycle, triggers))
    }

    /// Validate, persist, and kick off a workflow
    pub async fn start_workflow(
        &self,
        spec: WorkflowSpec,
        correlation_id: Option<CorrelationId>,
    ) -> Result<WorkflowId, OrchestratorError> {
        validate_spec(&spec)?;

        let correlation = correlation_id.unwrap_or_else(CorrelationId::generate);
        let mut record = WorkflowRecord::new(spec, correlation);
        record.state = WorkflowState::Running;
        self.inner.store.put_workflow(&record).await?;

        let workflow_id = record.id;
        let runtime = WorkflowRuntime {
            steps: record
                .spec
                .steps
                .iter()
                .map(|s| StepRuntime {
                    spec: s.clone(),
                    task_id: None,
                    state: StepState::Waiting,
                })
                .collect(),
            record,
            outcomes: HashMap::new(),
        };

        let is_trigger = runtime.record.spec.mode == WorkflowMode::EventDriven;
        if is_trigger {
            let filter = runtime
                .record
                .spec
                .trigger
                .clone()
                .ok_or_else(|| OrchestratorError::InvalidSpec("missing trigger".into()))?;
            self.inner.triggers.lock().push(TriggerRuntime {
                workflow_id,
                filter,
                steps: runtime.record.spec.steps.clone(),
            });
        }

        self.inner.workflows.lock().insert(workflow_id, runtime);

        if !is_trigger {
            self.inner.drive(workflow_id).await;
        }
        info!(%workflow_id, "workflow started");
        Ok(workflow_id)
    }

    /// Cancel a workflow and all of its non-terminal tasks
    pub async fn cancel_workflow(&self, id: WorkflowId) -> Result<(), OrchestratorError> {
        let task_ids: Vec<TaskId> = {
            let mut workflows = self.inner.workflows.lock();
            let runtime = workflows
                .get_mut(&id)
                .ok_or(OrchestratorError::UnknownWorkflow(id))?;
            runtime.record.state = WorkflowState::Cancelled;
            runtime.emitted_non_terminal_tasks()
        };

        self.inner
            .triggers
            .lock()
            .retain(|t| t.workflow_id != id);

        for task_id in task_ids {
            if let Err(err) = self.inner.engine.cancel(task_id, "workflow cancelled").await {
                warn!(%task_id, "failed to cancel workflow task: {err}");
            }
        }

        self.inner
            .store
            .update_workflow_state(id, WorkflowState::Cancelled, Some(Utc::now()))
            .await?;
        Ok(())
    }

    /// Current state of a workflow
    pub fn workflow_state(&self, id: WorkflowId) -> Option<WorkflowState> {
        self.inner
            .workflows
            .lock()
            .get(&id)
            .map(|w| w.record.state)
    }

    /// Rebuild runtime state from persisted workflows and their tasks
    async fn recover(&self) -> Result<(), OrchestratorError> {
        let records = self.inner.store.list_active_workflows().await?;
        if records.is_empty() {
            return Ok(());
        }
        info!(count = records.len(), "recovering active workflows");

        let mut recovered = vec![];
        for record in records {
            let tasks = self.inner.store.list_by_workflow(record.id).await?;
            let mut runtime = WorkflowRuntime {
                steps: record
                    .spec
                    .steps
                    .iter()
                    .map(|s| StepRuntime {
                        spec: s.clone(),
                        task_id: None,
                        state: StepState::Waiting,
                    })
                    .collect(),
                record,
                outcomes: HashMap::new(),
            };

            for task in &tasks {
                let Some(step_name) = task.workflow_step.clone() else {
                    continue;
                };
                let workflow_id = runtime.record.id;
                let recovered_state = match task.state {
                    TaskState::Completed => StepState::Succeeded,
                    TaskState::Failed | TaskState::Cancelled | TaskState::Expired => {
                        StepState::Failed
                    }
                    _ => StepState::Emitted,
                };

                match runtime.step_mut(&step_name) {
                    Some(step) => {
                        step.task_id = Some(task.id);
                        step.state = recovered_state;
                    }
                    None => continue,
                }

                match recovered_state {
                    StepState::Succeeded => {
                        runtime.outcomes.insert(
                            step_name,
                            StepOutcome::Succeeded(
                                task.result.clone().unwrap_or(serde_json::Value::Null),
                            ),
                        );
                    }
                    StepState::Failed => {
                        runtime.outcomes.insert(step_name, StepOutcome::Failed);
                    }
                    StepState::Emitted => {
                        self.inner
                            .task_index
                            .lock()
                            .insert(task.id, (workflow_id, step_name));
                    }
                    StepState::Waiting => {}
                }
            }

            if runtime.record.spec.mode == WorkflowMode::EventDriven {
                if let Some(filter) = runtime.record.spec.trigger.clone() {
                    self.inner.triggers.lock().push(TriggerRuntime {
                        workflow_id: runtime.record.id,
                        filter,
                        steps: runtime.record.spec.steps.clone(),
                    });
                }
            }

            recovered.push(runtime.record.id);
            self.inner
                .workflows
                .lock()
                .insert(runtime.record.id, runtime);
        }

        // Resume whatever is emissible after the rebuild
        for id in recovered {
            self.inner.drive(id).await;
        }
        Ok(())
    }
}

impl OrchestratorInner {
    /// Apply one task outcome and advance its workflow
    async fn on_task_event(&self, event: Event) {
        let Some(task_id) = event
            .payload
            .get("task_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<uuid::Uuid>().ok())
            .map(TaskId)
        else {
            return;
        };

        let Some((workflow_id, step_name)) = self.task_index.lock().remove(&task_id) else {
            return;
        };

        let success = event.kind == EventKind::TaskCompleted;
        let result = if success {
            match self.store.get(task_id).await {
                Ok(task) => task.result.unwrap_or(serde_json::Value::Null),
                Err(_) => serde_json::Value::Null,
            }
        } else {
            serde_json::Value::Null
        };

        {
            let mut workflows = self.workflows.lock();
            let Some(runtime) = workflows.get_mut(&workflow_id) else {
                return;
            };
            if let Some(step) = runtime.step_mut(&step_name) {
                step.state = if success {
                    StepState::Succeeded
                } else {
                    StepState::Failed
                };
            }
            runtime.outcomes.insert(
                step_name,
                if success {
                    StepOutcome::Succeeded(result)
                } else {
                    StepOutcome::Failed
                },
            );
        }

        self.drive(workflow_id).await;
    }

    /// Emit trigger bodies for matching events
    async fn on_trigger_event(&self, event: Event) {
        let matches: Vec<(WorkflowId, Vec<StepSpec>)> = {
            let triggers = self.triggers.lock();
            triggers
                .iter()
                .filter(|t| {
                    t.filter.kinds.contains(&event.kind)
                        && t.filter
                            .source
                            .as_ref()
                            .map(|s| *s == event.source)
                            .unwrap_or(true)
                })
                .map(|t| (t.workflow_id, t.steps.clone()))
                .collect()
        };

        for (workflow_id, steps) in matches {
            let correlation = event.correlation_id.unwrap_or_else(CorrelationId::generate);
            debug!(%workflow_id, kind = %event.kind, "trigger fired");
            for spec in steps {
                let task = build_task(&spec, correlation, workflow_id);
                if let Err(err) = self.engine.submit(task).await {
                    warn!(%workflow_id, step = %spec.name, "trigger emission rejected: {err}");
                }
            }
        }
    }

    /// Compute and execute the next actions for a workflow
    async fn drive(&self, workflow_id: WorkflowId) {
        loop {
            let (actions, correlation) = {
                let workflows = self.workflows.lock();
                let Some(runtime) = workflows.get(&workflow_id) else {
                    return;
                };
                (runtime.progress(), runtime.record.correlation_id)
            };

            if actions.emit.is_empty() && actions.cancel.is_empty() && actions.finish.is_none()
            {
                return;
            }

            for task_id in &actions.cancel {
                if let Err(err) = self.engine.cancel(*task_id, "workflow fail_fast").await {
                    warn!(%task_id, "fail_fast cancel failed: {err}");
                }
            }

            let mut emission_failed = false;
            for spec in actions.emit {
                let task = build_task(&spec, correlation, workflow_id);
                let task_id = task.id;
                match self.engine.submit(task).await {
                    Ok(_) => {
                        self.task_index
                            .lock()
                            .insert(task_id, (workflow_id, spec.name.clone()));
                        let mut workflows = self.workflows.lock();
                        if let Some(runtime) = workflows.get_mut(&workflow_id) {
                            if let Some(step) = runtime.step_mut(&spec.name) {
                                step.task_id = Some(task_id);
                                step.state = StepState::Emitted;
                            }
                        }
                    }
                    Err(err) => {
                        warn!(%workflow_id, step = %spec.name, "step emission rejected: {err}");
                        emission_failed = true;
                        let mut workflows = self.workflows.lock();
                        if let Some(runtime) = workflows.get_mut(&workflow_id) {
                            if let Some(step) = runtime.step_mut(&spec.name) {
                                step.state = StepState::Failed;
                            }
                            runtime
                                .outcomes
                                .insert(spec.name.clone(), StepOutcome::Failed);
                        }
                    }
                }
            }

            if let Some(final_state) = actions.finish {
                self.finish_workflow(workflow_id, final_state, correlation).await;
                return;
            }
            if emission_failed {
                // A synchronous rejection changed step states; re-evaluate
                continue;
            }
            return;
        }
    }

    async fn finish_workflow(
        &self,
        workflow_id: WorkflowId,
        state: WorkflowState,
        correlation: CorrelationId,
    ) {
        {
            let mut workflows = self.workflows.lock();
            if let Some(runtime) = workflows.get_mut(&workflow_id) {
                if runtime.record.state.is_terminal() {
                    return;
                }
                runtime.record.state = state;
                runtime.record.completed_at = Some(Utc::now());
            }
        }

        if let Err(err) = self
            .store
            .update_workflow_state(workflow_id, state, Some(Utc::now()))
            .await
        {
            warn!(%workflow_id, "failed to persist workflow state: {err}");
        }

        info!(%workflow_id, %state, "workflow finished");
        if state == WorkflowState::Completed {
            self.bus
                .publish(
                    Event::new(
                        EventKind::WorkflowCompleted,
                        "orchestrator",
                        json!({ "workflow_id": workflow_id }),
                    )
                    .with_correlation(correlation),
                )
                .await;
        }
    }
}

fn build_task(spec: &StepSpec, correlation: CorrelationId, workflow_id: WorkflowId) -> Task {
    let mut task = Task::new(spec.payload.clone())
        .with_priority(spec.priority)
        .with_correlation_id(correlation)
        .with_parent_workflow(workflow_id)
        .with_workflow_step(spec.name.clone());
    if let Some(timeout) = spec.timeout {
        task = task.with_timeout(timeout);
    }
    if let Some(max_retries) = spec.max_retries {
        task = task.with_max_retries(max_retries);
    }
    task
}

fn validate_spec(spec: &WorkflowSpec) -> Result<(), OrchestratorError> {
    if spec.steps.is_empty() {
        return Err(OrchestratorError::InvalidSpec(
            "workflow needs at least one step".into(),
        ));
    }
    let mut names = std::collections::HashSet::new();
    for step in &spec.steps {
        if !names.insert(step.name.as_str()) {
            return Err(OrchestratorError::InvalidSpec(format!(
                "duplicate step name: {}",
                step.name
            )));
        }
    }
    if spec.mode == WorkflowMode::EventDriven && spec.trigger.is_none() {
        return Err(OrchestratorError::InvalidSpec(
            "event-driven workflow needs a trigger".into(),
        ));
    }
    Ok(())
}
