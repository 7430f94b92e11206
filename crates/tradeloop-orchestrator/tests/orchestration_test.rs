//! Orchestration integration tests: sequential, parallel fail_fast,
//! conditional gating, event-driven triggers, cancellation, and restart
//! recovery.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_config, TestHarness};
use chrono::Utc;
use tradeloop_contracts::{
    ClientError, CorrelationId, EventKind, StepPredicate, StepSpec, Task, TaskPayload,
    TaskState, TriggerFilter, WorkflowSpec, WorkflowState,
};
use tradeloop_orchestrator::orchestration::Orchestrator;
use tradeloop_orchestrator::persistence::{TaskStore, WorkflowRecord};

const DEADLINE: Duration = Duration::from_secs(5);

async fn orchestrator(h: &TestHarness) -> Orchestrator {
    let orch = Orchestrator::new(
        h.engine.clone(),
        Arc::clone(&h.store) as Arc<dyn TaskStore>,
        h.bus.clone(),
    );
    orch.start().await.unwrap();
    orch
}

fn sequential_spec() -> WorkflowSpec {
    WorkflowSpec::sequential(vec![
        StepSpec::new(
            "sync",
            TaskPayload::SyncBalances {
                account_id: "acct-1".into(),
            },
        ),
        StepSpec::new(
            "news",
            TaskPayload::FetchNews {
                symbols: vec!["ACME".into()],
                lookback_hours: 24,
            },
        ),
        StepSpec::new(
            "recommend",
            TaskPayload::GenerateRecommendation {
                symbol: "ACME".into(),
            },
        ),
    ])
}

#[tokio::test]
async fn test_sequential_workflow_completes_in_order() {
    let h = TestHarness::start(fast_config()).await;
    let orch = orchestrator(&h).await;

    let wf = orch.start_workflow(sequential_spec(), None).await.unwrap();

    h.wait_until(DEADLINE, "workflow completed", || {
        orch.workflow_state(wf) == Some(WorkflowState::Completed)
    })
    .await;

    // Every step completed, sharing the workflow's correlation id
    let tasks = h.store.list_by_workflow(wf).await.unwrap();
    assert_eq!(tasks.len(), 3);
    assert!(tasks.iter().all(|t| t.state == TaskState::Completed));
    let correlation = tasks[0].correlation_id;
    assert!(tasks.iter().all(|t| t.correlation_id == correlation));

    // Per-correlation ordering: each step starts only after the previous
    // one completed, and WorkflowCompleted arrives last
    h.wait_until(DEADLINE, "workflow event published", || {
        !h.events_of_kind(EventKind::WorkflowCompleted).is_empty()
    })
    .await;
    let events: Vec<EventKind> = h
        .events()
        .iter()
        .filter(|e| e.correlation_id == Some(correlation))
        .map(|e| e.kind)
        .collect();
    let started: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, k)| **k == EventKind::TaskStarted)
        .map(|(i, _)| i)
        .collect();
    let completed: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, k)| **k == EventKind::TaskCompleted)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(started.len(), 3);
    assert_eq!(completed.len(), 3);
    for i in 0..2 {
        assert!(
            completed[i] < started[i + 1],
            "step {} completed after step {} started",
            i,
            i + 1
        );
    }
    let wf_completed = events
        .iter()
        .position(|k| *k == EventKind::WorkflowCompleted)
        .unwrap();
    assert!(wf_completed > completed[2]);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_sequential_workflow_fails_on_step_failure() {
    let h = TestHarness::start(fast_config()).await;
    let orch = orchestrator(&h).await;
    h.market.fail_next(1, ClientError::Fatal("corrupt".into()));

    let spec = WorkflowSpec::sequential(vec![
        StepSpec::new(
            "fetch",
            TaskPayload::FetchEarnings {
                symbol: "ACME".into(),
            },
        )
        .with_max_retries(0),
        StepSpec::new(
            "analyze",
            TaskPayload::AnalyzeEarnings {
                symbol: "ACME".into(),
            },
        ),
    ]);

    let wf = orch.start_workflow(spec, None).await.unwrap();
    h.wait_until(DEADLINE, "workflow failed", || {
        orch.workflow_state(wf) == Some(WorkflowState::Failed)
    })
    .await;

    // The second step was never emitted
    let tasks = h.store.list_by_workflow(wf).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert!(h.events_of_kind(EventKind::WorkflowCompleted).is_empty());
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_parallel_fail_fast_cancels_siblings() {
    let h = TestHarness::start(fast_config()).await;
    let orch = orchestrator(&h).await;

    // The data step fails immediately; the LLM step is slow enough to still
    // be in flight when fail_fast kicks in
    h.market.fail_next(1, ClientError::Fatal("corrupt".into()));
    h.llm.set_latency(Duration::from_secs(3));

    let spec = WorkflowSpec::parallel(
        vec![
            StepSpec::new(
                "fetch",
                TaskPayload::FetchEarnings {
                    symbol: "ACME".into(),
                },
            )
            .with_max_retries(0),
            StepSpec::new(
                "prep",
                TaskPayload::MorningPrep {
                    symbols: vec!["ACME".into()],
                },
            ),
        ],
        true,
    );

    let wf = orch.start_workflow(spec, None).await.unwrap();
    h.wait_until(DEADLINE, "workflow failed fast", || {
        orch.workflow_state(wf) == Some(WorkflowState::Failed)
    })
    .await;

    let tasks = h.store.list_by_workflow(wf).await.unwrap();
    let prep = tasks
        .iter()
        .find(|t| t.workflow_step.as_deref() == Some("prep"))
        .unwrap();
    h.wait_for_state(prep.id, TaskState::Cancelled, DEADLINE).await;
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_parallel_all_success_completes() {
    let h = TestHarness::start(fast_config()).await;
    let orch = orchestrator(&h).await;

    let spec = WorkflowSpec::parallel(
        vec![
            StepSpec::new(
                "balances",
                TaskPayload::SyncBalances {
                    account_id: "acct-1".into(),
                },
            ),
            StepSpec::new(
                "positions",
                TaskPayload::UpdatePositions {
                    account_id: "acct-1".into(),
                },
            ),
            StepSpec::new(
                "news",
                TaskPayload::FetchNews {
                    symbols: vec!["ACME".into()],
                    lookback_hours: 4,
                },
            ),
        ],
        false,
    );

    let wf = orch.start_workflow(spec, None).await.unwrap();
    h.wait_until(DEADLINE, "workflow completed", || {
        orch.workflow_state(wf) == Some(WorkflowState::Completed)
    })
    .await;
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_conditional_takes_success_branch() {
    let h = TestHarness::start(fast_config()).await;
    let orch = orchestrator(&h).await;

    let spec = WorkflowSpec::conditional(vec![
        StepSpec::new(
            "fetch",
            TaskPayload::FetchEarnings {
                symbol: "ACME".into(),
            },
        ),
        StepSpec::new(
            "analyze",
            TaskPayload::AnalyzeEarnings {
                symbol: "ACME".into(),
            },
        )
        .with_predicate(StepPredicate::StepSucceeded {
            step: "fetch".into(),
        }),
        StepSpec::new(
            "fallback",
            TaskPayload::FetchFundamentals {
                symbol: "ACME".into(),
            },
        )
        .with_predicate(StepPredicate::StepFailed {
            step: "fetch".into(),
        }),
    ]);

    let wf = orch.start_workflow(spec, None).await.unwrap();
    h.wait_until(DEADLINE, "workflow completed", || {
        orch.workflow_state(wf) == Some(WorkflowState::Completed)
    })
    .await;

    let tasks = h.store.list_by_workflow(wf).await.unwrap();
    let steps: Vec<&str> = tasks
        .iter()
        .filter_map(|t| t.workflow_step.as_deref())
        .collect();
    assert!(steps.contains(&"fetch"));
    assert!(steps.contains(&"analyze"));
    assert!(!steps.contains(&"fallback"), "fallback must stay unemitted");
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_conditional_compensating_branch() {
    let h = TestHarness::start(fast_config()).await;
    let orch = orchestrator(&h).await;
    h.market.fail_next(1, ClientError::Fatal("corrupt".into()));

    let spec = WorkflowSpec::conditional(vec![
        StepSpec::new(
            "fetch",
            TaskPayload::FetchEarnings {
                symbol: "ACME".into(),
            },
        )
        .with_max_retries(0),
        StepSpec::new(
            "fallback",
            TaskPayload::FetchFundamentals {
                symbol: "ACME".into(),
            },
        )
        .with_predicate(StepPredicate::StepFailed {
            step: "fetch".into(),
        }),
    ]);

    let wf = orch.start_workflow(spec, None).await.unwrap();
    // The compensating branch ran, so the workflow completes despite the
    // failed step
    h.wait_until(DEADLINE, "workflow completed via fallback", || {
        orch.workflow_state(wf) == Some(WorkflowState::Completed)
    })
    .await;

    let tasks = h.store.list_by_workflow(wf).await.unwrap();
    let fallback = tasks
        .iter()
        .find(|t| t.workflow_step.as_deref() == Some("fallback"))
        .unwrap();
    assert_eq!(fallback.state, TaskState::Completed);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_event_driven_trigger_emits_with_event_correlation() {
    let h = TestHarness::start(fast_config()).await;
    let orch = orchestrator(&h).await;

    let spec = WorkflowSpec::event_driven(
        TriggerFilter::new(vec![EventKind::EarningsIngested]),
        vec![StepSpec::new(
            "analyze",
            TaskPayload::AnalyzeEarnings {
                symbol: "ACME".into(),
            },
        )],
    );
    let wf = orch.start_workflow(spec, None).await.unwrap();

    // A plain earnings fetch publishes EarningsIngested, which should fire
    // the trigger with the fetch task's correlation id
    let fetch = Task::new(TaskPayload::FetchEarnings {
        symbol: "ACME".into(),
    });
    let correlation = fetch.correlation_id;
    h.engine.submit(fetch).await.unwrap();

    let start = tokio::time::Instant::now();
    loop {
        if !h.store.list_by_workflow(wf).await.unwrap().is_empty() {
            break;
        }
        if start.elapsed() > DEADLINE {
            panic!("trigger did not emit the analyze task");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let tasks = h.store.list_by_workflow(wf).await.unwrap();
    assert_eq!(tasks[0].correlation_id, correlation);
    assert_eq!(tasks[0].workflow_step.as_deref(), Some("analyze"));
    h.wait_for_state(tasks[0].id, TaskState::Completed, DEADLINE).await;

    // The trigger rule itself stays running
    assert_eq!(orch.workflow_state(wf), Some(WorkflowState::Running));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_workflow_cancels_tasks() {
    let h = TestHarness::start(fast_config()).await;
    let orch = orchestrator(&h).await;
    h.broker.set_latency(Duration::from_secs(5));

    let spec = WorkflowSpec::sequential(vec![StepSpec::new(
        "sync",
        TaskPayload::SyncBalances {
            account_id: "acct-1".into(),
        },
    )]);
    let wf = orch.start_workflow(spec, None).await.unwrap();

    let tasks = h.store.list_by_workflow(wf).await.unwrap();
    h.wait_for_state(tasks[0].id, TaskState::Running, DEADLINE).await;

    orch.cancel_workflow(wf).await.unwrap();
    h.wait_for_state(tasks[0].id, TaskState::Cancelled, DEADLINE).await;
    assert_eq!(orch.workflow_state(wf), Some(WorkflowState::Cancelled));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_recovery_resumes_sequential_workflow() {
    let h = TestHarness::start(fast_config()).await;

    // Persisted state from a previous run: a two-step sequential workflow
    // whose first step completed before the process died
    let spec = WorkflowSpec::sequential(vec![
        StepSpec::new(
            "fetch",
            TaskPayload::FetchEarnings {
                symbol: "ACME".into(),
            },
        ),
        StepSpec::new(
            "analyze",
            TaskPayload::AnalyzeEarnings {
                symbol: "ACME".into(),
            },
        ),
    ]);
    let correlation = CorrelationId::generate();
    let mut record = WorkflowRecord::new(spec, correlation);
    record.state = WorkflowState::Running;
    h.store.put_workflow(&record).await.unwrap();

    let mut done = Task::new(TaskPayload::FetchEarnings {
        symbol: "ACME".into(),
    })
    .with_correlation_id(correlation)
    .with_parent_workflow(record.id)
    .with_workflow_step("fetch");
    done.state = TaskState::Completed;
    done.result = Some(serde_json::json!({"eps": 12.4}));
    done.completed_at = Some(Utc::now());
    h.store.admit(&done).await.unwrap();

    // A fresh orchestrator rebuilds state and drives the second step
    let orch = orchestrator(&h).await;
    h.wait_until(DEADLINE, "recovered workflow completed", || {
        orch.workflow_state(record.id) == Some(WorkflowState::Completed)
    })
    .await;

    let tasks = h.store.list_by_workflow(record.id).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.state == TaskState::Completed));
    h.engine.shutdown().await;
}
