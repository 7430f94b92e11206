//! Workflow descriptors for the orchestration layer
//!
//! A workflow composes tasks under one correlation id. The descriptor types
//! here are pure data; the orchestrator owns the runtime state.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::EventKind;
use crate::task::{option_duration_millis, Priority, TaskPayload};

/// Unique workflow identifier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a workflow's steps are composed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowMode {
    /// Steps run one at a time, each gated on the previous completing
    Sequential,

    /// All steps emitted at once with no cross-dependencies
    Parallel,

    /// Steps gated on predicates over previously completed step results
    Conditional,

    /// Steps emitted in response to matching bus events
    EventDriven,
}

/// Workflow lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown workflow state: {other}")),
        }
    }
}

/// Predicate over previously completed step results (Conditional mode)
///
/// `ResultEquals`/`ResultTruthy` use a JSON pointer (RFC 6901) into the named
/// step's result value. A predicate referencing a step that has not completed
/// successfully evaluates to false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StepPredicate {
    /// Unconditionally emitted
    Always,

    /// The named step reached Completed
    StepSucceeded { step: String },

    /// The named step reached a non-Completed terminal state
    StepFailed { step: String },

    /// JSON pointer into the named step's result equals the given value
    ResultEquals {
        step: String,
        pointer: String,
        value: serde_json::Value,
    },

    /// JSON pointer into the named step's result is present and truthy
    /// (not null, false, 0, "", or an empty array/object)
    ResultTruthy { step: String, pointer: String },

    All { all: Vec<StepPredicate> },

    Any { any: Vec<StepPredicate> },

    Not { not: Box<StepPredicate> },
}

/// Outcome of a prior step, as seen by predicates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepOutcome {
    Succeeded(serde_json::Value),
    Failed,
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

impl StepPredicate {
    /// Evaluate against the outcomes of steps that have reached a terminal
    /// state so far.
    pub fn evaluate(&self, outcomes: &HashMap<String, StepOutcome>) -> bool {
        match self {
            Self::Always => true,
            Self::StepSucceeded { step } => {
                matches!(outcomes.get(step), Some(StepOutcome::Succeeded(_)))
            }
            Self::StepFailed { step } => {
                matches!(outcomes.get(step), Some(StepOutcome::Failed))
            }
            Self::ResultEquals {
                step,
                pointer,
                value,
            } => match outcomes.get(step) {
                Some(StepOutcome::Succeeded(result)) => {
                    result.pointer(pointer).map(|v| v == value).unwrap_or(false)
                }
                _ => false,
            },
            Self::ResultTruthy { step, pointer } => match outcomes.get(step) {
                Some(StepOutcome::Succeeded(result)) => {
                    result.pointer(pointer).map(is_truthy).unwrap_or(false)
                }
                _ => false,
            },
            Self::All { all } => all.iter().all(|p| p.evaluate(outcomes)),
            Self::Any { any } => any.iter().any(|p| p.evaluate(outcomes)),
            Self::Not { not } => !not.evaluate(outcomes),
        }
    }
}

/// One step of a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique within the workflow
    pub name: String,

    pub payload: TaskPayload,

    #[serde(default)]
    pub priority: Priority,

    /// Override of the queue's default timeout
    #[serde(with = "option_duration_millis", default)]
    pub timeout: Option<Duration>,

    /// Override of the queue's default max retries
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Gate for Conditional mode; ignored by the other modes
    #[serde(default)]
    pub predicate: Option<StepPredicate>,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, payload: TaskPayload) -> Self {
        Self {
            name: name.into(),
            payload,
            priority: Priority::default(),
            timeout: None,
            max_retries: None,
            predicate: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_predicate(mut self, predicate: StepPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Filter selecting bus events that trigger an event-driven workflow body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerFilter {
    /// Event kinds that fire the trigger
    pub kinds: Vec<EventKind>,

    /// When set, only events from this source fire the trigger
    #[serde(default)]
    pub source: Option<String>,
}

impl TriggerFilter {
    pub fn new(kinds: Vec<EventKind>) -> Self {
        Self {
            kinds,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Complete workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub mode: WorkflowMode,

    pub steps: Vec<StepSpec>,

    /// Parallel mode: cancel siblings on first step failure
    #[serde(default)]
    pub fail_fast: bool,

    /// EventDriven mode: the trigger; required there, ignored elsewhere
    #[serde(default)]
    pub trigger: Option<TriggerFilter>,
}

impl WorkflowSpec {
    pub fn sequential(steps: Vec<StepSpec>) -> Self {
        Self {
            mode: WorkflowMode::Sequential,
            steps,
            fail_fast: false,
            trigger: None,
        }
    }

    pub fn parallel(steps: Vec<StepSpec>, fail_fast: bool) -> Self {
        Self {
            mode: WorkflowMode::Parallel,
            steps,
            fail_fast,
            trigger: None,
        }
    }

    pub fn conditional(steps: Vec<StepSpec>) -> Self {
        Self {
            mode: WorkflowMode::Conditional,
            steps,
            fail_fast: false,
            trigger: None,
        }
    }

    pub fn event_driven(trigger: TriggerFilter, steps: Vec<StepSpec>) -> Self {
        Self {
            mode: WorkflowMode::EventDriven,
            steps,
            fail_fast: false,
            trigger: Some(trigger),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcomes() -> HashMap<String, StepOutcome> {
        let mut m = HashMap::new();
        m.insert(
            "fetch".to_string(),
            StepOutcome::Succeeded(json!({"items": [1, 2], "status": "ok"})),
        );
        m.insert("risky".to_string(), StepOutcome::Failed);
        m
    }

    #[test]
    fn test_always() {
        assert!(StepPredicate::Always.evaluate(&outcomes()));
    }

    #[test]
    fn test_step_succeeded_and_failed() {
        let o = outcomes();
        assert!(StepPredicate::StepSucceeded {
            step: "fetch".into()
        }
        .evaluate(&o));
        assert!(StepPredicate::StepFailed {
            step: "risky".into()
        }
        .evaluate(&o));
        assert!(!StepPredicate::StepSucceeded {
            step: "missing".into()
        }
        .evaluate(&o));
    }

    #[test]
    fn test_result_equals_pointer() {
        let o = outcomes();
        assert!(StepPredicate::ResultEquals {
            step: "fetch".into(),
            pointer: "/status".into(),
            value: json!("ok"),
        }
        .evaluate(&o));
        assert!(!StepPredicate::ResultEquals {
            step: "fetch".into(),
            pointer: "/status".into(),
            value: json!("bad"),
        }
        .evaluate(&o));
        // pointer into a failed step is false, not an error
        assert!(!StepPredicate::ResultEquals {
            step: "risky".into(),
            pointer: "/status".into(),
            value: json!("ok"),
        }
        .evaluate(&o));
    }

    #[test]
    fn test_result_truthy() {
        let o = outcomes();
        assert!(StepPredicate::ResultTruthy {
            step: "fetch".into(),
            pointer: "/items".into(),
        }
        .evaluate(&o));
        assert!(!StepPredicate::ResultTruthy {
            step: "fetch".into(),
            pointer: "/missing".into(),
        }
        .evaluate(&o));
    }

    #[test]
    fn test_combinators() {
        let o = outcomes();
        let p = StepPredicate::All {
            all: vec![
                StepPredicate::StepSucceeded {
                    step: "fetch".into(),
                },
                StepPredicate::Not {
                    not: Box::new(StepPredicate::StepSucceeded {
                        step: "risky".into(),
                    }),
                },
            ],
        };
        assert!(p.evaluate(&o));

        let p = StepPredicate::Any {
            any: vec![
                StepPredicate::StepSucceeded {
                    step: "missing".into(),
                },
                StepPredicate::StepFailed {
                    step: "risky".into(),
                },
            ],
        };
        assert!(p.evaluate(&o));
    }

    #[test]
    fn test_spec_serde_roundtrip() {
        let spec = WorkflowSpec::conditional(vec![StepSpec::new(
            "analyze",
            TaskPayload::AnalyzeEarnings {
                symbol: "ACME".into(),
            },
        )
        .with_predicate(StepPredicate::StepSucceeded {
            step: "fetch".into(),
        })]);

        let json = serde_json::to_string(&spec).unwrap();
        let parsed: WorkflowSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, spec);
    }
}
