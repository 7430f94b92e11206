//! Admission validation
//!
//! A submission is rejected when its payload is malformed, its queue has no
//! registered handler for the task type, a declared dependency does not
//! exist, or the dependency graph of the submission batch contains a cycle.

use std::collections::{HashMap, HashSet};

use tradeloop_contracts::{QueueName, Task, TaskId, TaskPayload};

/// Rejection reasons surfaced by `Engine::submit`
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmissionError {
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),

    #[error("unknown dependency {dep} declared by task {task}")]
    UnknownDependency { task: TaskId, dep: TaskId },

    #[error("no handler registered for {queue}/{task_type}")]
    UnregisteredTaskType {
        queue: QueueName,
        task_type: String,
    },

    #[error("dependency cycle detected involving task {0}")]
    CycleDetected(TaskId),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl AdmissionError {
    /// Stable rejection code for the control API
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyExists(_) => "already_exists",
            Self::UnknownDependency { .. } => "unknown_dependency",
            Self::UnregisteredTaskType { .. } => "unregistered_task_type",
            Self::CycleDetected(_) => "cycle_detected",
            Self::InvalidPayload(_) => "invalid_payload",
        }
    }
}

/// Semantic payload checks beyond what the type system enforces
pub fn validate_payload(payload: &TaskPayload) -> Result<(), AdmissionError> {
    let complaint = match payload {
        TaskPayload::SyncBalances { account_id }
        | TaskPayload::UpdatePositions { account_id }
        | TaskPayload::ComputePnl { account_id, .. }
        | TaskPayload::ValidateRiskLimits { account_id }
            if account_id.is_empty() =>
        {
            Some("account_id must not be empty")
        }
        TaskPayload::FetchNews { symbols, .. } if symbols.is_empty() => {
            Some("symbols must not be empty")
        }
        TaskPayload::MorningPrep { symbols } | TaskPayload::EveningReview { symbols }
            if symbols.is_empty() =>
        {
            Some("symbols must not be empty")
        }
        TaskPayload::FetchEarnings { symbol }
        | TaskPayload::FetchFundamentals { symbol }
        | TaskPayload::FetchOptionChain { symbol, .. }
        | TaskPayload::GenerateRecommendation { symbol }
        | TaskPayload::AnalyzeEarnings { symbol }
            if symbol.is_empty() =>
        {
            Some("symbol must not be empty")
        }
        TaskPayload::EvaluateStrategy { strategy_id } if strategy_id.is_empty() => {
            Some("strategy_id must not be empty")
        }
        _ => None,
    };

    match complaint {
        Some(msg) => Err(AdmissionError::InvalidPayload(format!(
            "{}: {msg}",
            payload.task_type()
        ))),
        None => Ok(()),
    }
}

/// DFS cycle detection over a submission batch
///
/// Tasks already in the store cannot point at batch members (their
/// dependencies existed at their own admission), so a cycle can only close
/// inside the batch itself. Edges leaving the batch are ignored.
pub fn detect_cycle(batch: &[Task]) -> Option<TaskId> {
    let edges: HashMap<TaskId, &Vec<TaskId>> =
        batch.iter().map(|t| (t.id, &t.dependencies)).collect();

    let mut done: HashSet<TaskId> = HashSet::new();
    let mut in_path: HashSet<TaskId> = HashSet::new();

    fn visit(
        node: TaskId,
        edges: &HashMap<TaskId, &Vec<TaskId>>,
        done: &mut HashSet<TaskId>,
        in_path: &mut HashSet<TaskId>,
    ) -> Option<TaskId> {
        if done.contains(&node) {
            return None;
        }
        if !in_path.insert(node) {
            return Some(node);
        }
        if let Some(deps) = edges.get(&node) {
            for dep in deps.iter() {
                if edges.contains_key(dep) {
                    if in_path.contains(dep) {
                        return Some(*dep);
                    }
                    if let Some(cycle) = visit(*dep, edges, done, in_path) {
                        return Some(cycle);
                    }
                }
            }
        }
        in_path.remove(&node);
        done.insert(node);
        None
    }

    for task in batch {
        if let Some(cycle) = visit(task.id, &edges, &mut done, &mut in_path) {
            return Some(cycle);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(symbol: &str) -> Task {
        Task::new(TaskPayload::FetchEarnings {
            symbol: symbol.into(),
        })
    }

    #[test]
    fn test_validate_payload() {
        assert!(validate_payload(&TaskPayload::FetchEarnings {
            symbol: "ACME".into()
        })
        .is_ok());

        let err = validate_payload(&TaskPayload::FetchEarnings { symbol: "".into() })
            .unwrap_err();
        assert_eq!(err.code(), "invalid_payload");

        assert!(validate_payload(&TaskPayload::FetchNews {
            symbols: vec![],
            lookback_hours: 24
        })
        .is_err());
        assert!(validate_payload(&TaskPayload::SyncBalances {
            account_id: "".into()
        })
        .is_err());
    }

    #[test]
    fn test_no_cycle_in_chain() {
        let a = task("A");
        let b = task("B").with_dependencies(vec![a.id]);
        let c = task("C").with_dependencies(vec![b.id]);
        assert!(detect_cycle(&[a, b, c]).is_none());
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut a = task("A");
        a.dependencies = vec![a.id];
        assert!(detect_cycle(&[a]).is_some());
    }

    #[test]
    fn test_two_node_cycle() {
        let mut a = task("A");
        let mut b = task("B");
        a.dependencies = vec![b.id];
        b.dependencies = vec![a.id];
        assert!(detect_cycle(&[a, b]).is_some());
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let root = task("R");
        let left = task("L").with_dependencies(vec![root.id]);
        let right = task("X").with_dependencies(vec![root.id]);
        let join = task("J").with_dependencies(vec![left.id, right.id]);
        assert!(detect_cycle(&[root, left, right, join]).is_none());
    }

    #[test]
    fn test_edges_out_of_batch_ignored() {
        let external = TaskId::generate();
        let a = task("A").with_dependencies(vec![external]);
        assert!(detect_cycle(&[a]).is_none());
    }
}
