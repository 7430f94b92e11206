//! Error taxonomy shared by handlers, the engine, and collaborator clients
//!
//! Handlers return structured `TaskError`s; the engine pattern-matches on
//! `TaskErrorKind` to decide retry vs terminal. Exceptions/panics are
//! reserved for unrecoverable engine-internal conditions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::task::option_duration_millis;

/// Classification of a task failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// Payload or submission defect; never recoverable
    Validation,

    /// Upstream or infrastructure hiccup; consumes a retry
    Transient,

    /// Quota exceeded; re-armed after `retry_after` without consuming a
    /// retry, up to the configured rate-retry cap
    RateLimited,

    /// Handler exceeded its deadline; consumes a retry
    Timeout,

    /// Dependency circuit is open; re-armed at cooldown expiry, no retry
    /// consumed
    CircuitOpen,

    /// Terminal cascade from a failed dependency; never retried
    DependencyFailed,

    /// Data corruption or contract breach; raises a critical alert
    Fatal,

    /// Cooperative cancellation; terminal, not counted as an error
    Cancelled,
}

impl TaskErrorKind {
    /// Whether this kind is recoverable by default (§7 taxonomy)
    pub fn default_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transient | Self::RateLimited | Self::Timeout | Self::CircuitOpen
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::CircuitOpen => "circuit_open",
            Self::DependencyFailed => "dependency_failed",
            Self::Fatal => "fatal",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured task failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,

    /// Upstream-supplied delay hint (RateLimited, CircuitOpen)
    #[serde(with = "option_duration_millis", default)]
    pub retry_after: Option<Duration>,

    /// Whether the engine may retry this failure
    pub recoverable: bool,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            recoverable: kind.default_recoverable(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Validation, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Transient, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::new(TaskErrorKind::RateLimited, message)
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Timeout, message)
    }

    pub fn circuit_open(dependency: impl Into<String>, cooldown: Duration) -> Self {
        Self {
            retry_after: Some(cooldown),
            ..Self::new(
                TaskErrorKind::CircuitOpen,
                format!("circuit open for dependency: {}", dependency.into()),
            )
        }
    }

    pub fn dependency_failed(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::DependencyFailed, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Fatal, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Cancelled, message)
    }

    /// Mark this error unrecoverable regardless of kind
    pub fn non_recoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskError {}

/// Error taxonomy of outbound collaborator clients (broker, LLM, data feeds)
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Quota exhausted; retry after the given delay
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Credentials rejected; not recoverable by retrying
    #[error("unauthorized")]
    Unauthorized,

    /// Upstream hiccup worth retrying
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// Contract breach or corrupt response
    #[error("fatal upstream error: {0}")]
    Fatal(String),
}

impl From<ClientError> for TaskError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::RateLimited { retry_after } => {
                TaskError::rate_limited("upstream rate limit", retry_after)
            }
            ClientError::Unauthorized => {
                TaskError::fatal("upstream rejected credentials")
            }
            ClientError::Transient(msg) => TaskError::transient(msg),
            ClientError::Fatal(msg) => TaskError::fatal(msg),
        }
    }
}
