//! Per-dependency circuit breaker
//!
//! Protects external dependencies from hammering while they are down. The
//! breaker opens on N consecutive failures or M failures inside a sliding
//! window, cools down, then admits exactly one half-open probe.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐  N consecutive / M in window  ┌─────────┐   cooldown   ┌──────────┐
//! │ Closed  │ ────────────────────────────► │  Open   │ ───────────► │ HalfOpen │
//! └─────────┘                               └─────────┘              └──────────┘
//!      ▲                                         ▲                        │
//!      │             probe success               │     probe failure      │
//!      └─────────────────────────────────────────┴────────────────────────┘
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use tradeloop_contracts::duration_millis;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, all calls allowed
    Closed,

    /// Failure threshold exceeded, calls rejected until cooldown elapses
    Open,

    /// Testing recovery; exactly one probe in flight
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Total failures inside the sliding window that also open it
    pub window_threshold: u32,

    /// Sliding window size for failure counting
    #[serde(with = "duration_millis")]
    pub window: Duration,

    /// Time to wait before admitting a half-open probe
    #[serde(with = "duration_millis")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_threshold: 10,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_window_threshold(mut self, threshold: u32) -> Self {
        self.window_threshold = threshold.max(1);
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// Outcome of asking the breaker for permission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitDecision {
    /// Circuit closed; call freely
    Allow,

    /// Circuit half-open and this caller holds the single probe slot
    Probe,

    /// Circuit open; try again after `retry_in`
    Rejected { retry_in: Duration },
}

/// State change produced by recording an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Opened,
    Closed,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    window_failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// In-process circuit breaker for one dependency
///
/// All transitions happen inside a short critical section; callers report
/// outcomes and receive the transition (if any) so they can emit
/// `CircuitOpened`/`CircuitClosed` events.
pub struct CircuitBreaker {
    dependency: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            dependency: dependency.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                window_failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Remaining cooldown, when the circuit is open
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return None;
        }
        inner
            .opened_at
            .map(|at| self.config.cooldown.saturating_sub(at.elapsed()))
    }

    /// Ask for permission to call the dependency
    pub fn acquire(&self) -> CircuitDecision {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => CircuitDecision::Allow,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    CircuitDecision::Probe
                } else {
                    CircuitDecision::Rejected {
                        retry_in: self.config.cooldown - elapsed,
                    }
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    // One probe outstanding; everyone else waits a full cooldown
                    CircuitDecision::Rejected {
                        retry_in: self.config.cooldown,
                    }
                } else {
                    inner.probe_in_flight = true;
                    CircuitDecision::Probe
                }
            }
        }
    }

    /// Record a successful call; returns `Closed` when the probe closes the
    /// circuit.
    pub fn record_success(&self) -> Option<CircuitTransition> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.window_failures.clear();
                inner.opened_at = None;
                inner.probe_in_flight = false;
                Some(CircuitTransition::Closed)
            }
            // A success racing an open circuit is stale; ignore it
            CircuitState::Open => None,
        }
    }

    /// Record a failed call; returns `Opened` when the circuit trips.
    pub fn record_failure(&self) -> Option<CircuitTransition> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                inner.window_failures.push_back(now);
                let window = self.config.window;
                while let Some(front) = inner.window_failures.front() {
                    if now.duration_since(*front) > window {
                        inner.window_failures.pop_front();
                    } else {
                        break;
                    }
                }

                if inner.consecutive_failures >= self.config.failure_threshold
                    || inner.window_failures.len() as u32 >= self.config.window_threshold
                {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.probe_in_flight = false;
                    Some(CircuitTransition::Opened)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.probe_in_flight = false;
                Some(CircuitTransition::Opened)
            }
            CircuitState::Open => None,
        }
    }

    /// Return an unused probe slot
    ///
    /// Called when a `Probe` holder aborts without reaching the dependency
    /// (rate-deferred, cancelled, lost a CAS race), so the next caller can
    /// probe instead of waiting out another cooldown.
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Reset to closed (admin/test operation)
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.window_failures.clear();
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }
}
