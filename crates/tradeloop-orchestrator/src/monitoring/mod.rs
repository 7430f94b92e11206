//! Monitoring
//!
//! Samples queue health at a fixed cadence and raises alerts when
//! thresholds are breached. Severity scales with how far past the
//! threshold a reading lands.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tradeloop_contracts::{AlertSeverity, Event, EventKind, QueueName, TaskState};

use crate::bus::EventBus;
use crate::engine::{Engine, QueueStatusSnapshot};

/// Alerting thresholds
#[derive(Debug, Clone)]
pub struct MonitorThresholds {
    /// Failed / (completed + failed) over a sampling window
    pub max_error_rate: f64,

    /// Pending + Ready tasks per queue
    pub max_queue_depth: u64,

    /// Age of the oldest unstarted task
    pub max_oldest_pending: Duration,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            max_error_rate: 0.25,
            max_queue_depth: 500,
            max_oldest_pending: Duration::from_secs(900),
        }
    }
}

#[derive(Default, Clone, Copy)]
struct TerminalCounts {
    completed: u64,
    failed: u64,
}

struct MonitorInner {
    engine: Engine,
    bus: EventBus,
    thresholds: MonitorThresholds,
    sample_interval: Mutex<Duration>,
    last_counts: Mutex<HashMap<QueueName, TerminalCounts>>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

/// Queue health monitor; cheap to clone
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl Monitor {
    pub fn new(engine: Engine, bus: EventBus, thresholds: MonitorThresholds) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(MonitorInner {
                engine,
                bus,
                thresholds,
                sample_interval: Mutex::new(Duration::from_secs(30)),
                last_counts: Mutex::new(HashMap::new()),
                shutdown_tx,
                handle: Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Override the sampling cadence; takes effect at the next `start`
    pub fn set_sample_interval(&self, interval: Duration) {
        *self.inner.sample_interval.lock() = interval;
    }

    /// Spawn the sampling loop; idempotent
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let interval = *inner.sample_interval.lock();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Skip the immediate tick; the first sample should cover a window
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => sample(&inner).await,
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("monitor loop exited");
        });
        *self.inner.handle.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }

    /// Point-in-time snapshots for all queues
    pub async fn snapshot(&self) -> Vec<QueueStatusSnapshot> {
        let mut out = Vec::with_capacity(QueueName::ALL.len());
        for &queue in QueueName::ALL.iter() {
            match self.inner.engine.queue_status(queue).await {
                Ok(status) => out.push(status),
                Err(err) => warn!(%queue, "status sample failed: {err}"),
            }
        }
        out
    }

    /// Run one sampling pass immediately (also used by tests)
    pub async fn sample_once(&self) {
        sample(&self.inner).await;
    }
}

async fn sample(inner: &Arc<MonitorInner>) {
    for &queue in QueueName::ALL.iter() {
        let status = match inner.engine.queue_status(queue).await {
            Ok(status) => status,
            Err(err) => {
                warn!(%queue, "status sample failed: {err}");
                continue;
            }
        };

        let depth = status.counts.get(&TaskState::Pending).copied().unwrap_or(0)
            + status.counts.get(&TaskState::Ready).copied().unwrap_or(0);

        let current = TerminalCounts {
            completed: status
                .counts
                .get(&TaskState::Completed)
                .copied()
                .unwrap_or(0),
            failed: status.counts.get(&TaskState::Failed).copied().unwrap_or(0),
        };
        let previous = {
            let mut last = inner.last_counts.lock();
            last.insert(queue, current).unwrap_or_default()
        };
        let window_completed = current.completed.saturating_sub(previous.completed);
        let window_failed = current.failed.saturating_sub(previous.failed);
        let window_total = window_completed + window_failed;
        let error_rate = if window_total > 0 {
            window_failed as f64 / window_total as f64
        } else {
            0.0
        };

        if depth > inner.thresholds.max_queue_depth {
            let severity = if depth > inner.thresholds.max_queue_depth * 2 {
                AlertSeverity::Error
            } else {
                AlertSeverity::Warning
            };
            raise(inner, queue, severity, "queue_depth", json!({ "depth": depth })).await;
        }

        if window_total > 0 && error_rate > inner.thresholds.max_error_rate {
            let severity = if error_rate > (inner.thresholds.max_error_rate * 2.0).min(1.0) {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Error
            };
            raise(
                inner,
                queue,
                severity,
                "error_rate",
                json!({ "error_rate": error_rate, "failed": window_failed }),
            )
            .await;
        }

        if let Some(age) = status.oldest_pending {
            if age > inner.thresholds.max_oldest_pending {
                raise(
                    inner,
                    queue,
                    AlertSeverity::Warning,
                    "oldest_pending_age",
                    json!({ "age_ms": age.as_millis() as u64 }),
                )
                .await;
            }
        }
    }
}

async fn raise(
    inner: &Arc<MonitorInner>,
    queue: QueueName,
    severity: AlertSeverity,
    metric: &str,
    detail: serde_json::Value,
) {
    warn!(%queue, metric, %severity, "alert threshold breached");
    inner
        .bus
        .publish(Event::new(
            EventKind::AlertRaised,
            "monitor",
            json!({
                "queue": queue.as_str(),
                "severity": severity,
                "metric": metric,
                "detail": detail,
            }),
        ))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::config::OrchestratorConfig;
    use crate::engine::EngineClients;
    use crate::persistence::{InMemoryTaskStore, TaskStore};
    use crate::queues::{register_default_handlers, HandlerRegistry};
    use crate::sim::{SimBroker, SimLlm, SimMarketData};
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use tradeloop_contracts::{Task, TaskPayload};

    fn engine(store: Arc<InMemoryTaskStore>, bus: EventBus) -> Engine {
        let registry = Arc::new(HandlerRegistry::new());
        register_default_handlers(&registry);
        Engine::new(
            store,
            bus,
            registry,
            EngineClients {
                broker: Arc::new(SimBroker::new()),
                llm: Arc::new(SimLlm::new()),
                market_data: Arc::new(SimMarketData::new()),
            },
            OrchestratorConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_depth_alert() {
        let store = Arc::new(InMemoryTaskStore::new());
        let bus = EventBus::new(BusConfig::default());

        // Ten queued tasks against a threshold of five
        for i in 0..10 {
            let mut t = Task::new(TaskPayload::FetchEarnings {
                symbol: format!("SYM{i}"),
            });
            t.state = TaskState::Ready;
            store.admit(&t).await.unwrap();
        }

        let alerts = Arc::new(AtomicUsize::new(0));
        let alerts_clone = Arc::clone(&alerts);
        bus.subscribe(
            "alerts",
            Some(vec![EventKind::AlertRaised]),
            Arc::new(move |_| {
                let alerts = Arc::clone(&alerts_clone);
                async move {
                    alerts.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }),
        );

        let engine = engine(Arc::clone(&store), bus.clone());
        let monitor = Monitor::new(
            engine,
            bus,
            MonitorThresholds {
                max_queue_depth: 5,
                ..MonitorThresholds::default()
            },
        );
        monitor.sample_once().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(alerts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_rate_alert_uses_window_delta() {
        let store = Arc::new(InMemoryTaskStore::new());
        let bus = EventBus::new(BusConfig::default());

        let alerts = Arc::new(AtomicUsize::new(0));
        let alerts_clone = Arc::clone(&alerts);
        bus.subscribe(
            "alerts",
            Some(vec![EventKind::AlertRaised]),
            Arc::new(move |event| {
                let alerts = Arc::clone(&alerts_clone);
                async move {
                    if event.payload["metric"] == "error_rate" {
                        alerts.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }
                .boxed()
            }),
        );

        let engine = engine(Arc::clone(&store), bus.clone());
        let monitor = Monitor::new(engine, bus, MonitorThresholds::default());

        // Baseline sample with nothing terminal
        monitor.sample_once().await;

        for i in 0..4 {
            let mut t = Task::new(TaskPayload::FetchEarnings {
                symbol: format!("SYM{i}"),
            });
            t.state = TaskState::Failed;
            store.admit(&t).await.unwrap();
        }
        monitor.sample_once().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(alerts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_snapshot_covers_all_queues() {
        let store = Arc::new(InMemoryTaskStore::new());
        let bus = EventBus::new(BusConfig::default());
        let engine = engine(store, bus.clone());
        let monitor = Monitor::new(engine, bus, MonitorThresholds::default());

        let snapshots = monitor.snapshot().await;
        assert_eq!(snapshots.len(), 3);
    }
}
