//! Background scheduler
//!
//! Emits periodic tasks onto the queues per a time policy. Ticks are driven
//! by tokio's monotonic interval; entries gated on market hours fire only
//! inside the configured window. If a previous instance of the same entry is
//! still non-terminal the tick is skipped and counted, and on restart missed
//! ticks are coalesced into a single catch-up emission.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tradeloop_contracts::{Priority, Task, TaskPayload};

use crate::engine::Engine;
use crate::persistence::TaskStore;

/// Factory producing the payload for each tick
pub type PayloadFn = Box<dyn Fn() -> TaskPayload + Send + Sync>;

/// One periodic emission rule
pub struct PeriodicEntry {
    pub name: String,
    payload_fn: PayloadFn,
    pub period: Duration,
    pub priority: Priority,
    pub market_hours_only: bool,
}

impl PeriodicEntry {
    pub fn new(
        name: impl Into<String>,
        period: Duration,
        priority: Priority,
        market_hours_only: bool,
        payload_fn: impl Fn() -> TaskPayload + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            payload_fn: Box::new(payload_fn),
            period,
            priority,
            market_hours_only,
        }
    }
}

struct BackgroundInner {
    engine: Engine,
    store: Arc<dyn TaskStore>,
    entries: Mutex<Vec<Arc<PeriodicEntry>>>,
    skipped_overlap: DashMap<String, Arc<AtomicU64>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

/// The background scheduler; cheap to clone
#[derive(Clone)]
pub struct BackgroundScheduler {
    inner: Arc<BackgroundInner>,
}

impl BackgroundScheduler {
    pub fn new(engine: Engine, store: Arc<dyn TaskStore>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(BackgroundInner {
                engine,
                store,
                entries: Mutex::new(Vec::new()),
                skipped_overlap: DashMap::new(),
                shutdown_tx,
                handles: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Register a periodic entry; must happen before `start`
    pub fn register_periodic(&self, entry: PeriodicEntry) {
        self.inner
            .skipped_overlap
            .insert(entry.name.clone(), Arc::new(AtomicU64::new(0)));
        self.inner.entries.lock().push(Arc::new(entry));
    }

    /// Ticks skipped because a prior instance was still in flight
    pub fn skipped_overlap(&self, name: &str) -> u64 {
        self.inner
            .skipped_overlap
            .get(name)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Spawn one ticking loop per registered entry; idempotent
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let entries: Vec<Arc<PeriodicEntry>> = self.inner.entries.lock().clone();
        info!(count = entries.len(), "starting background scheduler");

        let mut handles = self.inner.handles.lock();
        for entry in entries {
            let inner = Arc::clone(&self.inner);
            let shutdown_rx = self.inner.shutdown_tx.subscribe();
            handles.push(tokio::spawn(entry_loop(inner, entry, shutdown_rx)));
        }
    }

    /// Stop all ticking loops
    pub async fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = self.inner.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
        self.inner.started.store(false, Ordering::SeqCst);
    }
}

async fn entry_loop(
    inner: Arc<BackgroundInner>,
    entry: Arc<PeriodicEntry>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // Recovery: the interval's immediate first tick doubles as the single
    // coalesced catch-up emission. If the last fire is fresher than one
    // period, swallow that first tick instead.
    let mut swallow_first = match inner.store.last_scheduled(&entry.name).await {
        Ok(Some(last)) => {
            let since = Utc::now()
                .signed_duration_since(last)
                .to_std()
                .unwrap_or(Duration::MAX);
            since < entry.period
        }
        Ok(None) => false,
        Err(err) => {
            warn!(entry = %entry.name, "last-fire recovery failed: {err}");
            false
        }
    };

    let mut ticker = tokio::time::interval(entry.period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if swallow_first {
                    swallow_first = false;
                    continue;
                }
                tick(&inner, &entry).await;
            }
            _ = shutdown_rx.changed() => {
                debug!(entry = %entry.name, "background loop stopped");
                break;
            }
        }
    }
}

async fn tick(inner: &Arc<BackgroundInner>, entry: &Arc<PeriodicEntry>) {
    let now = Utc::now();

    if entry.market_hours_only {
        let market = inner.engine.config().market.clone();
        if !market.contains(now) {
            debug!(entry = %entry.name, "outside market hours, skipping tick");
            return;
        }
    }

    match inner.store.has_active_scheduled(&entry.name).await {
        Ok(true) => {
            if let Some(counter) = inner.skipped_overlap.get(&entry.name) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            debug!(entry = %entry.name, "previous instance still active, skipping tick");
            return;
        }
        Ok(false) => {}
        Err(err) => {
            warn!(entry = %entry.name, "overlap check failed: {err}");
            return;
        }
    }

    let task = Task::new((entry.payload_fn)())
        .with_priority(entry.priority)
        .with_scheduled_by(entry.name.clone());

    match inner.engine.submit(task).await {
        Ok(id) => debug!(entry = %entry.name, task_id = %id, "periodic task emitted"),
        Err(err) => warn!(entry = %entry.name, "periodic emission rejected: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, EventBus};
    use crate::config::{MarketHoursConfig, OrchestratorConfig};
    use crate::engine::EngineClients;
    use crate::persistence::{InMemoryTaskStore, TaskStore as _};
    use crate::queues::{register_default_handlers, HandlerRegistry};
    use crate::sim::{SimBroker, SimLlm, SimMarketData};

    fn engine(store: Arc<InMemoryTaskStore>) -> Engine {
        let registry = Arc::new(HandlerRegistry::new());
        register_default_handlers(&registry);
        Engine::new(
            store,
            EventBus::new(BusConfig::default()),
            registry,
            EngineClients {
                broker: Arc::new(SimBroker::new()),
                llm: Arc::new(SimLlm::new()),
                market_data: Arc::new(SimMarketData::new()),
            },
            OrchestratorConfig::default(),
        )
    }

    fn news_entry(period: Duration) -> PeriodicEntry {
        PeriodicEntry::new("news_poll", period, Priority::new(4), false, || {
            TaskPayload::FetchNews {
                symbols: vec!["ACME".into()],
                lookback_hours: 4,
            }
        })
    }

    #[tokio::test]
    async fn test_periodic_emission() {
        let store = Arc::new(InMemoryTaskStore::new());
        let engine = engine(Arc::clone(&store));
        // Engine not started: emitted tasks stay Ready, which is enough here

        let scheduler = BackgroundScheduler::new(engine, store.clone());
        scheduler.register_periodic(news_entry(Duration::from_millis(50)));
        scheduler.start().await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.stop().await;

        // The immediate first tick emitted exactly one task
        assert_eq!(store.task_count(), 1);
        let tasks = store.list_non_terminal().await.unwrap();
        assert_eq!(tasks[0].scheduled_by.as_deref(), Some("news_poll"));
    }

    #[tokio::test]
    async fn test_overlap_skip_counted() {
        let store = Arc::new(InMemoryTaskStore::new());
        let engine = engine(Arc::clone(&store));

        let scheduler = BackgroundScheduler::new(engine, store.clone());
        scheduler.register_periodic(news_entry(Duration::from_millis(40)));
        scheduler.start().await;

        // First tick emits; the task never runs (engine not started), so
        // subsequent ticks observe an active instance and skip.
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.stop().await;

        assert_eq!(store.task_count(), 1);
        assert!(scheduler.skipped_overlap("news_poll") >= 2);
    }

    #[tokio::test]
    async fn test_market_hours_gate() {
        let store = Arc::new(InMemoryTaskStore::new());
        let registry = Arc::new(HandlerRegistry::new());
        register_default_handlers(&registry);
        // A zero-width market window never contains any instant
        let config = OrchestratorConfig {
            market: MarketHoursConfig {
                utc_offset_minutes: 0,
                open: chrono::NaiveTime::from_hms_opt(0, 0, 1).unwrap(),
                close: chrono::NaiveTime::from_hms_opt(0, 0, 1).unwrap(),
            },
            ..OrchestratorConfig::default()
        };
        let engine = Engine::new(
            Arc::clone(&store) as Arc<dyn crate::persistence::TaskStore>,
            EventBus::new(BusConfig::default()),
            registry,
            EngineClients {
                broker: Arc::new(SimBroker::new()),
                llm: Arc::new(SimLlm::new()),
                market_data: Arc::new(SimMarketData::new()),
            },
            config,
        );

        let scheduler = BackgroundScheduler::new(engine, store.clone());
        scheduler.register_periodic(PeriodicEntry::new(
            "gated",
            Duration::from_millis(30),
            Priority::default(),
            true,
            || TaskPayload::FetchNews {
                symbols: vec!["ACME".into()],
                lookback_hours: 4,
            },
        ));
        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop().await;

        assert_eq!(store.task_count(), 0);
    }

    #[tokio::test]
    async fn test_restart_swallows_fresh_first_tick() {
        let store = Arc::new(InMemoryTaskStore::new());
        let engine = engine(Arc::clone(&store));

        // Simulate a just-fired instance from a previous run
        let mut prior = Task::new(TaskPayload::FetchNews {
            symbols: vec!["ACME".into()],
            lookback_hours: 4,
        })
        .with_scheduled_by("news_poll");
        prior.state = tradeloop_contracts::TaskState::Completed;
        store.admit(&prior).await.unwrap();

        let scheduler = BackgroundScheduler::new(engine, store.clone());
        scheduler.register_periodic(news_entry(Duration::from_secs(60)));
        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        scheduler.stop().await;

        // The immediate tick was swallowed; only the prior row exists
        assert_eq!(store.task_count(), 1);
    }
}
