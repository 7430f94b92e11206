//! In-process event bus
//!
//! Typed publish/subscribe decoupling producers from consumers. Each
//! subscriber owns a bounded FIFO queue and a dedicated dispatch task, so
//! delivery order per subscriber equals publication order while subscribers
//! never block each other.
//!
//! Overflow drops the oldest unprocessed event for that subscriber and
//! publishes `DeliveryDropped` for observability. Three consecutive handler
//! failures open a per-subscriber circuit that silently drops events for a
//! cooldown before half-opening with a single probe delivery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tradeloop_contracts::{Event, EventKind};

use crate::persistence::TaskStore;

/// Handler invoked for each delivered event
pub type EventHandler =
    Arc<dyn Fn(Event) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Bounded queue depth per subscriber
    pub queue_capacity: usize,

    /// Consecutive handler failures that open the subscriber circuit
    pub failure_threshold: u32,

    /// How long an open subscriber circuit drops events
    pub circuit_cooldown: Duration,

    /// Shutdown drain deadline before in-flight events are discarded
    pub drain_deadline: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            failure_threshold: 3,
            circuit_cooldown: Duration::from_secs(30),
            drain_deadline: Duration::from_secs(5),
        }
    }
}

impl BusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_circuit_cooldown(mut self, cooldown: Duration) -> Self {
        self.circuit_cooldown = cooldown;
        self
    }

    pub fn with_drain_deadline(mut self, deadline: Duration) -> Self {
        self.drain_deadline = deadline;
        self
    }
}

/// Handle returned by `subscribe`; pass back to `unsubscribe`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    name: String,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Delivery counters for one subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

struct SubscriberState {
    name: String,
    /// None subscribes to every kind
    kinds: Option<HashSet<EventKind>>,
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    cancel: CancellationToken,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriberState {
    fn matches(&self, kind: EventKind) -> bool {
        match &self.kinds {
            Some(kinds) => kinds.contains(&kind),
            None => true,
        }
    }
}

#[derive(Clone, Copy)]
enum SubscriberCircuit {
    Closed { consecutive: u32 },
    Open { until: Instant },
    HalfOpen,
}

struct BusInner {
    config: BusConfig,
    subscribers: RwLock<HashMap<String, Arc<SubscriberState>>>,
    journal: RwLock<Option<Arc<dyn TaskStore>>>,
}

/// The event bus; cheap to clone, all clones share state
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                subscribers: RwLock::new(HashMap::new()),
                journal: RwLock::new(None),
            }),
        }
    }

    /// Append every published event to the store's events table
    pub fn with_journal(self, store: Arc<dyn TaskStore>) -> Self {
        *self.inner.journal.write() = Some(store);
        self
    }

    /// Register a subscriber; idempotent per name (re-subscribing replaces
    /// the previous registration for that name).
    ///
    /// `kinds = None` receives every event.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        kinds: Option<Vec<EventKind>>,
        handler: EventHandler,
    ) -> Subscription {
        let name = name.into();
        let state = Arc::new(SubscriberState {
            name: name.clone(),
            kinds: kinds.map(|ks| ks.into_iter().collect()),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            handle: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::dispatch_loop(
            Arc::clone(&state),
            handler,
            self.inner.config.clone(),
        ));
        *state.handle.lock() = Some(handle);

        let previous = self
            .inner
            .subscribers
            .write()
            .insert(name.clone(), Arc::clone(&state));
        if let Some(old) = previous {
            debug!(subscriber = %name, "replacing existing subscription");
            old.cancel.cancel();
            old.notify.notify_one();
        }

        Subscription { name }
    }

    /// Remove a subscription; its queue drains before the dispatch task exits
    pub fn unsubscribe(&self, subscription: &Subscription) {
        if let Some(state) = self.inner.subscribers.write().remove(&subscription.name) {
            state.cancel.cancel();
            state.notify.notify_one();
        }
    }

    /// Publish an event
    ///
    /// Returns once the event has been journaled (when a journal is set) and
    /// enqueued for every matching subscriber. Delivery itself is
    /// asynchronous per subscriber.
    pub async fn publish(&self, event: Event) {
        let journal = self.inner.journal.read().clone();
        if let Some(store) = journal {
            if let Err(err) = store.append_event(&event).await {
                warn!(kind = %event.kind, "failed to journal event: {err}");
            }
        }

        let mut dropped_from: Vec<String> = vec![];
        {
            let subscribers = self.inner.subscribers.read();
            for state in subscribers.values() {
                if !state.matches(event.kind) {
                    continue;
                }
                let mut queue = state.queue.lock();
                if queue.len() >= self.inner.config.queue_capacity {
                    queue.pop_front();
                    state.dropped.fetch_add(1, Ordering::Relaxed);
                    // A DeliveryDropped that itself overflows is not re-reported
                    if event.kind != EventKind::DeliveryDropped {
                        dropped_from.push(state.name.clone());
                    }
                }
                queue.push_back(event.clone());
                drop(queue);
                state.notify.notify_one();
            }
        }

        for name in dropped_from {
            let drop_event = Event::new(
                EventKind::DeliveryDropped,
                "bus",
                serde_json::json!({ "subscriber": name }),
            );
            Box::pin(self.publish(drop_event)).await;
        }
    }

    /// Delivery counters for a subscriber, if registered
    pub fn subscriber_stats(&self, name: &str) -> Option<SubscriberStats> {
        self.inner
            .subscribers
            .read()
            .get(name)
            .map(|s| SubscriberStats {
                delivered: s.delivered.load(Ordering::Relaxed),
                failed: s.failed.load(Ordering::Relaxed),
                dropped: s.dropped.load(Ordering::Relaxed),
            })
    }

    /// Cancel all subscribers and drain in-flight events, bounded by the
    /// configured drain deadline; anything left after that is discarded.
    pub async fn shutdown(&self) {
        let states: Vec<Arc<SubscriberState>> =
            self.inner.subscribers.write().drain().map(|(_, s)| s).collect();

        for state in &states {
            state.cancel.cancel();
            state.notify.notify_one();
        }

        let deadline = tokio::time::Instant::now() + self.inner.config.drain_deadline;
        for state in states {
            let handle = state.handle.lock().take();
            if let Some(handle) = handle {
                if tokio::time::timeout_at(deadline, handle).await.is_err() {
                    warn!(subscriber = %state.name, "drain deadline reached, discarding events");
                }
            }
        }
    }

    async fn dispatch_loop(
        state: Arc<SubscriberState>,
        handler: EventHandler,
        config: BusConfig,
    ) {
        let mut circuit = SubscriberCircuit::Closed { consecutive: 0 };

        loop {
            let event = state.queue.lock().pop_front();

            match event {
                Some(event) => {
                    if let SubscriberCircuit::Open { until } = circuit {
                        if Instant::now() < until {
                            // Circuit open: drop silently
                            state.dropped.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        circuit = SubscriberCircuit::HalfOpen;
                    }

                    let correlation = event.correlation_id;
                    let outcome = std::panic::AssertUnwindSafe(handler(event))
                        .catch_unwind()
                        .await;

                    let failed = !matches!(outcome, Ok(Ok(())));
                    if failed {
                        state.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            subscriber = %state.name,
                            correlation_id = ?correlation,
                            "event handler failed"
                        );
                        circuit = match circuit {
                            SubscriberCircuit::Closed { consecutive } => {
                                let consecutive = consecutive + 1;
                                if consecutive >= config.failure_threshold {
                                    SubscriberCircuit::Open {
                                        until: Instant::now() + config.circuit_cooldown,
                                    }
                                } else {
                                    SubscriberCircuit::Closed { consecutive }
                                }
                            }
                            // Failed probe reopens
                            _ => SubscriberCircuit::Open {
                                until: Instant::now() + config.circuit_cooldown,
                            },
                        };
                    } else {
                        state.delivered.fetch_add(1, Ordering::Relaxed);
                        circuit = SubscriberCircuit::Closed { consecutive: 0 };
                    }
                }
                None => {
                    if state.cancel.is_cancelled() {
                        break;
                    }
                    tokio::select! {
                        _ = state.notify.notified() => {}
                        _ = state.cancel.cancelled() => {}
                    }
                }
            }
        }

        debug!(subscriber = %state.name, "dispatch loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn bus() -> EventBus {
        EventBus::new(BusConfig::default())
    }

    fn event(kind: EventKind) -> Event {
        Event::new(kind, "test", serde_json::json!({}))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_delivery_in_publication_order() {
        let bus = bus();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        bus.subscribe(
            "order",
            Some(vec![EventKind::TaskCreated]),
            Arc::new(move |event| {
                let seen = Arc::clone(&seen_clone);
                async move {
                    seen.lock().push(event.id);
                    Ok(())
                }
                .boxed()
            }),
        );

        let mut published = vec![];
        for _ in 0..10 {
            let e = event(EventKind::TaskCreated);
            published.push(e.id);
            bus.publish(e).await;
        }

        settle().await;
        assert_eq!(*seen.lock(), published);
    }

    #[tokio::test]
    async fn test_kind_filtering() {
        let bus = bus();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        bus.subscribe(
            "filter",
            Some(vec![EventKind::TaskCompleted]),
            Arc::new(move |_| {
                let count = Arc::clone(&count_clone);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }),
        );

        bus.publish(event(EventKind::TaskCreated)).await;
        bus.publish(event(EventKind::TaskCompleted)).await;
        bus.publish(event(EventKind::TaskFailed)).await;

        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_same_name_replaces() {
        let bus = bus();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&first);
        bus.subscribe(
            "dup",
            None,
            Arc::new(move |_| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }),
        );
        let c = Arc::clone(&second);
        bus.subscribe(
            "dup",
            None,
            Arc::new(move |_| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }),
        );

        bus.publish(event(EventKind::TaskCreated)).await;
        settle().await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_and_reports() {
        let bus = EventBus::new(BusConfig::default().with_queue_capacity(2));
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let gate_clone = Arc::clone(&gate);
        let seen_clone = Arc::clone(&seen);
        bus.subscribe(
            "slow",
            Some(vec![EventKind::TaskCreated]),
            Arc::new(move |event| {
                let gate = Arc::clone(&gate_clone);
                let seen = Arc::clone(&seen_clone);
                async move {
                    let permit = gate.acquire().await.map_err(|e| e.to_string())?;
                    permit.forget();
                    seen.lock().push(event.id);
                    Ok(())
                }
                .boxed()
            }),
        );

        let drops = Arc::new(AtomicUsize::new(0));
        let drops_clone = Arc::clone(&drops);
        bus.subscribe(
            "observer",
            Some(vec![EventKind::DeliveryDropped]),
            Arc::new(move |_| {
                let drops = Arc::clone(&drops_clone);
                async move {
                    drops.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }),
        );

        // First event is picked up by the dispatch loop and parks on the
        // gate; the next two fill the queue; the fourth forces a drop.
        for _ in 0..4 {
            bus.publish(event(EventKind::TaskCreated)).await;
        }
        settle().await;
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_stats("slow").unwrap().dropped, 1);

        // Release the handler and let everything drain
        gate.add_permits(4);
        settle().await;
        assert_eq!(seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_subscriber_circuit_opens_after_failures() {
        let bus = EventBus::new(
            BusConfig::default()
                .with_failure_threshold(3)
                .with_circuit_cooldown(Duration::from_millis(100)),
        );
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = Arc::clone(&attempts);

        bus.subscribe(
            "flaky",
            None,
            Arc::new(move |_| {
                let attempts = Arc::clone(&attempts_clone);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err("boom".to_string())
                }
                .boxed()
            }),
        );

        // Three failures open the circuit; the next two are dropped silently
        for _ in 0..5 {
            bus.publish(event(EventKind::TaskCreated)).await;
        }
        settle().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let stats = bus.subscriber_stats("flaky").unwrap();
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.dropped, 2);

        // After cooldown one probe is delivered
        tokio::time::sleep(Duration::from_millis(150)).await;
        bus.publish(event(EventKind::TaskCreated)).await;
        settle().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = bus();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let sub = bus.subscribe(
            "gone",
            None,
            Arc::new(move |_| {
                let count = Arc::clone(&count_clone);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }),
        );

        bus.publish(event(EventKind::TaskCreated)).await;
        settle().await;
        bus.unsubscribe(&sub);
        bus.publish(event(EventKind::TaskCreated)).await;
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains() {
        let bus = bus();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        bus.subscribe(
            "drain",
            None,
            Arc::new(move |_| {
                let count = Arc::clone(&count_clone);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }),
        );

        for _ in 0..5 {
            bus.publish(event(EventKind::TaskCreated)).await;
        }
        bus.shutdown().await;
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }
}
