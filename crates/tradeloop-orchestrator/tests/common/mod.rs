//! Shared harness for integration tests: in-memory store, simulated
//! collaborators, a recording bus subscriber, and a started engine.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;

use tradeloop_contracts::{Event, EventKind, Task, TaskId, TaskState};
use tradeloop_orchestrator::bus::{BusConfig, EventBus};
use tradeloop_orchestrator::config::OrchestratorConfig;
use tradeloop_orchestrator::engine::{Engine, EngineClients};
use tradeloop_orchestrator::persistence::{InMemoryTaskStore, TaskStore};
use tradeloop_orchestrator::queues::{register_default_handlers, HandlerRegistry};
use tradeloop_orchestrator::reliability::BackoffPolicy;
use tradeloop_orchestrator::sim::{SimBroker, SimLlm, SimMarketData};

pub struct TestHarness {
    pub store: Arc<InMemoryTaskStore>,
    pub bus: EventBus,
    pub engine: Engine,
    pub broker: Arc<SimBroker>,
    pub llm: Arc<SimLlm>,
    pub market: Arc<SimMarketData>,
    events: Arc<Mutex<Vec<Event>>>,
}

impl TestHarness {
    pub async fn start(config: OrchestratorConfig) -> Self {
        let store = Arc::new(InMemoryTaskStore::new());
        let bus = EventBus::new(BusConfig::default());

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        bus.subscribe(
            "recorder",
            None,
            Arc::new(move |event| {
                let events = Arc::clone(&events_clone);
                async move {
                    events.lock().push(event);
                    Ok(())
                }
                .boxed()
            }),
        );

        let broker = Arc::new(SimBroker::new());
        let llm = Arc::new(SimLlm::new());
        let market = Arc::new(SimMarketData::new());

        let registry = Arc::new(HandlerRegistry::new());
        register_default_handlers(&registry);

        let engine = Engine::new(
            Arc::clone(&store) as Arc<dyn TaskStore>,
            bus.clone(),
            registry,
            EngineClients {
                broker: Arc::clone(&broker) as Arc<dyn tradeloop_contracts::BrokerClient>,
                llm: Arc::clone(&llm) as Arc<dyn tradeloop_contracts::LlmClient>,
                market_data: Arc::clone(&market) as Arc<dyn tradeloop_contracts::MarketDataClient>,
            },
            config,
        );
        engine.start();

        Self {
            store,
            bus,
            engine,
            broker,
            llm,
            market,
            events,
        }
    }

    /// Recorded events so far, in publication order
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn events_of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Poll until the task reaches the state or the deadline passes
    pub async fn wait_for_state(&self, id: TaskId, state: TaskState, deadline: Duration) -> Task {
        let start = tokio::time::Instant::now();
        loop {
            if let Ok(task) = self.store.get(id).await {
                if task.state == state {
                    return task;
                }
                if start.elapsed() > deadline {
                    panic!(
                        "task {id} did not reach {state} within {deadline:?} (stuck at {})",
                        task.state
                    );
                }
            } else if start.elapsed() > deadline {
                panic!("task {id} not found within {deadline:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the predicate holds or the deadline passes
    pub async fn wait_until<F>(&self, deadline: Duration, what: &str, mut predicate: F)
    where
        F: FnMut() -> bool,
    {
        let start = tokio::time::Instant::now();
        while !predicate() {
            if start.elapsed() > deadline {
                panic!("condition not reached within {deadline:?}: {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Config with millisecond-scale backoff for fast tests
pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    for queue in tradeloop_contracts::QueueName::ALL {
        config.queue_mut(queue).backoff =
            BackoffPolicy::new(Duration::from_millis(30), Duration::from_millis(300));
        config.queue_mut(queue).default_timeout = Duration::from_secs(10);
    }
    config.cancel_grace = Duration::from_millis(500);
    config
}
