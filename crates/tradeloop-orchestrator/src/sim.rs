//! Simulated collaborator clients
//!
//! Deterministic in-process fakes for the broker, LLM, and market-data
//! contracts. Each client carries a scriptable failure queue (errors are
//! returned in order before calls start succeeding) and records the
//! idempotency keys it sees, which lets tests assert retry and idempotency
//! behavior without any network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use tradeloop_contracts::{
    AnalysisOutcome, AnalysisRequest, Balance, BrokerClient, ClientError, EarningsReport,
    Fundamentals, Holding, IdempotencyKey, LlmClient, MarketDataClient, NewsItem, OptionChain,
    OptionQuote, OrderAck, OrderRequest, Position, TokenUsage,
};

/// Shared scripting state for a simulated client
struct SimBehavior {
    /// Errors handed out before calls succeed, in order
    script: Mutex<VecDeque<ClientError>>,
    /// Artificial latency per call
    latency: Mutex<Duration>,
    calls: AtomicU64,
}

impl SimBehavior {
    fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            latency: Mutex::new(Duration::ZERO),
            calls: AtomicU64::new(0),
        }
    }

    fn push_failures(&self, count: u32, error: ClientError) {
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back(error.clone());
        }
    }

    async fn call(&self) -> Result<(), ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match self.script.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Broker
// =============================================================================

/// Simulated broker with a small static book
pub struct SimBroker {
    behavior: SimBehavior,
    positions: Mutex<Vec<Position>>,
    balances: Mutex<Vec<Balance>>,
    order_keys: Mutex<Vec<IdempotencyKey>>,
}

impl SimBroker {
    pub fn new() -> Self {
        Self {
            behavior: SimBehavior::new(),
            positions: Mutex::new(vec![
                Position {
                    symbol: "ACME".into(),
                    quantity: 100.0,
                    avg_price: 95.0,
                    last_price: 102.0,
                },
                Position {
                    symbol: "GLOBEX".into(),
                    quantity: 50.0,
                    avg_price: 210.0,
                    last_price: 198.5,
                },
            ]),
            balances: Mutex::new(vec![Balance {
                currency: "INR".into(),
                cash: 250_000.0,
                margin_available: 500_000.0,
            }]),
            order_keys: Mutex::new(vec![]),
        }
    }

    /// Fail the next `count` calls with `error`, then succeed
    pub fn fail_next(&self, count: u32, error: ClientError) {
        self.behavior.push_failures(count, error);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.behavior.latency.lock() = latency;
    }

    pub fn set_positions(&self, positions: Vec<Position>) {
        *self.positions.lock() = positions;
    }

    pub fn set_balances(&self, balances: Vec<Balance>) {
        *self.balances.lock() = balances;
    }

    pub fn call_count(&self) -> u64 {
        self.behavior.call_count()
    }

    /// Idempotency keys seen by `place_order`
    pub fn recorded_order_keys(&self) -> Vec<IdempotencyKey> {
        self.order_keys.lock().clone()
    }
}

impl Default for SimBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerClient for SimBroker {
    async fn place_order(
        &self,
        key: IdempotencyKey,
        _order: OrderRequest,
    ) -> Result<OrderAck, ClientError> {
        self.behavior.call().await?;
        self.order_keys.lock().push(key.clone());

        // A replayed key acks the same order id without re-applying
        Ok(OrderAck {
            order_id: format!("sim-{key}"),
            accepted_at: Utc::now(),
        })
    }

    async fn get_holdings(&self, _account_id: &str) -> Result<Vec<Holding>, ClientError> {
        self.behavior.call().await?;
        Ok(self
            .positions
            .lock()
            .iter()
            .map(|p| Holding {
                symbol: p.symbol.clone(),
                quantity: p.quantity,
                isin: None,
            })
            .collect())
    }

    async fn get_positions(&self, _account_id: &str) -> Result<Vec<Position>, ClientError> {
        self.behavior.call().await?;
        Ok(self.positions.lock().clone())
    }

    async fn get_balances(&self, _account_id: &str) -> Result<Vec<Balance>, ClientError> {
        self.behavior.call().await?;
        Ok(self.balances.lock().clone())
    }
}

// =============================================================================
// LLM
// =============================================================================

/// Simulated LLM returning a canned analysis
pub struct SimLlm {
    behavior: SimBehavior,
    response: Mutex<serde_json::Value>,
    usage: Mutex<TokenUsage>,
}

impl SimLlm {
    pub fn new() -> Self {
        Self {
            behavior: SimBehavior::new(),
            response: Mutex::new(serde_json::json!({
                "action": "hold",
                "confidence": 0.62,
                "rationale": "simulated analysis",
            })),
            usage: Mutex::new(TokenUsage {
                input_tokens: 850,
                output_tokens: 210,
            }),
        }
    }

    pub fn fail_next(&self, count: u32, error: ClientError) {
        self.behavior.push_failures(count, error);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.behavior.latency.lock() = latency;
    }

    pub fn set_response(&self, response: serde_json::Value) {
        *self.response.lock() = response;
    }

    pub fn call_count(&self) -> u64 {
        self.behavior.call_count()
    }
}

impl Default for SimLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for SimLlm {
    async fn analyze(&self, _request: AnalysisRequest) -> Result<AnalysisOutcome, ClientError> {
        self.behavior.call().await?;
        Ok(AnalysisOutcome {
            content: self.response.lock().clone(),
            usage: *self.usage.lock(),
        })
    }
}

// =============================================================================
// Market data
// =============================================================================

/// Simulated news/earnings/fundamentals feed
pub struct SimMarketData {
    behavior: SimBehavior,
}

impl SimMarketData {
    pub fn new() -> Self {
        Self {
            behavior: SimBehavior::new(),
        }
    }

    pub fn fail_next(&self, count: u32, error: ClientError) {
        self.behavior.push_failures(count, error);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.behavior.latency.lock() = latency;
    }

    pub fn call_count(&self) -> u64 {
        self.behavior.call_count()
    }
}

impl Default for SimMarketData {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataClient for SimMarketData {
    async fn fetch_news(
        &self,
        symbols: &[String],
        _lookback_hours: u32,
    ) -> Result<Vec<NewsItem>, ClientError> {
        self.behavior.call().await?;
        Ok(symbols
            .iter()
            .map(|symbol| NewsItem {
                symbol: symbol.clone(),
                headline: format!("{symbol} announces quarterly results"),
                summary: format!("Simulated coverage for {symbol}."),
                published_at: Utc::now(),
                url: None,
            })
            .collect())
    }

    async fn fetch_earnings(&self, symbol: &str) -> Result<EarningsReport, ClientError> {
        self.behavior.call().await?;
        Ok(EarningsReport {
            symbol: symbol.to_string(),
            period: "Q1".into(),
            revenue: 1_250_000_000.0,
            net_income: 180_000_000.0,
            eps: 12.4,
            reported_at: Utc::now(),
        })
    }

    async fn fetch_fundamentals(&self, symbol: &str) -> Result<Fundamentals, ClientError> {
        self.behavior.call().await?;
        Ok(Fundamentals {
            symbol: symbol.to_string(),
            market_cap: 48_000_000_000.0,
            pe_ratio: Some(24.6),
            dividend_yield: Some(0.011),
            sector: "Industrials".into(),
        })
    }

    async fn fetch_option_chain(
        &self,
        symbol: &str,
        expiry: Option<&str>,
    ) -> Result<OptionChain, ClientError> {
        self.behavior.call().await?;
        Ok(OptionChain {
            symbol: symbol.to_string(),
            expiry: expiry.unwrap_or("next-month").to_string(),
            quotes: vec![
                OptionQuote {
                    strike: 100.0,
                    call_bid: 4.1,
                    call_ask: 4.4,
                    put_bid: 2.0,
                    put_ask: 2.2,
                },
                OptionQuote {
                    strike: 105.0,
                    call_bid: 1.9,
                    call_ask: 2.1,
                    put_bid: 4.6,
                    put_ask: 4.9,
                },
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let broker = SimBroker::new();
        broker.fail_next(2, ClientError::Transient("503".into()));

        assert!(broker.get_balances("a1").await.is_err());
        assert!(broker.get_balances("a1").await.is_err());
        assert!(broker.get_balances("a1").await.is_ok());
        assert_eq!(broker.call_count(), 3);
    }

    #[tokio::test]
    async fn test_order_keys_recorded() {
        let broker = SimBroker::new();
        let key = IdempotencyKey::new("task-1");
        broker
            .place_order(
                key.clone(),
                OrderRequest {
                    symbol: "ACME".into(),
                    side: tradeloop_contracts::OrderSide::Buy,
                    quantity: 10.0,
                    limit_price: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(broker.recorded_order_keys(), vec![key]);
    }

    #[tokio::test]
    async fn test_llm_canned_response() {
        let llm = SimLlm::new();
        llm.set_response(serde_json::json!({"action": "buy"}));
        let outcome = llm
            .analyze(AnalysisRequest {
                prompt: "test".into(),
                context: serde_json::json!({}),
                max_tokens: 512,
            })
            .await
            .unwrap();
        assert_eq!(outcome.content["action"], "buy");
        assert!(outcome.usage.total() > 0);
    }

    #[tokio::test]
    async fn test_market_data_shapes() {
        let data = SimMarketData::new();
        let news = data
            .fetch_news(&["ACME".into(), "GLOBEX".into()], 24)
            .await
            .unwrap();
        assert_eq!(news.len(), 2);

        let chain = data.fetch_option_chain("ACME", None).await.unwrap();
        assert_eq!(chain.quotes.len(), 2);
    }
}
