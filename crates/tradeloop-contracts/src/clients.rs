//! Outbound collaborator contracts
//!
//! The core performs no network I/O itself; handlers drive these traits.
//! Every mutating broker call takes an idempotency key (the task id) so that
//! engine retries do not double-apply effects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Rate-budget key space: the external APIs the platform talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalApi {
    Broker,
    Llm,
    MarketData,
}

impl ExternalApi {
    pub const ALL: [ExternalApi; 3] = [
        ExternalApi::Broker,
        ExternalApi::Llm,
        ExternalApi::MarketData,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broker => "broker",
            Self::Llm => "llm",
            Self::MarketData => "market_data",
        }
    }
}

impl std::fmt::Display for ExternalApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable key handed to non-idempotent upstream calls (typically a task id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Broker DTOs
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub cash: f64,
    pub margin_available: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub avg_price: f64,
    pub last_price: f64,
}

impl Position {
    pub fn unrealized_pnl(&self) -> f64 {
        (self.last_price - self.avg_price) * self.quantity
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub quantity: f64,
    pub isin: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub limit_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub accepted_at: DateTime<Utc>,
}

// =============================================================================
// Market data DTOs
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    pub symbol: String,
    pub headline: String,
    pub summary: String,
    pub published_at: DateTime<Utc>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarningsReport {
    pub symbol: String,
    pub period: String,
    pub revenue: f64,
    pub net_income: f64,
    pub eps: f64,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fundamentals {
    pub symbol: String,
    pub market_cap: f64,
    pub pe_ratio: Option<f64>,
    pub dividend_yield: Option<f64>,
    pub sector: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionQuote {
    pub strike: f64,
    pub call_bid: f64,
    pub call_ask: f64,
    pub put_bid: f64,
    pub put_ask: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionChain {
    pub symbol: String,
    pub expiry: String,
    pub quotes: Vec<OptionQuote>,
}

// =============================================================================
// LLM DTOs
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub prompt: String,

    /// Structured context (positions, news, fundamentals) the model reasons
    /// over
    pub context: serde_json::Value,

    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    /// Model output, expected to be structured JSON
    pub content: serde_json::Value,

    /// Reported back to the rate budget as the call's cost
    pub usage: TokenUsage,
}

// =============================================================================
// Client traits
// =============================================================================

/// Broker API surface used by the PortfolioSync queue
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    async fn place_order(
        &self,
        key: IdempotencyKey,
        order: OrderRequest,
    ) -> Result<OrderAck, ClientError>;

    async fn get_holdings(&self, account_id: &str) -> Result<Vec<Holding>, ClientError>;

    async fn get_positions(&self, account_id: &str) -> Result<Vec<Position>, ClientError>;

    async fn get_balances(&self, account_id: &str) -> Result<Vec<Balance>, ClientError>;
}

/// LLM API surface used by the AiAnalysis queue
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisOutcome, ClientError>;
}

/// News/earnings/fundamentals API surface used by the DataFetcher queue
#[async_trait::async_trait]
pub trait MarketDataClient: Send + Sync {
    async fn fetch_news(
        &self,
        symbols: &[String],
        lookback_hours: u32,
    ) -> Result<Vec<NewsItem>, ClientError>;

    async fn fetch_earnings(&self, symbol: &str) -> Result<EarningsReport, ClientError>;

    async fn fetch_fundamentals(&self, symbol: &str) -> Result<Fundamentals, ClientError>;

    async fn fetch_option_chain(
        &self,
        symbol: &str,
        expiry: Option<&str>,
    ) -> Result<OptionChain, ClientError>;
}
