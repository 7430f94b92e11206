//! DataFetcher queue handlers
//!
//! External market-data bodies: news, earnings, fundamentals, and option
//! chains. Ingestion handlers publish domain events so the orchestration
//! layer can trigger downstream analysis.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use tradeloop_contracts::{
    Event, EventKind, ExternalApi, QueueName, TaskError, TaskPayload,
};

use super::{HandlerRegistry, TaskContext, TaskHandler};

const MARKET_DATA_APIS: &[ExternalApi] = &[ExternalApi::MarketData];

/// Register all data-fetcher handlers
pub fn register(registry: &HandlerRegistry) {
    registry.register(QueueName::DataFetcher, Arc::new(FetchNewsHandler));
    registry.register(QueueName::DataFetcher, Arc::new(FetchEarningsHandler));
    registry.register(QueueName::DataFetcher, Arc::new(FetchFundamentalsHandler));
    registry.register(QueueName::DataFetcher, Arc::new(FetchOptionChainHandler));
}

/// Fetch recent news for a symbol set
pub struct FetchNewsHandler;

#[async_trait]
impl TaskHandler for FetchNewsHandler {
    fn task_type(&self) -> &'static str {
        "fetch_news"
    }

    fn required_apis(&self) -> &'static [ExternalApi] {
        MARKET_DATA_APIS
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &TaskPayload,
    ) -> Result<serde_json::Value, TaskError> {
        let (symbols, lookback_hours) = match payload {
            TaskPayload::FetchNews {
                symbols,
                lookback_hours,
            } => (symbols, *lookback_hours),
            other => {
                return Err(TaskError::validation(format!(
                    "fetch_news received {}",
                    other.task_type()
                )))
            }
        };

        if symbols.is_empty() {
            return Err(TaskError::validation("fetch_news requires symbols"));
        }

        let items = tokio::select! {
            res = ctx.services.market_data.fetch_news(symbols, lookback_hours) => res?,
            _ = ctx.cancellation.cancelled() => {
                return Err(TaskError::cancelled("cancelled during news fetch"))
            }
        };

        ctx.services
            .bus
            .publish(
                Event::new(
                    EventKind::NewsIngested,
                    "data_fetcher.fetch_news",
                    json!({ "symbols": symbols, "count": items.len() }),
                )
                .with_correlation(ctx.correlation_id),
            )
            .await;

        Ok(json!({ "items": items, "count": items.len() }))
    }
}

/// Fetch the latest earnings report for a symbol
pub struct FetchEarningsHandler;

#[async_trait]
impl TaskHandler for FetchEarningsHandler {
    fn task_type(&self) -> &'static str {
        "fetch_earnings"
    }

    fn required_apis(&self) -> &'static [ExternalApi] {
        MARKET_DATA_APIS
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &TaskPayload,
    ) -> Result<serde_json::Value, TaskError> {
        let symbol = match payload {
            TaskPayload::FetchEarnings { symbol } => symbol,
            other => {
                return Err(TaskError::validation(format!(
                    "fetch_earnings received {}",
                    other.task_type()
                )))
            }
        };

        let report = tokio::select! {
            res = ctx.services.market_data.fetch_earnings(symbol) => res?,
            _ = ctx.cancellation.cancelled() => {
                return Err(TaskError::cancelled("cancelled during earnings fetch"))
            }
        };

        ctx.services
            .bus
            .publish(
                Event::new(
                    EventKind::EarningsIngested,
                    "data_fetcher.fetch_earnings",
                    json!({ "symbol": symbol, "period": report.period }),
                )
                .with_correlation(ctx.correlation_id),
            )
            .await;

        serde_json::to_value(&report)
            .map_err(|e| TaskError::fatal(format!("unserializable earnings report: {e}")))
    }
}

/// Fetch fundamentals for a symbol
pub struct FetchFundamentalsHandler;

#[async_trait]
impl TaskHandler for FetchFundamentalsHandler {
    fn task_type(&self) -> &'static str {
        "fetch_fundamentals"
    }

    fn required_apis(&self) -> &'static [ExternalApi] {
        MARKET_DATA_APIS
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &TaskPayload,
    ) -> Result<serde_json::Value, TaskError> {
        let symbol = match payload {
            TaskPayload::FetchFundamentals { symbol } => symbol,
            other => {
                return Err(TaskError::validation(format!(
                    "fetch_fundamentals received {}",
                    other.task_type()
                )))
            }
        };

        let fundamentals = tokio::select! {
            res = ctx.services.market_data.fetch_fundamentals(symbol) => res?,
            _ = ctx.cancellation.cancelled() => {
                return Err(TaskError::cancelled("cancelled during fundamentals fetch"))
            }
        };

        serde_json::to_value(&fundamentals)
            .map_err(|e| TaskError::fatal(format!("unserializable fundamentals: {e}")))
    }
}

/// Fetch an option chain for a symbol and expiry
pub struct FetchOptionChainHandler;

#[async_trait]
impl TaskHandler for FetchOptionChainHandler {
    fn task_type(&self) -> &'static str {
        "fetch_option_chain"
    }

    fn required_apis(&self) -> &'static [ExternalApi] {
        MARKET_DATA_APIS
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &TaskPayload,
    ) -> Result<serde_json::Value, TaskError> {
        let (symbol, expiry) = match payload {
            TaskPayload::FetchOptionChain { symbol, expiry } => (symbol, expiry.as_deref()),
            other => {
                return Err(TaskError::validation(format!(
                    "fetch_option_chain received {}",
                    other.task_type()
                )))
            }
        };

        let chain = tokio::select! {
            res = ctx.services.market_data.fetch_option_chain(symbol, expiry) => res?,
            _ = ctx.cancellation.cancelled() => {
                return Err(TaskError::cancelled("cancelled during option chain fetch"))
            }
        };

        serde_json::to_value(&chain)
            .map_err(|e| TaskError::fatal(format!("unserializable option chain: {e}")))
    }
}
