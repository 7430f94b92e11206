//! PortfolioSync queue handlers
//!
//! Broker-facing task bodies: balance/position synchronization, P&L, and
//! risk-limit validation. Every call into the broker carries the task id as
//! its idempotency key.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use tradeloop_contracts::{
    Event, EventKind, ExternalApi, QueueName, TaskError, TaskPayload,
};

use super::{HandlerRegistry, TaskContext, TaskHandler};

const BROKER_APIS: &[ExternalApi] = &[ExternalApi::Broker];

/// Gross exposure allowed as a multiple of available cash
const MAX_GROSS_LEVERAGE: f64 = 2.0;

/// Register all portfolio handlers
pub fn register(registry: &HandlerRegistry) {
    registry.register(QueueName::PortfolioSync, Arc::new(SyncBalancesHandler));
    registry.register(QueueName::PortfolioSync, Arc::new(UpdatePositionsHandler));
    registry.register(QueueName::PortfolioSync, Arc::new(ComputePnlHandler));
    registry.register(QueueName::PortfolioSync, Arc::new(ValidateRiskLimitsHandler));
}

/// Pull cash balances from the broker and report the reconciled totals
pub struct SyncBalancesHandler;

#[async_trait]
impl TaskHandler for SyncBalancesHandler {
    fn task_type(&self) -> &'static str {
        "sync_balances"
    }

    fn required_apis(&self) -> &'static [ExternalApi] {
        BROKER_APIS
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &TaskPayload,
    ) -> Result<serde_json::Value, TaskError> {
        let account_id = match payload {
            TaskPayload::SyncBalances { account_id } => account_id,
            other => {
                return Err(TaskError::validation(format!(
                    "sync_balances received {}",
                    other.task_type()
                )))
            }
        };

        let balances = tokio::select! {
            res = ctx.services.broker.get_balances(account_id) => res?,
            _ = ctx.cancellation.cancelled() => {
                return Err(TaskError::cancelled("cancelled during balance fetch"))
            }
        };

        let total_cash: f64 = balances.iter().map(|b| b.cash).sum();
        debug!(account_id, total_cash, "balances synced");

        ctx.services
            .bus
            .publish(
                Event::new(
                    EventKind::PortfolioUpdated,
                    "portfolio.sync_balances",
                    json!({ "account_id": account_id, "total_cash": total_cash }),
                )
                .with_correlation(ctx.correlation_id),
            )
            .await;

        Ok(json!({
            "account_id": account_id,
            "balances": balances,
            "total_cash": total_cash,
        }))
    }
}

/// Refresh open positions from the broker
pub struct UpdatePositionsHandler;

#[async_trait]
impl TaskHandler for UpdatePositionsHandler {
    fn task_type(&self) -> &'static str {
        "update_positions"
    }

    fn required_apis(&self) -> &'static [ExternalApi] {
        BROKER_APIS
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &TaskPayload,
    ) -> Result<serde_json::Value, TaskError> {
        let account_id = match payload {
            TaskPayload::UpdatePositions { account_id } => account_id,
            other => {
                return Err(TaskError::validation(format!(
                    "update_positions received {}",
                    other.task_type()
                )))
            }
        };

        let positions = tokio::select! {
            res = ctx.services.broker.get_positions(account_id) => res?,
            _ = ctx.cancellation.cancelled() => {
                return Err(TaskError::cancelled("cancelled during position fetch"))
            }
        };

        ctx.services
            .bus
            .publish(
                Event::new(
                    EventKind::PortfolioUpdated,
                    "portfolio.update_positions",
                    json!({ "account_id": account_id, "positions": positions.len() }),
                )
                .with_correlation(ctx.correlation_id),
            )
            .await;

        Ok(json!({
            "account_id": account_id,
            "positions": positions,
            "count": positions.len(),
        }))
    }
}

/// Compute unrealized P&L from the latest positions snapshot
pub struct ComputePnlHandler;

#[async_trait]
impl TaskHandler for ComputePnlHandler {
    fn task_type(&self) -> &'static str {
        "compute_pnl"
    }

    fn required_apis(&self) -> &'static [ExternalApi] {
        BROKER_APIS
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &TaskPayload,
    ) -> Result<serde_json::Value, TaskError> {
        let (account_id, as_of) = match payload {
            TaskPayload::ComputePnl { account_id, as_of } => (account_id, *as_of),
            other => {
                return Err(TaskError::validation(format!(
                    "compute_pnl received {}",
                    other.task_type()
                )))
            }
        };

        let positions = tokio::select! {
            res = ctx.services.broker.get_positions(account_id) => res?,
            _ = ctx.cancellation.cancelled() => {
                return Err(TaskError::cancelled("cancelled during position fetch"))
            }
        };

        let unrealized: f64 = positions.iter().map(|p| p.unrealized_pnl()).sum();
        let per_symbol: Vec<serde_json::Value> = positions
            .iter()
            .map(|p| json!({ "symbol": p.symbol, "unrealized": p.unrealized_pnl() }))
            .collect();

        Ok(json!({
            "account_id": account_id,
            "as_of": as_of,
            "unrealized_pnl": unrealized,
            "per_symbol": per_symbol,
        }))
    }
}

/// Check gross exposure against the leverage limit
pub struct ValidateRiskLimitsHandler;

#[async_trait]
impl TaskHandler for ValidateRiskLimitsHandler {
    fn task_type(&self) -> &'static str {
        "validate_risk_limits"
    }

    fn required_apis(&self) -> &'static [ExternalApi] {
        BROKER_APIS
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &TaskPayload,
    ) -> Result<serde_json::Value, TaskError> {
        let account_id = match payload {
            TaskPayload::ValidateRiskLimits { account_id } => account_id,
            other => {
                return Err(TaskError::validation(format!(
                    "validate_risk_limits received {}",
                    other.task_type()
                )))
            }
        };

        let (positions, balances) = tokio::select! {
            res = async {
                let positions = ctx.services.broker.get_positions(account_id).await?;
                let balances = ctx.services.broker.get_balances(account_id).await?;
                Ok::<_, tradeloop_contracts::ClientError>((positions, balances))
            } => res?,
            _ = ctx.cancellation.cancelled() => {
                return Err(TaskError::cancelled("cancelled during risk check"))
            }
        };

        let gross_exposure: f64 = positions
            .iter()
            .map(|p| (p.quantity * p.last_price).abs())
            .sum();
        let cash: f64 = balances.iter().map(|b| b.cash).sum();
        let limit = cash * MAX_GROSS_LEVERAGE;
        let ok = gross_exposure <= limit;

        Ok(json!({
            "account_id": account_id,
            "gross_exposure": gross_exposure,
            "limit": limit,
            "ok": ok,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, EventBus};
    use crate::config::OrchestratorConfig;
    use crate::queues::ContextServices;
    use crate::reliability::RateBudget;
    use crate::sim::{SimBroker, SimLlm, SimMarketData};
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;
    use tradeloop_contracts::{Balance, CorrelationId, Position, TaskId};

    fn context(broker: Arc<SimBroker>) -> TaskContext {
        let config = OrchestratorConfig::default();
        TaskContext {
            task_id: TaskId::generate(),
            correlation_id: CorrelationId::generate(),
            attempt: 1,
            deadline: Utc::now() + chrono::Duration::seconds(30),
            cancellation: CancellationToken::new(),
            rate_grants: vec![],
            services: ContextServices {
                broker,
                llm: Arc::new(SimLlm::new()),
                market_data: Arc::new(SimMarketData::new()),
                bus: EventBus::new(BusConfig::default()),
                rate_budget: Arc::new(RateBudget::new(&config.rate)),
            },
        }
    }

    #[tokio::test]
    async fn test_sync_balances() {
        let broker = Arc::new(SimBroker::new());
        let ctx = context(Arc::clone(&broker));

        let result = SyncBalancesHandler
            .handle(
                &ctx,
                &TaskPayload::SyncBalances {
                    account_id: "acct-1".into(),
                },
            )
            .await
            .unwrap();

        assert_eq!(result["account_id"], "acct-1");
        assert_eq!(result["total_cash"], 250_000.0);
    }

    #[tokio::test]
    async fn test_payload_mismatch_is_validation_error() {
        let ctx = context(Arc::new(SimBroker::new()));
        let err = SyncBalancesHandler
            .handle(
                &ctx,
                &TaskPayload::FetchEarnings {
                    symbol: "ACME".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, tradeloop_contracts::TaskErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_compute_pnl_sums_positions() {
        let broker = Arc::new(SimBroker::new());
        broker.set_positions(vec![
            Position {
                symbol: "A".into(),
                quantity: 10.0,
                avg_price: 100.0,
                last_price: 110.0,
            },
            Position {
                symbol: "B".into(),
                quantity: 5.0,
                avg_price: 50.0,
                last_price: 45.0,
            },
        ]);
        let ctx = context(Arc::clone(&broker));

        let result = ComputePnlHandler
            .handle(
                &ctx,
                &TaskPayload::ComputePnl {
                    account_id: "acct-1".into(),
                    as_of: Utc::now(),
                },
            )
            .await
            .unwrap();

        // 10*10 - 5*5 = 75
        assert_eq!(result["unrealized_pnl"], 75.0);
    }

    #[tokio::test]
    async fn test_risk_limits_breach() {
        let broker = Arc::new(SimBroker::new());
        broker.set_positions(vec![Position {
            symbol: "A".into(),
            quantity: 1000.0,
            avg_price: 100.0,
            last_price: 100.0,
        }]);
        broker.set_balances(vec![Balance {
            currency: "INR".into(),
            cash: 10_000.0,
            margin_available: 0.0,
        }]);
        let ctx = context(Arc::clone(&broker));

        let result = ValidateRiskLimitsHandler
            .handle(
                &ctx,
                &TaskPayload::ValidateRiskLimits {
                    account_id: "acct-1".into(),
                },
            )
            .await
            .unwrap();

        assert_eq!(result["ok"], false);
        assert_eq!(result["gross_exposure"], 100_000.0);
    }

    #[tokio::test]
    async fn test_broker_error_maps_to_task_error() {
        let broker = Arc::new(SimBroker::new());
        broker.fail_next(1, tradeloop_contracts::ClientError::Transient("503".into()));
        let ctx = context(Arc::clone(&broker));

        let err = UpdatePositionsHandler
            .handle(
                &ctx,
                &TaskPayload::UpdatePositions {
                    account_id: "acct-1".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, tradeloop_contracts::TaskErrorKind::Transient);
        assert!(err.recoverable);
    }

    #[tokio::test]
    async fn test_cancellation_is_observed() {
        let broker = Arc::new(SimBroker::new());
        broker.set_latency(std::time::Duration::from_secs(5));
        let ctx = context(Arc::clone(&broker));
        ctx.cancellation.cancel();

        let err = SyncBalancesHandler
            .handle(
                &ctx,
                &TaskPayload::SyncBalances {
                    account_id: "acct-1".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, tradeloop_contracts::TaskErrorKind::Cancelled);
    }
}
