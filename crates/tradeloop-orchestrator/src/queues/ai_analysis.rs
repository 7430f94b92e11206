//! AiAnalysis queue handlers
//!
//! LLM-backed task bodies. Each invocation reports its token usage back to
//! the rate budget so the engine's quota tracking reflects real consumption
//! rather than a flat per-call cost.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use tradeloop_contracts::{
    AnalysisOutcome, AnalysisRequest, Event, EventKind, ExternalApi, QueueName, TaskError,
    TaskPayload,
};

use super::{HandlerRegistry, TaskContext, TaskHandler};

const LLM_APIS: &[ExternalApi] = &[ExternalApi::Llm];

const DEFAULT_MAX_TOKENS: u32 = 2048;

/// Register all AI-analysis handlers
pub fn register(registry: &HandlerRegistry) {
    registry.register(QueueName::AiAnalysis, Arc::new(MorningPrepHandler));
    registry.register(QueueName::AiAnalysis, Arc::new(EveningReviewHandler));
    registry.register(QueueName::AiAnalysis, Arc::new(GenerateRecommendationHandler));
    registry.register(QueueName::AiAnalysis, Arc::new(EvaluateStrategyHandler));
    registry.register(QueueName::AiAnalysis, Arc::new(AnalyzeEarningsHandler));
}

/// Run one analysis call with cancellation and usage accounting
async fn run_analysis(
    ctx: &TaskContext,
    prompt: String,
    context: serde_json::Value,
) -> Result<AnalysisOutcome, TaskError> {
    let request = AnalysisRequest {
        prompt,
        context,
        max_tokens: DEFAULT_MAX_TOKENS,
    };

    let outcome = tokio::select! {
        res = ctx.services.llm.analyze(request) => res?,
        _ = ctx.cancellation.cancelled() => {
            return Err(TaskError::cancelled("cancelled during analysis"))
        }
    };

    ctx.report_usage(ExternalApi::Llm, outcome.usage.total() as f64);
    Ok(outcome)
}

/// Pre-market briefing over the watchlist
pub struct MorningPrepHandler;

#[async_trait]
impl TaskHandler for MorningPrepHandler {
    fn task_type(&self) -> &'static str {
        "morning_prep"
    }

    fn required_apis(&self) -> &'static [ExternalApi] {
        LLM_APIS
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &TaskPayload,
    ) -> Result<serde_json::Value, TaskError> {
        let symbols = match payload {
            TaskPayload::MorningPrep { symbols } => symbols,
            other => {
                return Err(TaskError::validation(format!(
                    "morning_prep received {}",
                    other.task_type()
                )))
            }
        };
        if symbols.is_empty() {
            return Err(TaskError::validation("morning_prep requires symbols"));
        }

        let outcome = run_analysis(
            ctx,
            "Summarize overnight developments and flag pre-market risks for the watchlist."
                .to_string(),
            json!({ "symbols": symbols }),
        )
        .await?;

        Ok(json!({
            "symbols": symbols,
            "briefing": outcome.content,
            "tokens": outcome.usage.total(),
        }))
    }
}

/// Post-market review over the watchlist
pub struct EveningReviewHandler;

#[async_trait]
impl TaskHandler for EveningReviewHandler {
    fn task_type(&self) -> &'static str {
        "evening_review"
    }

    fn required_apis(&self) -> &'static [ExternalApi] {
        LLM_APIS
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &TaskPayload,
    ) -> Result<serde_json::Value, TaskError> {
        let symbols = match payload {
            TaskPayload::EveningReview { symbols } => symbols,
            other => {
                return Err(TaskError::validation(format!(
                    "evening_review received {}",
                    other.task_type()
                )))
            }
        };
        if symbols.is_empty() {
            return Err(TaskError::validation("evening_review requires symbols"));
        }

        let outcome = run_analysis(
            ctx,
            "Review today's session for the watchlist and note follow-ups.".to_string(),
            json!({ "symbols": symbols }),
        )
        .await?;

        Ok(json!({
            "symbols": symbols,
            "review": outcome.content,
            "tokens": outcome.usage.total(),
        }))
    }
}

/// Produce a buy/hold/sell recommendation for one symbol
pub struct GenerateRecommendationHandler;

#[async_trait]
impl TaskHandler for GenerateRecommendationHandler {
    fn task_type(&self) -> &'static str {
        "generate_recommendation"
    }

    fn required_apis(&self) -> &'static [ExternalApi] {
        LLM_APIS
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &TaskPayload,
    ) -> Result<serde_json::Value, TaskError> {
        let symbol = match payload {
            TaskPayload::GenerateRecommendation { symbol } => symbol,
            other => {
                return Err(TaskError::validation(format!(
                    "generate_recommendation received {}",
                    other.task_type()
                )))
            }
        };

        let outcome = run_analysis(
            ctx,
            format!("Produce a buy/hold/sell recommendation for {symbol} with confidence."),
            json!({ "symbol": symbol }),
        )
        .await?;

        let action = outcome
            .content
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or("hold")
            .to_string();

        ctx.services
            .bus
            .publish(
                Event::new(
                    EventKind::RecommendationProduced,
                    "ai_analysis.generate_recommendation",
                    json!({ "symbol": symbol, "action": action }),
                )
                .with_correlation(ctx.correlation_id),
            )
            .await;

        Ok(json!({
            "symbol": symbol,
            "action": action,
            "analysis": outcome.content,
            "tokens": outcome.usage.total(),
        }))
    }
}

/// Score a strategy against recent outcomes
pub struct EvaluateStrategyHandler;

#[async_trait]
impl TaskHandler for EvaluateStrategyHandler {
    fn task_type(&self) -> &'static str {
        "evaluate_strategy"
    }

    fn required_apis(&self) -> &'static [ExternalApi] {
        LLM_APIS
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &TaskPayload,
    ) -> Result<serde_json::Value, TaskError> {
        let strategy_id = match payload {
            TaskPayload::EvaluateStrategy { strategy_id } => strategy_id,
            other => {
                return Err(TaskError::validation(format!(
                    "evaluate_strategy received {}",
                    other.task_type()
                )))
            }
        };

        let outcome = run_analysis(
            ctx,
            format!("Evaluate strategy {strategy_id} against its recent fills and drawdown."),
            json!({ "strategy_id": strategy_id }),
        )
        .await?;

        Ok(json!({
            "strategy_id": strategy_id,
            "evaluation": outcome.content,
            "tokens": outcome.usage.total(),
        }))
    }
}

/// Interpret a freshly ingested earnings report
pub struct AnalyzeEarningsHandler;

#[async_trait]
impl TaskHandler for AnalyzeEarningsHandler {
    fn task_type(&self) -> &'static str {
        "analyze_earnings"
    }

    fn required_apis(&self) -> &'static [ExternalApi] {
        LLM_APIS
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &TaskPayload,
    ) -> Result<serde_json::Value, TaskError> {
        let symbol = match payload {
            TaskPayload::AnalyzeEarnings { symbol } => symbol,
            other => {
                return Err(TaskError::validation(format!(
                    "analyze_earnings received {}",
                    other.task_type()
                )))
            }
        };

        let outcome = run_analysis(
            ctx,
            format!("Interpret the latest earnings report for {symbol}."),
            json!({ "symbol": symbol }),
        )
        .await?;

        Ok(json!({
            "symbol": symbol,
            "analysis": outcome.content,
            "tokens": outcome.usage.total(),
        }))
    }
}
