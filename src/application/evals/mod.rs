//! Rule-based evaluation harness.
//!
//! Every run is graded by the full registry. Each evaluator is a pure
//! function over the run's stored evidence (artifacts, orders, tool calls,
//! rankings, events); the eval node preloads that evidence once into an
//! `EvalContext`, runs the registry in a fixed order, and writes exactly
//! one `eval_results` row per evaluator. An evaluator failure becomes a
//! zero-score row, never an aborted run.

pub mod compliance;
pub mod data;
pub mod performance;
pub mod quality;
pub mod rag;
pub mod safety;

use crate::application::orchestrator::NodeContext;
use crate::domain::plan::ExecutionPlan;
use crate::domain::types::{Order, Run};
use crate::infrastructure::persistence::repositories::candles::CandleBatch;
use crate::infrastructure::persistence::repositories::rankings::Ranking;
use anyhow::Result;
use serde_json::Value;
use sqlx::Row;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub score: f64,
    pub reasons: Vec<String>,
    pub thresholds: Value,
    pub details: Option<Value>,
}

impl EvalOutcome {
    pub fn score(score: f64, reason: impl Into<String>) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
            reasons: vec![reason.into()],
            thresholds: Value::Null,
            details: None,
        }
    }

    pub fn pass(reason: impl Into<String>) -> Self {
        Self::score(1.0, reason)
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::score(0.0, reason)
    }

    /// Gated evaluators (news disabled, no oracle data) report why they
    /// did not grade.
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::score(1.0, reason)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reasons.push(reason.into());
        self
    }

    pub fn with_thresholds(mut self, thresholds: Value) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ToolCallRow {
    pub tool_name: String,
    pub mcp_server: String,
    pub status: String,
    pub latency_ms: Option<i64>,
    pub http_status: Option<i64>,
    pub attempt: i64,
    pub request: Value,
    pub response: Option<Value>,
}

/// Preloaded run evidence. Evaluators read from this and nothing else.
pub struct EvalContext {
    pub run: Run,
    pub plan: Option<ExecutionPlan>,
    pub trade_proposal: Option<Value>,
    pub orders: Vec<Order>,
    pub ranking: Option<Ranking>,
    pub batches: Vec<CandleBatch>,
    pub artifacts: Vec<(String, String, Value)>,
    pub node_outputs: HashMap<String, Value>,
    pub node_timings: Vec<(String, Option<String>, Option<String>)>,
    pub events: Vec<(String, Value)>,
    pub tool_calls: Vec<ToolCallRow>,
    pub policy_decision: Option<String>,
    pub news_items: Vec<Value>,
}

impl EvalContext {
    pub async fn load(ctx: &NodeContext, run: Run) -> Result<Self> {
        let run_id = run.run_id.clone();

        let plan = ctx.runs.get_execution_plan(&run_id).await?;
        let orders = ctx.orders.list_for_run(&run_id).await?;
        let ranking = ctx.rankings.get_latest_for_run(&run_id).await?;
        let batches = ctx.candles.list_batches_for_run(&run_id).await?;
        let artifacts = ctx.artifacts.list_for_run(&run_id).await?;
        let events = ctx.events.list_for_run(&run_id).await?;

        let trade_proposal = sqlx::query("SELECT trade_proposal_json FROM runs WHERE run_id = ?")
            .bind(&run_id)
            .fetch_optional(&ctx.database.pool)
            .await?
            .and_then(|r| r.get::<Option<String>, _>("trade_proposal_json"))
            .and_then(|raw| serde_json::from_str(&raw).ok());

        let mut node_outputs = HashMap::new();
        let mut node_timings = Vec::new();
        let node_rows = sqlx::query(
            "SELECT name, outputs_json, started_at, completed_at FROM dag_nodes WHERE run_id = ? ORDER BY started_at ASC",
        )
        .bind(&run_id)
        .fetch_all(&ctx.database.pool)
        .await?;
        for row in node_rows {
            let name: String = row.get("name");
            if let Some(raw) = row.get::<Option<String>, _>("outputs_json")
                && let Ok(outputs) = serde_json::from_str::<Value>(&raw)
            {
                node_outputs.insert(name.clone(), outputs);
            }
            node_timings.push((name, row.get("started_at"), row.get("completed_at")));
        }

        let tool_calls = sqlx::query(
            "SELECT tool_name, mcp_server, status, latency_ms, http_status, attempt, request_json, response_json FROM tool_calls WHERE run_id = ?",
        )
        .bind(&run_id)
        .fetch_all(&ctx.database.pool)
        .await?
        .into_iter()
        .map(|row| {
            let request_raw: String = row.get("request_json");
            let response_raw: Option<String> = row.get("response_json");
            ToolCallRow {
                tool_name: row.get("tool_name"),
                mcp_server: row.get("mcp_server"),
                status: row.get("status"),
                latency_ms: row.get("latency_ms"),
                http_status: row.get("http_status"),
                attempt: row.get("attempt"),
                request: serde_json::from_str(&request_raw).unwrap_or(Value::Null),
                response: response_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
            }
        })
        .collect();

        let policy_decision = sqlx::query(
            "SELECT decision FROM policy_events WHERE run_id = ? ORDER BY ts DESC LIMIT 1",
        )
        .bind(&run_id)
        .fetch_optional(&ctx.database.pool)
        .await?
        .map(|r| r.get("decision"));

        let news_items = sqlx::query(
            r#"
            SELECT n.title, n.summary, n.published_at
            FROM run_news_evidence e JOIN news_items n ON n.id = e.news_id
            WHERE e.run_id = ?
            "#,
        )
        .bind(&run_id)
        .fetch_all(&ctx.database.pool)
        .await?
        .into_iter()
        .map(|row| {
            serde_json::json!({
                "title": row.get::<Option<String>, _>("title"),
                "summary": row.get::<Option<String>, _>("summary"),
                "published_at": row.get::<Option<String>, _>("published_at"),
            })
        })
        .collect();

        Ok(Self {
            run,
            plan,
            trade_proposal,
            orders,
            ranking,
            batches,
            artifacts,
            node_outputs,
            node_timings,
            events,
            tool_calls,
            policy_decision,
            news_items,
        })
    }

    /// Latest artifact of a given type.
    pub fn artifact(&self, artifact_type: &str) -> Option<&Value> {
        self.artifacts
            .iter()
            .rev()
            .find(|(_, kind, _)| kind == artifact_type)
            .map(|(_, _, value)| value)
    }

    pub fn is_trade_run(&self) -> bool {
        self.run.intent == "TRADE_EXECUTION"
    }

    pub fn is_portfolio_run(&self) -> bool {
        self.run.intent == "PORTFOLIO_ANALYSIS"
    }
}

/// A rule-based evaluator. Pure over the preloaded context; a returned
/// error is captured by the eval node into a zero-score row.
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &'static str;
    fn category(&self) -> &'static str;
    fn evaluator_type(&self) -> &'static str {
        "rule_based"
    }
    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome>;
}

/// The full registry, in the fixed execution order. Every eval here emits
/// exactly one row per run.
pub fn registry() -> Vec<Box<dyn Evaluator>> {
    vec![
        // data
        Box::new(data::SchemaValidity),
        Box::new(data::MarketEvidenceIntegrity),
        Box::new(data::DataFreshness),
        Box::new(data::CoinbaseDataIntegrity),
        // compliance
        Box::new(compliance::PolicyCompliance),
        Box::new(compliance::PolicyDecisionPresent),
        Box::new(compliance::LiveTradeTruthfulness),
        Box::new(compliance::OrderSubmissionTruthfulness),
        Box::new(compliance::ConfirmTradeIdempotency),
        Box::new(compliance::InsufficientBalanceTruthfulness),
        Box::new(compliance::RiskGateCompliance),
        Box::new(compliance::BudgetCompliance),
        Box::new(compliance::TradabilityPreflightPass),
        Box::new(compliance::DecisionLockConsistency),
        // quality
        Box::new(quality::RankingCorrectness),
        Box::new(quality::ProfitRankingCorrectness),
        Box::new(quality::PlanCompleteness),
        Box::new(quality::UxCompleteness),
        Box::new(quality::IntentParseCorrectness),
        Box::new(quality::TradeAmountIntentCorrectness),
        Box::new(quality::ActionGrounding),
        Box::new(quality::EvidenceSufficiency),
        Box::new(quality::StrategyValidity),
        Box::new(quality::ResponseFormatScore),
        Box::new(quality::RunStateConsistency),
        Box::new(quality::DeterminismReplay),
        // performance
        Box::new(performance::LatencySlo),
        Box::new(performance::EndToEndLatency),
        Box::new(performance::TimeWindowCorrectness),
        Box::new(performance::ToolErrorRate),
        Box::new(performance::ToolCallCoverage),
        Box::new(performance::RateLimitResilience),
        Box::new(performance::ProductMetadataAvailability),
        // rag
        Box::new(rag::Faithfulness),
        Box::new(rag::AnswerRelevance),
        Box::new(rag::RetrievalRelevance),
        Box::new(rag::NumericGrounding),
        Box::new(rag::HallucinationDetection),
        Box::new(rag::PortfolioGrounding),
        Box::new(rag::CitationCoverage),
        // safety
        Box::new(safety::PolicyInvariants),
        Box::new(safety::PromptInjectionResistance),
        Box::new(safety::NewsFreshness),
        Box::new(safety::NewsEvidenceIntegrity),
        Box::new(safety::ClusterDedupScore),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_registry_names_are_unique() {
        let registry = registry();
        let names: HashSet<&str> = registry.iter().map(|e| e.name()).collect();
        assert_eq!(names.len(), registry.len());
    }

    #[test]
    fn test_registry_covers_all_categories() {
        let categories: HashSet<&str> = registry().iter().map(|e| e.category()).collect();
        for expected in ["data", "compliance", "quality", "performance", "rag", "safety"] {
            assert!(categories.contains(expected), "missing category {}", expected);
        }
    }

    #[test]
    fn test_registry_size() {
        assert!(registry().len() >= 40);
    }

    #[test]
    fn test_outcome_clamping() {
        assert_eq!(EvalOutcome::score(1.5, "over").score, 1.0);
        assert_eq!(EvalOutcome::score(-0.5, "under").score, 0.0);
    }
}
