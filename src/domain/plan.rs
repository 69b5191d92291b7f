//! Execution planning types: the structured intent a confirmed command
//! expands into, and the plan the DAG nodes read and refine.

use crate::domain::types::OrderSide;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Structured trade intent derived from a confirmed proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub side: OrderSide,
    pub budget_usd: Decimal,
    pub universe: Vec<String>,
    pub raw_command: String,
    pub metric: String,
    pub window: String,
    pub lookback_hours: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySpec {
    pub strategy_name: String,
    pub window: String,
    pub lookback_hours: f64,
    pub metric: String,
    pub universe: Vec<String>,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTraceEntry {
    pub step: String,
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// The plan a run carries. Strategy fills in `selected_asset` and
/// `selected_order` once rankings are computed; direct-asset trades arrive
/// with both pre-set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub run_id: String,
    pub trade_intent: TradeIntent,
    pub strategy_spec: StrategySpec,
    pub decision_trace: Vec<DecisionTraceEntry>,
    pub risk_checks: Vec<String>,
    #[serde(default)]
    pub selected_asset: Option<String>,
    #[serde(default)]
    pub selected_order: Option<SelectedOrder>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub notional_usd: Decimal,
}

/// Outcome of the strategy node's ranking pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyResult {
    pub selected_symbol: String,
    pub score: f64,
    pub rationale: String,
    pub candles_used: usize,
    pub computed_at: DateTime<Utc>,
}

/// One row of a ranking table, persisted as evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingRow {
    pub symbol: String,
    pub score: f64,
    pub volume_proxy: f64,
    pub candles_count: usize,
    pub first_price: f64,
    pub last_price: f64,
}
