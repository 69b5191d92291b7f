//! Planner: converts a TradeIntent into a StrategySpec and ExecutionPlan.

use crate::domain::plan::{DecisionTraceEntry, ExecutionPlan, StrategySpec, TradeIntent};
use chrono::Utc;
use rust_decimal_macros::dec;

/// Strategy selection by metric:
/// - "return" -> TopReturnStrategy
/// - "sharpe_proxy" -> SharpeOptimizedStrategy
/// - "momentum" -> MomentumStrategy
pub fn plan_execution(trade_intent: TradeIntent, run_id: &str) -> ExecutionPlan {
    let strategy_name = match trade_intent.metric.as_str() {
        "return" => "TopReturnStrategy",
        "sharpe_proxy" => "SharpeOptimizedStrategy",
        "momentum" => "MomentumStrategy",
        _ => "TopReturnStrategy",
    }
    .to_string();

    let strategy_spec = StrategySpec {
        strategy_name: strategy_name.clone(),
        window: trade_intent.window.clone(),
        lookback_hours: trade_intent.lookback_hours,
        metric: trade_intent.metric.clone(),
        universe: trade_intent.universe.clone(),
        params: serde_json::json!({
            "budget_usd": trade_intent.budget_usd,
            "side": trade_intent.side.to_string(),
        }),
    };

    let decision_trace = vec![
        DecisionTraceEntry {
            step: "parse_command".to_string(),
            detail: serde_json::json!({
                "input": trade_intent.raw_command,
                "side": trade_intent.side.to_string(),
                "budget_usd": trade_intent.budget_usd,
            }),
            timestamp: Utc::now(),
        },
        DecisionTraceEntry {
            step: "create_strategy_spec".to_string(),
            detail: serde_json::json!({
                "strategy": strategy_name,
                "metric": trade_intent.metric,
                "universe_size": trade_intent.universe.len(),
            }),
            timestamp: Utc::now(),
        },
    ];

    let mut risk_checks = Vec::new();
    if trade_intent.budget_usd > dec!(1000) {
        risk_checks.push("budget_exceeds_1000_usd".to_string());
    }
    if trade_intent.universe.len() < 2 {
        risk_checks.push("universe_too_small".to_string());
    }

    ExecutionPlan {
        run_id: run_id.to_string(),
        trade_intent,
        strategy_spec,
        decision_trace,
        risk_checks,
        selected_asset: None,
        selected_order: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::OrderSide;

    fn intent(metric: &str, universe: Vec<&str>) -> TradeIntent {
        TradeIntent {
            side: OrderSide::Buy,
            budget_usd: dec!(10),
            universe: universe.into_iter().map(String::from).collect(),
            raw_command: "buy $10 of the top crypto".to_string(),
            metric: metric.to_string(),
            window: "24h".to_string(),
            lookback_hours: 24.0,
        }
    }

    #[test]
    fn test_strategy_names_by_metric() {
        let plan = plan_execution(intent("return", vec!["BTC-USD", "ETH-USD"]), "run_1");
        assert_eq!(plan.strategy_spec.strategy_name, "TopReturnStrategy");

        let plan = plan_execution(intent("momentum", vec!["BTC-USD", "ETH-USD"]), "run_1");
        assert_eq!(plan.strategy_spec.strategy_name, "MomentumStrategy");

        let plan = plan_execution(intent("sharpe_proxy", vec!["BTC-USD", "ETH-USD"]), "run_1");
        assert_eq!(plan.strategy_spec.strategy_name, "SharpeOptimizedStrategy");
    }

    #[test]
    fn test_risk_checks_flag_small_universe() {
        let plan = plan_execution(intent("return", vec!["BTC-USD"]), "run_1");
        assert!(plan.risk_checks.contains(&"universe_too_small".to_string()));
        assert_eq!(plan.decision_trace.len(), 2);
        assert!(plan.selected_asset.is_none());
    }
}
