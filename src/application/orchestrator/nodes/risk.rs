//! Risk node: bounds checks on the selected order before a proposal is
//! drafted. Findings land in the node outputs; the proposal node folds
//! them into the trade proposal.

use crate::application::orchestrator::NodeContext;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
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
        .context("Risk node: no execution plan on run")?;
    let order = plan
        .selected_order
        .as_ref()
        .context("Risk node: no selected order on plan")?;

    let mut warnings: Vec<String> = Vec::new();
    let mut checks: Vec<serde_json::Value> = Vec::new();

    // Notional cap
    let max_notional = ctx.config.max_notional_per_order_usd;
    let notional_ok = order.notional_usd <= max_notional;
    checks.push(json!({
        "check": "max_notional",
        "passed": notional_ok,
        "notional_usd": order.notional_usd,
        "max_notional_usd": max_notional,
    }));
    if !notional_ok {
        warnings.push(format!(
            "Order notional ${} exceeds the per-order cap of ${}",
            order.notional_usd, max_notional
        ));
    }

    // Symbol allowlist (empty list allows everything)
    let base = crate::domain::symbols::to_base(&order.symbol);
    let allowlist_ok =
        ctx.config.symbol_allowlist.is_empty() || ctx.config.symbol_allowlist.contains(&base);
    checks.push(json!({
        "check": "symbol_allowlist",
        "passed": allowlist_ok,
        "symbol": base,
    }));
    if !allowlist_ok {
        warnings.push(format!("{} is not on the symbol allowlist", base));
    }

    // Position sizing sanity: tiny orders still above zero
    let size_ok = order.notional_usd > Decimal::ZERO;
    checks.push(json!({
        "check": "positive_notional",
        "passed": size_ok,
    }));

    let approved = notional_ok && allowlist_ok && size_ok;
    let risk_level = if approved { "LOW" } else { "HIGH" };

    Ok(json!({
        "risk_analysis": {
            "approved": approved,
            "risk_level": risk_level,
            "checks": checks,
            "warnings": warnings,
        },
        "symbol": order.symbol,
        "side": order.side.to_string(),
        "notional_usd": order.notional_usd,
        "safe_summary": format!(
            "Risk review {} for {} {} ${}",
            if approved { "passed" } else { "flagged issues" },
            order.side,
            order.symbol,
            order.notional_usd
        ),
    }))
}
