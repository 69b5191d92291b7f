//! Policy node: the last word before execution. Emits a PolicyEvent with
//! ALLOWED, BLOCKED, or REQUIRES_APPROVAL. BLOCKED is a hard stop; the
//! execution node refuses to place orders for a blocked run.

use crate::application::orchestrator::NodeContext;
use crate::domain::ids::new_id;
use crate::domain::types::{ExecutionMode, PolicyDecision};
use anyhow::{Context, Result};
use serde_json::json;
use sqlx::Row;
use tracing::warn;

pub async fn execute(
    ctx: &NodeContext,
    run_id: &str,
    _node_id: &str,
    tenant_id: &str,
) -> Result<serde_json::Value> {
    let run = ctx
        .runs
        .get(run_id)
        .await?
        .context("Policy node: run not found")?;
    let proposal = sqlx::query("SELECT trade_proposal_json FROM runs WHERE run_id = ?")
        .bind(run_id)
        .fetch_optional(&ctx.database.pool)
        .await?
        .and_then(|r| r.get::<Option<String>, _>("trade_proposal_json"))
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
        .unwrap_or(json!({}));

    let mut rules_fired: Vec<serde_json::Value> = Vec::new();
    let mut decision = PolicyDecision::Allowed;

    // Tenant kill switch blocks all new orders
    let kill_switch: bool = sqlx::query("SELECT kill_switch_enabled FROM tenants WHERE tenant_id = ?")
        .bind(tenant_id)
        .fetch_optional(&ctx.database.pool)
        .await?
        .map(|r| r.get("kill_switch_enabled"))
        .unwrap_or(false);
    if kill_switch {
        decision = PolicyDecision::Blocked;
        rules_fired.push(json!({"rule": "tenant_kill_switch", "decision": "BLOCKED"}));
    }

    // Global LIVE kill switch
    if run.execution_mode == ExecutionMode::Live && ctx.config.trading_disable_live {
        decision = PolicyDecision::Blocked;
        rules_fired.push(json!({"rule": "trading_disable_live", "decision": "BLOCKED"}));
    }

    // Risk review findings block execution
    let risk_approved = proposal
        .pointer("/risk_analysis/approved")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    if !risk_approved {
        decision = PolicyDecision::Blocked;
        rules_fired.push(json!({"rule": "risk_review_failed", "decision": "BLOCKED"}));
    }

    // LIVE orders without a verified, locked product need human eyes
    if decision == PolicyDecision::Allowed
        && run.execution_mode == ExecutionMode::Live
        && (!run.tradability_verified || run.locked_product_id.is_none())
    {
        decision = PolicyDecision::RequiresApproval;
        rules_fired.push(json!({"rule": "live_requires_verified_product", "decision": "REQUIRES_APPROVAL"}));
    }

    if rules_fired.is_empty() {
        rules_fired.push(json!({"rule": "default_allow", "decision": "ALLOWED"}));
    }

    if decision == PolicyDecision::Blocked {
        warn!("policy_blocked: run={} rules={:?}", run_id, rules_fired);
    }

    sqlx::query(
        "INSERT INTO policy_events (id, run_id, decision, rules_fired_json, ts) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(new_id("pol_"))
    .bind(run_id)
    .bind(decision.to_string())
    .bind(serde_json::to_string(&rules_fired)?)
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(&ctx.database.pool)
    .await?;

    Ok(json!({
        "decision": decision.to_string(),
        "rules_fired": rules_fired,
        "safe_summary": format!("Policy check: {}", decision),
    }))
}
