//! Execution node: places orders, creates trade tickets, or refuses.
//!
//! The policy decision is read back from the policy_events row; BLOCKED
//! means zero orders, full stop. LIVE crypto additionally requires the
//! tradability-verified flag and the locked product id sealed at staging.

use crate::application::orchestrator::NodeContext;
use crate::domain::ids::new_id;
use crate::domain::ports::{ExecutionProvider, OrderRequest};
use crate::domain::symbols::to_product_id;
use crate::domain::types::{AssetClass, ExecutionMode, Order, OrderSide};
use crate::infrastructure::audit::{ToolCallRecord, ToolCallStatus};
use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::Row;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

pub async fn execute(
    ctx: &NodeContext,
    run_id: &str,
    node_id: &str,
    tenant_id: &str,
) -> Result<serde_json::Value> {
    let run = ctx
        .runs
        .get(run_id)
        .await?
        .context("Execution node: run not found")?;

    // Policy gate: BLOCKED is a hard stop, not an error.
    let policy_decision: Option<String> =
        sqlx::query("SELECT decision FROM policy_events WHERE run_id = ? ORDER BY ts DESC LIMIT 1")
            .bind(run_id)
            .fetch_optional(&ctx.database.pool)
            .await?
            .map(|r| r.get("decision"));
    if policy_decision.as_deref() == Some("BLOCKED") {
        warn!("execution_blocked_by_policy: run={}", run_id);
        return Ok(json!({
            "order_placed": false,
            "blocked": true,
            "safe_summary": "Execution blocked by policy. No orders were placed.",
        }));
    }

    if run.execution_mode == ExecutionMode::Replay {
        return Ok(json!({
            "order_placed": false,
            "replayed": true,
            "safe_summary": "Replay run: no orders placed, receipts read from source artifacts.",
        }));
    }

    let plan = ctx
        .runs
        .get_execution_plan(run_id)
        .await?
        .context("Execution node: no execution plan on run")?;
    let selected = plan
        .selected_order
        .as_ref()
        .context("Execution node: no selected order on plan")?;

    // The locked product id sealed at staging wins over re-derivation.
    let product_id = run
        .locked_product_id
        .clone()
        .unwrap_or_else(|| to_product_id(&selected.symbol));

    // ASSISTED_LIVE and stock orders become manual tickets
    if run.execution_mode == ExecutionMode::AssistedLive || run.asset_class == AssetClass::Stock {
        let ticket_id = ctx
            .tickets
            .create(run_id, tenant_id, &product_id, selected.side, selected.notional_usd)
            .await?;
        info!(
            "execution_ticket_created: run={} ticket={} {} {} ${}",
            run_id, ticket_id, selected.side, product_id, selected.notional_usd
        );
        return Ok(json!({
            "order_placed": false,
            "ticket_id": ticket_id,
            "safe_summary": format!(
                "Order ticket {} created for manual execution: {} {} ${}",
                ticket_id, selected.side, product_id, selected.notional_usd
            ),
        }));
    }

    let provider: Arc<dyn ExecutionProvider> = match run.execution_mode {
        ExecutionMode::Live => {
            // Invariant: LIVE orders only on verified products
            if !run.tradability_verified {
                let error = json!({
                    "error_code": "TRADABILITY_UNVERIFIED",
                    "message": format!("Refusing LIVE order: {} tradability not verified", product_id),
                });
                ctx.artifacts
                    .insert(run_id, "execution", "execution_error", &error)
                    .await?;
                ctx.runs
                    .mark_failed(run_id, "TRADABILITY_UNVERIFIED", "LIVE order on unverified product")
                    .await?;
                anyhow::bail!("LIVE order refused: tradability not verified for {}", product_id);
            }
            ctx.live_execution
                .clone()
                .context("Execution node: LIVE mode without live credentials")?
        }
        _ => ctx.paper_execution.clone(),
    };

    let mut orders_placed: Vec<serde_json::Value> = Vec::new();

    // Auto-sell first when the proposal staged one (funds recycling)
    let metadata = ctx.runs.get_metadata(run_id).await?.unwrap_or(json!({}));
    if let Some(auto_sell) = metadata.get("auto_sell").filter(|v| !v.is_null()) {
        let sell_product = auto_sell
            .get("sell_product_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let sell_amount = auto_sell
            .get("sell_amount_usd")
            .and_then(|v| v.as_str().map(String::from).or_else(|| v.as_f64().map(|f| f.to_string())))
            .and_then(|s| Decimal::from_str(&s).ok())
            .unwrap_or(Decimal::ZERO);
        if !sell_product.is_empty() && sell_amount > Decimal::ZERO {
            let receipt = place_and_record(
                ctx,
                provider.as_ref(),
                run_id,
                node_id,
                tenant_id,
                &sell_product,
                OrderSide::Sell,
                sell_amount,
            )
            .await?;
            orders_placed.push(receipt);
        }
    }

    let receipt = place_and_record(
        ctx,
        provider.as_ref(),
        run_id,
        node_id,
        tenant_id,
        &product_id,
        selected.side,
        selected.notional_usd,
    )
    .await?;
    orders_placed.push(receipt);

    ctx.artifacts
        .insert(
            run_id,
            "execution",
            "trade_receipt",
            &json!({
                "orders": orders_placed,
                "execution_mode": run.execution_mode.to_string(),
                "executed_at": Utc::now().to_rfc3339(),
            }),
        )
        .await?;

    Ok(json!({
        "order_placed": true,
        "orders": orders_placed,
        "execution_mode": run.execution_mode.to_string(),
        "safe_summary": format!(
            "Placed {} order(s): {} {} ${} in {} mode",
            orders_placed.len(),
            selected.side,
            product_id,
            selected.notional_usd,
            run.execution_mode
        ),
    }))
}

#[allow(clippy::too_many_arguments)]
async fn place_and_record(
    ctx: &NodeContext,
    provider: &dyn ExecutionProvider,
    run_id: &str,
    node_id: &str,
    tenant_id: &str,
    product_id: &str,
    side: OrderSide,
    notional_usd: Decimal,
) -> Result<serde_json::Value> {
    let client_order_id = new_id("cli_");
    let request = OrderRequest {
        client_order_id: client_order_id.clone(),
        product_id: product_id.to_string(),
        side,
        notional_usd,
    };

    let started = std::time::Instant::now();
    let result = provider.place_market_order(&request).await;
    let latency_ms = started.elapsed().as_millis() as i64;

    match result {
        Ok(ack) => {
            ctx.tool_log
                .record_best_effort(ToolCallRecord {
                    run_id,
                    node_id: Some(node_id),
                    tool_name: "place_order",
                    mcp_server: provider.name(),
                    request: serde_json::to_value(&request)?,
                    response: Some(json!({
                        "order_id": ack.broker_order_id,
                        "status": ack.status,
                    })),
                    status: ToolCallStatus::Success,
                    latency_ms,
                    http_status: Some(200),
                    error_text: None,
                    attempt: 1,
                })
                .await;

            let order = Order {
                order_id: ack.broker_order_id.clone(),
                run_id: run_id.to_string(),
                tenant_id: tenant_id.to_string(),
                symbol: product_id.to_string(),
                side,
                notional_usd,
                status: ack.status.clone(),
                filled_qty: ack.filled_qty,
                avg_fill_price: ack.avg_fill_price,
                fees: ack.fees,
                client_order_id,
                created_at: Utc::now(),
            };
            ctx.orders.insert(&order).await?;

            info!(
                "order_placed: run={} order={} {} {} ${} status={}",
                run_id, order.order_id, side, product_id, notional_usd, order.status
            );
            Ok(json!({
                "order_id": order.order_id,
                "client_order_id": order.client_order_id,
                "symbol": product_id,
                "side": side.to_string(),
                "notional_usd": notional_usd,
                "status": order.status,
                "filled_qty": order.filled_qty,
                "avg_fill_price": order.avg_fill_price,
            }))
        }
        Err(e) => {
            ctx.tool_log
                .record_best_effort(ToolCallRecord {
                    run_id,
                    node_id: Some(node_id),
                    tool_name: "place_order",
                    mcp_server: provider.name(),
                    request: serde_json::to_value(&request)?,
                    response: None,
                    status: ToolCallStatus::Failed,
                    latency_ms,
                    http_status: None,
                    error_text: Some(e.to_string()),
                    attempt: 1,
                })
                .await;
            let error = json!({
                "error_code": "ORDER_PLACEMENT_FAILED",
                "message": e.to_string(),
                "symbol": product_id,
                "side": side.to_string(),
                "notional_usd": notional_usd,
            });
            ctx.artifacts
                .insert(run_id, "execution", "execution_error", &error)
                .await?;
            ctx.runs
                .mark_failed(run_id, "ORDER_PLACEMENT_FAILED", &e.to_string())
                .await?;
            Err(e).context("Order placement failed")
        }
    }
}
