//! Post-trade node: fills, balances, positions, and the portfolio
//! snapshot that freezes the run's ending state.

use crate::application::orchestrator::NodeContext;
use crate::domain::symbols::to_product_id;
use crate::domain::types::{AssetClass, ExecutionMode};
use crate::infrastructure::audit::{ToolCallRecord, ToolCallStatus};
use crate::infrastructure::paper::PaperExecution;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
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
        .context("Post-trade node: run not found")?;

    // ASSISTED_LIVE / stock runs only produced a ticket; there are no
    // fills or balances to reconcile.
    if run.execution_mode == ExecutionMode::AssistedLive || run.asset_class == AssetClass::Stock {
        info!(
            "PostTradeNode: ASSISTED_LIVE mode - skipping balance/fills fetching for run {}",
            run_id
        );
        let tickets = ctx.tickets.list_for_run(run_id).await?;
        return Ok(json!({
            "execution_mode": "ASSISTED_LIVE",
            "asset_class": run.asset_class.to_string(),
            "order_placed": false,
            "tickets": tickets
                .iter()
                .map(|t| json!({
                    "ticket_id": t.id,
                    "symbol": t.symbol,
                    "side": t.side.to_string(),
                    "notional_usd": t.notional_usd,
                    "status": t.status.to_string(),
                }))
                .collect::<Vec<_>>(),
            "safe_summary": format!(
                "Order ticket created for manual execution ({} ticket(s))",
                tickets.len()
            ),
        }));
    }

    let orders = ctx.orders.list_for_run(run_id).await?;
    let mut fills_count = 0usize;
    let mut balances: HashMap<String, Decimal>;
    let positions: HashMap<String, Decimal>;

    if run.execution_mode == ExecutionMode::Live {
        let provider = ctx
            .live_execution
            .clone()
            .context("Post-trade node: LIVE run without live provider")?;

        for order in &orders {
            let started = std::time::Instant::now();
            match provider.get_fills(&order.order_id).await {
                Ok(fills) => {
                    fills_count += fills.len();
                    if let Some(first) = fills.first() {
                        let total_qty: Decimal = fills.iter().map(|f| f.qty).sum();
                        let total_fees: Decimal = fills.iter().map(|f| f.fee).sum();
                        ctx.orders
                            .update_fill(&order.order_id, "FILLED", total_qty, first.price, total_fees)
                            .await?;
                    }
                    ctx.tool_log
                        .record_best_effort(ToolCallRecord {
                            run_id,
                            node_id: Some(node_id),
                            tool_name: "get_fills",
                            mcp_server: provider.name(),
                            request: json!({"order_id": order.order_id}),
                            response: Some(json!({"fills_count": fills.len()})),
                            status: ToolCallStatus::Success,
                            latency_ms: started.elapsed().as_millis() as i64,
                            http_status: Some(200),
                            error_text: None,
                            attempt: 1,
                        })
                        .await;
                }
                Err(e) => warn!("Failed to fetch fills for order {}: {}", order.order_id, e),
            }
        }

        match provider.get_balances(tenant_id).await {
            Ok(live_balances) => {
                balances = live_balances;
                positions = balances
                    .iter()
                    .filter(|(symbol, _)| symbol.as_str() != "USD")
                    .map(|(symbol, qty)| (symbol.clone(), *qty))
                    .collect();
            }
            Err(e) => {
                warn!("Live balance fetch failed, falling back to last snapshot: {}", e);
                match ctx.portfolio.latest_snapshot(tenant_id).await? {
                    Some(snapshot) => {
                        balances = snapshot.balances;
                        positions = snapshot.positions;
                    }
                    None => {
                        balances = HashMap::from([("USD".to_string(), Decimal::new(100, 0))]);
                        positions = HashMap::new();
                    }
                }
            }
        }
    } else {
        // PAPER: the ledger lives in portfolio_snapshots
        match ctx.portfolio.latest_snapshot(tenant_id).await? {
            Some(snapshot) => {
                balances = snapshot.balances;
                positions = snapshot.positions;
            }
            None => {
                balances = PaperExecution::seed_balances();
                positions = balances
                    .iter()
                    .filter(|(symbol, _)| symbol.as_str() != "USD")
                    .map(|(symbol, qty)| (symbol.clone(), *qty))
                    .collect();
            }
        }

        // Backfill fill columns on paper orders that predate the fill-aware
        // paper provider.
        for order in &orders {
            if order.filled_qty.is_none() {
                let price = ctx
                    .crypto_data
                    .get_price(&order.symbol)
                    .await
                    .unwrap_or(Decimal::ZERO);
                let qty = if price > Decimal::ZERO {
                    order.notional_usd / price
                } else {
                    Decimal::ZERO
                };
                ctx.orders
                    .update_fill(&order.order_id, "FILLED", qty, price, Decimal::ZERO)
                    .await?;
            }
        }
    }

    // Total portfolio value at current prices
    let provider = ctx.market_data_for(run.asset_class);
    let mut total_value = balances.get("USD").copied().unwrap_or(Decimal::ZERO);
    for (symbol, qty) in &positions {
        let product_id = to_product_id(symbol);
        match provider.get_price(&product_id).await {
            Ok(price) => total_value += *qty * price,
            Err(_) => {
                // Fallback: last stored close
                if let Some(close) = ctx.candles.latest_close(&product_id).await? {
                    total_value += *qty * close;
                }
            }
        }
    }

    let snapshot_id = ctx
        .portfolio
        .save_snapshot(Some(run_id), tenant_id, &balances, &positions, total_value)
        .await?;

    Ok(json!({
        "snapshot_id": snapshot_id,
        "balances": balances,
        "positions": positions,
        "total_value_usd": total_value,
        "fills_count": fills_count,
        "orders_count": orders.len(),
        "execution_mode": run.execution_mode.to_string(),
        "safe_summary": format!(
            "Post-trade snapshot {}: total value ${}, {} order(s)",
            snapshot_id,
            total_value.round_dp(2),
            orders.len()
        ),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions_derived_from_balances_exclude_cash() {
        let balances = HashMap::from([
            ("USD".to_string(), Decimal::new(1000, 0)),
            ("BTC".to_string(), Decimal::new(5, 1)),
        ]);
        let positions: HashMap<String, Decimal> = balances
            .iter()
            .filter(|(symbol, _)| symbol.as_str() != "USD")
            .map(|(symbol, qty)| (symbol.clone(), *qty))
            .collect();
        assert_eq!(positions.len(), 1);
        assert!(positions.contains_key("BTC"));
    }
}
