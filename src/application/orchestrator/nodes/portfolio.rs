//! Portfolio analysis node.
//!
//! Fetches live holdings and prices (or reads the paper ledger), computes
//! allocation, risk metrics, trading behavior and recommendations, and
//! emits a `PortfolioBrief`. Every number in the brief traces back to a
//! recorded tool call. A brief that cannot be computed carries a failure
//! sub-object; it never invents holdings.

use crate::application::orchestrator::NodeContext;
use crate::domain::portfolio::{
    AllocationRow, BriefFailure, EvidenceRefs, Holding, PortfolioBrief, PortfolioRecommendation,
    RiskSnapshot, TradeSummary,
};
use crate::domain::symbols::to_product_id;
use crate::domain::types::{Candle, ExecutionMode, Granularity};
use crate::infrastructure::audit::{ToolCallRecord, ToolCallStatus};
use crate::infrastructure::paper::PaperExecution;
use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

const ORDER_HISTORY_WINDOW_DAYS: u32 = 30;
const MAX_CONCURRENT_PRICE_FETCHES: usize = 10;

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
        .context("Portfolio node: run not found")?;

    let brief = match run.execution_mode {
        ExecutionMode::Live => execute_live(ctx, run_id, node_id, tenant_id).await?,
        _ => execute_paper(ctx, run_id, node_id, tenant_id).await?,
    };

    // Freeze the brief for REPLAY determinism and expose it as an artifact
    ctx.portfolio
        .save_analysis_snapshot(run_id, tenant_id, &brief)
        .await?;
    ctx.artifacts
        .insert(run_id, "portfolio", "portfolio_brief", &serde_json::to_value(&brief)?)
        .await?;

    let success = brief.failure.is_none();
    Ok(json!({
        "portfolio_brief": brief,
        "success": success,
        "safe_summary": format!(
            "Portfolio analysis complete. Total value: ${}",
            brief.total_value_usd.round_dp(2)
        ),
    }))
}

async fn execute_live(
    ctx: &NodeContext,
    run_id: &str,
    node_id: &str,
    tenant_id: &str,
) -> Result<PortfolioBrief> {
    let Some(provider) = ctx.live_execution.clone() else {
        return Ok(PortfolioBrief::failed(
            ExecutionMode::Live,
            BriefFailure {
                error_code: "NO_CREDENTIALS".to_string(),
                error_message: "LIVE portfolio analysis needs Coinbase API credentials".to_string(),
                recoverable: true,
                suggested_action: "Configure COINBASE_API_KEY_NAME and COINBASE_API_PRIVATE_KEY"
                    .to_string(),
            },
        ));
    };

    let mut evidence = EvidenceRefs::default();
    let mut warnings: Vec<String> = Vec::new();

    // 1. Balances (non-zero only)
    let started = std::time::Instant::now();
    let balances = match provider.get_balances(tenant_id).await {
        Ok(balances) => {
            evidence.accounts_call_id = ctx
                .tool_log
                .record_best_effort(ToolCallRecord {
                    run_id,
                    node_id: Some(node_id),
                    tool_name: "get_balances",
                    mcp_server: provider.name(),
                    request: json!({"tenant_id": tenant_id}),
                    response: Some(json!({"accounts_count": balances.len()})),
                    status: ToolCallStatus::Success,
                    latency_ms: started.elapsed().as_millis() as i64,
                    http_status: Some(200),
                    error_text: None,
                    attempt: 1,
                })
                .await;
            balances
        }
        Err(e) => {
            warn!("Live balance fetch failed for portfolio analysis: {}", e);
            return Ok(PortfolioBrief::failed(
                ExecutionMode::Live,
                BriefFailure {
                    error_code: "BALANCE_FETCH_FAILED".to_string(),
                    error_message: format!("Could not fetch Coinbase balances: {}", e),
                    recoverable: true,
                    suggested_action: "Retry shortly; check API key permissions".to_string(),
                },
            ));
        }
    };

    // Account identifiers are hashed before anything is persisted
    ctx.artifacts
        .insert(run_id, "portfolio", "holdings_raw", &holdings_raw_artifact(&balances))
        .await?;

    // 2. Prices and volatility proxies, parallel with bounded concurrency
    let assets: Vec<String> = balances
        .keys()
        .filter(|symbol| symbol.as_str() != "USD")
        .cloned()
        .collect();
    let (prices, candle_map, price_call_ids) =
        fetch_prices(ctx, run_id, node_id, &assets).await;
    evidence.prices_call_ids = price_call_ids;

    // 3. Order history for the trade summary
    let started = std::time::Instant::now();
    let order_history = match provider
        .get_recent_orders(tenant_id, ORDER_HISTORY_WINDOW_DAYS)
        .await
    {
        Ok(orders) => {
            evidence.orders_call_id = ctx
                .tool_log
                .record_best_effort(ToolCallRecord {
                    run_id,
                    node_id: Some(node_id),
                    tool_name: "get_orders",
                    mcp_server: provider.name(),
                    request: json!({"window_days": ORDER_HISTORY_WINDOW_DAYS}),
                    response: Some(json!({"orders_count": orders.len()})),
                    status: ToolCallStatus::Success,
                    latency_ms: started.elapsed().as_millis() as i64,
                    http_status: Some(200),
                    error_text: None,
                    attempt: 1,
                })
                .await;
            orders
        }
        Err(e) => {
            warnings.push("Order history unavailable; trade summary omitted".to_string());
            warn!("Order history fetch failed: {}", e);
            Vec::new()
        }
    };

    Ok(build_brief(
        ExecutionMode::Live,
        &balances,
        &prices,
        &candle_map,
        &order_history,
        evidence,
        warnings,
    ))
}

async fn execute_paper(
    ctx: &NodeContext,
    run_id: &str,
    node_id: &str,
    tenant_id: &str,
) -> Result<PortfolioBrief> {
    let mut warnings: Vec<String> = Vec::new();

    let balances = match ctx.portfolio.latest_snapshot(tenant_id).await? {
        Some(snapshot) => snapshot.balances,
        None => {
            info!("No paper snapshot for {}, seeding deterministic mock balances", tenant_id);
            warnings.push("No trading history yet; showing the seeded paper portfolio".to_string());
            PaperExecution::seed_balances()
        }
    };

    let assets: Vec<String> = balances
        .keys()
        .filter(|symbol| symbol.as_str() != "USD")
        .cloned()
        .collect();
    let (prices, candle_map, price_call_ids) =
        fetch_prices(ctx, run_id, node_id, &assets).await;

    let mut evidence = EvidenceRefs::default();
    evidence.prices_call_ids = price_call_ids;

    let order_history: Vec<serde_json::Value> = ctx
        .orders
        .list_recent_for_tenant(tenant_id, 200)
        .await?
        .into_iter()
        .map(|o| {
            json!({
                "product_id": o.symbol,
                "side": o.side.to_string(),
                "filled_value": o.notional_usd.to_string(),
            })
        })
        .collect();

    Ok(build_brief(
        ExecutionMode::Paper,
        &balances,
        &prices,
        &candle_map,
        &order_history,
        evidence,
        warnings,
    ))
}

/// Fetch 24h hourly candles per asset, returning current prices, candle
/// series for volatility, and the audit row ids for evidence refs.
async fn fetch_prices(
    ctx: &NodeContext,
    run_id: &str,
    node_id: &str,
    assets: &[String],
) -> (
    HashMap<String, Decimal>,
    HashMap<String, Vec<Candle>>,
    Vec<String>,
) {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PRICE_FETCHES));
    let end = Utc::now();
    let start = end - Duration::hours(24);

    let mut tasks = Vec::with_capacity(assets.len());
    for asset in assets {
        let provider = ctx.crypto_data.clone();
        let semaphore = semaphore.clone();
        let asset = asset.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            let started = std::time::Instant::now();
            let result = provider
                .get_candles(&to_product_id(&asset), Granularity::OneHour, start, end)
                .await;
            (asset, result, started.elapsed().as_millis() as i64)
        }));
    }

    let mut prices = HashMap::new();
    let mut candle_map = HashMap::new();
    let mut call_ids = Vec::new();

    for task in futures::future::join_all(tasks).await {
        let Ok((asset, result, latency_ms)) = task else {
            continue;
        };
        match result {
            Ok(candles) if !candles.is_empty() => {
                let call_id = ctx
                    .tool_log
                    .record_best_effort(ToolCallRecord {
                        run_id,
                        node_id: Some(node_id),
                        tool_name: "fetch_candles",
                        mcp_server: ctx.crypto_data.name(),
                        request: json!({"product_id": to_product_id(&asset), "granularity": "1h"}),
                        response: Some(json!({"candles_count": candles.len()})),
                        status: ToolCallStatus::Success,
                        latency_ms,
                        http_status: Some(200),
                        error_text: None,
                        attempt: 1,
                    })
                    .await;
                if let Some(id) = call_id {
                    call_ids.push(id);
                }
                prices.insert(asset.clone(), candles[candles.len() - 1].close);
                candle_map.insert(asset, candles);
            }
            Ok(_) => {
                warn!("No candles for {}, price unknown", asset);
            }
            Err(e) => {
                warn!("Price fetch failed for {}: {}", asset, e);
            }
        }
    }

    (prices, candle_map, call_ids)
}

/// Accounts are fingerprinted: a SHA-256 prefix over the sorted identifiers
/// plus short per-asset hints. Raw identifiers never reach the artifact.
fn holdings_raw_artifact(balances: &HashMap<String, Decimal>) -> serde_json::Value {
    let mut symbols: Vec<&String> = balances.keys().collect();
    symbols.sort();

    let mut hasher = Sha256::new();
    for symbol in &symbols {
        hasher.update(symbol.as_bytes());
    }
    let fingerprint = hex::encode(hasher.finalize())[..16].to_string();

    let holdings: Vec<serde_json::Value> = symbols
        .iter()
        .map(|symbol| {
            let digest = hex::encode(Sha256::digest(symbol.as_bytes()));
            json!({
                "account_hint": format!("{}...{}", &digest[..4], &digest[digest.len() - 4..]),
                "asset": symbol,
                "qty": balances[*symbol],
            })
        })
        .collect();

    json!({
        "accounts_fingerprint": fingerprint,
        "holdings": holdings,
        "captured_at": Utc::now().to_rfc3339(),
    })
}

fn build_brief(
    mode: ExecutionMode,
    balances: &HashMap<String, Decimal>,
    prices: &HashMap<String, Decimal>,
    candle_map: &HashMap<String, Vec<Candle>>,
    order_history: &[serde_json::Value],
    evidence: EvidenceRefs,
    mut warnings: Vec<String>,
) -> PortfolioBrief {
    let cash = balances.get("USD").copied().unwrap_or(Decimal::ZERO);

    let mut holdings: Vec<Holding> = balances
        .iter()
        .filter(|(symbol, qty)| symbol.as_str() != "USD" && **qty > Decimal::ZERO)
        .map(|(symbol, qty)| {
            let price = prices.get(symbol).copied();
            let usd_value = price.map(|p| *qty * p).unwrap_or(Decimal::ZERO);
            if price.is_none() {
                warnings.push(format!("No live price for {}; valued at $0", symbol));
            }
            Holding {
                asset_symbol: symbol.clone(),
                qty: *qty,
                usd_value,
                current_price: price,
            }
        })
        .collect();
    holdings.sort_by(|a, b| b.usd_value.cmp(&a.usd_value));

    let total_value: Decimal = holdings.iter().map(|h| h.usd_value).sum::<Decimal>() + cash;

    // Allocation: holdings sorted desc, USD cash appended
    let mut allocation: Vec<AllocationRow> = Vec::with_capacity(holdings.len() + 1);
    if total_value > Decimal::ZERO {
        for holding in &holdings {
            allocation.push(AllocationRow {
                asset_symbol: holding.asset_symbol.clone(),
                pct: (holding.usd_value / total_value * Decimal::new(100, 0))
                    .to_f64()
                    .unwrap_or(0.0),
            });
        }
        allocation.push(AllocationRow {
            asset_symbol: "USD".to_string(),
            pct: (cash / total_value * Decimal::new(100, 0)).to_f64().unwrap_or(0.0),
        });
    }

    let risk = compute_risk_metrics(&allocation, candle_map, total_value);
    let trade_summary = compute_trade_summary(order_history, ORDER_HISTORY_WINDOW_DAYS);
    let recommendations = generate_recommendations(&risk, trade_summary.as_ref());

    PortfolioBrief {
        mode,
        as_of: Utc::now(),
        total_value_usd: total_value,
        cash_usd: cash,
        holdings,
        allocation,
        risk,
        trade_summary,
        recommendations,
        warnings,
        evidence_refs: evidence,
        failure: None,
    }
}

fn compute_risk_metrics(
    allocation: &[AllocationRow],
    candle_map: &HashMap<String, Vec<Candle>>,
    total_value: Decimal,
) -> RiskSnapshot {
    if allocation.is_empty() || total_value <= Decimal::ZERO {
        return RiskSnapshot::unknown();
    }

    let mut non_cash: Vec<&AllocationRow> = allocation
        .iter()
        .filter(|a| a.asset_symbol != "USD")
        .collect();
    non_cash.sort_by(|a, b| b.pct.partial_cmp(&a.pct).unwrap_or(std::cmp::Ordering::Equal));

    let top1 = non_cash.first().map(|a| a.pct).unwrap_or(0.0);
    let top3: f64 = non_cash.iter().take(3).map(|a| a.pct).sum();

    // Volatility proxy: mean of per-asset std-dev of hourly returns
    let mut vols: Vec<f64> = Vec::new();
    for candles in candle_map.values() {
        if candles.len() < 2 {
            continue;
        }
        let mut returns = Vec::with_capacity(candles.len() - 1);
        for pair in candles.windows(2) {
            let prev = pair[0].close_f64();
            let curr = pair[1].close_f64();
            if prev > 0.0 {
                returns.push((curr - prev) / prev);
            }
        }
        if !returns.is_empty() {
            let mean = returns.iter().sum::<f64>() / returns.len() as f64;
            let variance =
                returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
            vols.push(variance.sqrt());
        }
    }
    let volatility_proxy = if vols.is_empty() {
        None
    } else {
        Some(vols.iter().sum::<f64>() / vols.len() as f64)
    };

    // Diversification: 1 - Herfindahl index over non-cash allocation
    let diversification_score = if non_cash.is_empty() {
        None
    } else {
        let hhi: f64 = non_cash.iter().map(|a| (a.pct / 100.0).powi(2)).sum();
        Some((1.0 - hhi).max(0.0))
    };

    let risk_level = if top1 >= 80.0 {
        "VERY_HIGH"
    } else if top1 >= 60.0 {
        "HIGH"
    } else if top1 >= 40.0 {
        "MEDIUM"
    } else {
        "LOW"
    };

    RiskSnapshot {
        concentration_pct_top1: top1,
        concentration_pct_top3: top3,
        volatility_proxy,
        diversification_score,
        risk_level: risk_level.to_string(),
    }
}

fn compute_trade_summary(orders: &[serde_json::Value], window_days: u32) -> Option<TradeSummary> {
    let total_trades = orders.len();
    let buys = orders
        .iter()
        .filter(|o| {
            o.get("side")
                .and_then(|s| s.as_str())
                .map(|s| s.eq_ignore_ascii_case("BUY"))
                .unwrap_or(false)
        })
        .count();
    let sells = total_trades - buys;

    let mut total_notional = Decimal::ZERO;
    let mut asset_counts: HashMap<String, usize> = HashMap::new();
    for order in orders {
        if let Some(value) = order.get("filled_value") {
            let parsed = value
                .as_str()
                .and_then(|s| s.parse::<Decimal>().ok())
                .or_else(|| value.as_f64().and_then(Decimal::from_f64));
            if let Some(v) = parsed {
                total_notional += v;
            }
        }
        if let Some(product_id) = order.get("product_id").and_then(|v| v.as_str()) {
            let asset = crate::domain::symbols::to_base(product_id);
            *asset_counts.entry(asset).or_default() += 1;
        }
    }

    let avg_trade = if total_trades > 0 {
        total_notional / Decimal::from(total_trades as u64)
    } else {
        Decimal::ZERO
    };

    let mut top_assets: Vec<(String, usize)> = asset_counts.into_iter().collect();
    top_assets.sort_by(|a, b| b.1.cmp(&a.1));

    Some(TradeSummary {
        window_days,
        total_trades,
        total_notional_usd: total_notional,
        avg_trade_usd: avg_trade,
        buys,
        sells,
        top_assets: top_assets.into_iter().take(5).map(|(a, _)| a).collect(),
    })
}

/// 1-4 recommendations keyed off fixed thresholds.
fn generate_recommendations(
    risk: &RiskSnapshot,
    trade_summary: Option<&TradeSummary>,
) -> Vec<PortfolioRecommendation> {
    let mut recommendations = Vec::new();

    if risk.concentration_pct_top1 >= 70.0 {
        recommendations.push(PortfolioRecommendation {
            category: "REBALANCING".to_string(),
            priority: "HIGH".to_string(),
            title: "High Concentration Risk".to_string(),
            description: format!(
                "Your portfolio has {:.1}% in a single asset. Consider diversifying to reduce risk.",
                risk.concentration_pct_top1
            ),
            action_required: true,
        });
    } else if risk.concentration_pct_top1 >= 50.0 {
        recommendations.push(PortfolioRecommendation {
            category: "REBALANCING".to_string(),
            priority: "MEDIUM".to_string(),
            title: "Moderate Concentration".to_string(),
            description: format!(
                "Consider spreading positions more evenly. Top asset is {:.1}% of portfolio.",
                risk.concentration_pct_top1
            ),
            action_required: false,
        });
    }

    if let Some(score) = risk.diversification_score
        && score < 0.3
    {
        recommendations.push(PortfolioRecommendation {
            category: "DIVERSIFICATION".to_string(),
            priority: "MEDIUM".to_string(),
            title: "Low Diversification".to_string(),
            description: "Portfolio is concentrated in few assets. Consider adding positions in different asset types.".to_string(),
            action_required: false,
        });
    }

    if let Some(summary) = trade_summary
        && summary.total_trades > 50
    {
        recommendations.push(PortfolioRecommendation {
            category: "POSITION_SIZING".to_string(),
            priority: "LOW".to_string(),
            title: "High Trading Frequency".to_string(),
            description: format!(
                "{} trades in {} days. High frequency may increase costs.",
                summary.total_trades, summary.window_days
            ),
            action_required: false,
        });
    }

    if let Some(vol) = risk.volatility_proxy
        && vol > 0.05
    {
        recommendations.push(PortfolioRecommendation {
            category: "RISK_CAP".to_string(),
            priority: "MEDIUM".to_string(),
            title: "High Volatility Exposure".to_string(),
            description: format!(
                "Portfolio shows elevated volatility ({:.2}%). Consider reducing position sizes.",
                vol * 100.0
            ),
            action_required: false,
        });
    }

    if recommendations.is_empty() {
        recommendations.push(PortfolioRecommendation {
            category: "OTHER".to_string(),
            priority: "LOW".to_string(),
            title: "Portfolio Looks Healthy".to_string(),
            description: "No immediate concerns identified. Continue monitoring.".to_string(),
            action_required: false,
        });
    }

    recommendations.truncate(4);
    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn balances(entries: &[(&str, Decimal)]) -> HashMap<String, Decimal> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_brief_allocation_sums_to_100() {
        let balances = balances(&[("USD", dec!(500)), ("BTC", dec!(0.1))]);
        let prices = HashMap::from([("BTC".to_string(), dec!(45000))]);
        let brief = build_brief(
            ExecutionMode::Paper,
            &balances,
            &prices,
            &HashMap::new(),
            &[],
            EvidenceRefs::default(),
            Vec::new(),
        );

        assert_eq!(brief.total_value_usd, dec!(5000));
        assert_eq!(brief.cash_usd, dec!(500));
        assert_eq!(brief.holdings.len(), 1);
        assert_eq!(brief.holdings[0].usd_value, dec!(4500));

        let pct_sum: f64 = brief.allocation.iter().map(|a| a.pct).sum();
        assert!((99.0..=101.0).contains(&pct_sum), "sum was {}", pct_sum);
        assert!(brief.failure.is_none());
    }

    #[test]
    fn test_risk_levels_by_concentration() {
        let alloc = |top1: f64| {
            vec![
                AllocationRow { asset_symbol: "BTC".to_string(), pct: top1 },
                AllocationRow { asset_symbol: "USD".to_string(), pct: 100.0 - top1 },
            ]
        };
        let candles = HashMap::new();
        assert_eq!(
            compute_risk_metrics(&alloc(85.0), &candles, dec!(1000)).risk_level,
            "VERY_HIGH"
        );
        assert_eq!(
            compute_risk_metrics(&alloc(65.0), &candles, dec!(1000)).risk_level,
            "HIGH"
        );
        assert_eq!(
            compute_risk_metrics(&alloc(45.0), &candles, dec!(1000)).risk_level,
            "MEDIUM"
        );
        assert_eq!(
            compute_risk_metrics(&alloc(20.0), &candles, dec!(1000)).risk_level,
            "LOW"
        );
    }

    #[test]
    fn test_concentration_recommendation_thresholds() {
        let risk = RiskSnapshot {
            concentration_pct_top1: 75.0,
            concentration_pct_top3: 90.0,
            volatility_proxy: None,
            diversification_score: Some(0.5),
            risk_level: "HIGH".to_string(),
        };
        let recs = generate_recommendations(&risk, None);
        assert_eq!(recs[0].priority, "HIGH");
        assert!(recs[0].action_required);
    }

    #[test]
    fn test_healthy_portfolio_gets_one_recommendation() {
        let risk = RiskSnapshot {
            concentration_pct_top1: 20.0,
            concentration_pct_top3: 50.0,
            volatility_proxy: Some(0.01),
            diversification_score: Some(0.8),
            risk_level: "LOW".to_string(),
        };
        let recs = generate_recommendations(&risk, None);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].title, "Portfolio Looks Healthy");
    }

    #[test]
    fn test_trade_summary_counts() {
        let orders = vec![
            json!({"product_id": "BTC-USD", "side": "BUY", "filled_value": "10"}),
            json!({"product_id": "BTC-USD", "side": "SELL", "filled_value": "5"}),
            json!({"product_id": "ETH-USD", "side": "BUY", "filled_value": "20"}),
        ];
        let summary = compute_trade_summary(&orders, 30).unwrap();
        assert_eq!(summary.total_trades, 3);
        assert_eq!(summary.buys, 2);
        assert_eq!(summary.sells, 1);
        assert_eq!(summary.total_notional_usd, dec!(35));
        assert_eq!(summary.top_assets[0], "BTC");
    }

    #[test]
    fn test_holdings_raw_has_no_raw_identifiers() {
        let balances = balances(&[("BTC", dec!(0.5)), ("ETH", dec!(5))]);
        let artifact = holdings_raw_artifact(&balances);
        assert_eq!(artifact["accounts_fingerprint"].as_str().unwrap().len(), 16);
        for holding in artifact["holdings"].as_array().unwrap() {
            let hint = holding["account_hint"].as_str().unwrap();
            assert!(hint.contains("..."));
            assert_eq!(hint.len(), 11); // 4 + "..." + 4
        }
    }
}
