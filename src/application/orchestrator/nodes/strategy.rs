//! Strategy node: score and rank the universe, select the top asset, and
//! seal it into the run's execution plan.
//!
//! Consumes the research node's financial_brief when present to avoid
//! refetching; falls back to its own candle fetches otherwise.

use crate::application::orchestrator::NodeContext;
use crate::domain::plan::{DecisionTraceEntry, RankingRow, SelectedOrder, StrategyResult};
use crate::domain::types::{Candle, Granularity};
use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde_json::json;
use std::collections::HashMap;
use tracing::{info, warn};

/// Percent-style fractional return over the series.
pub fn compute_returns(candles: &[Candle]) -> f64 {
    crate::domain::types::compute_return_pct(candles) / 100.0
}

/// Mean per-candle return over its standard deviation. Zero when the
/// series is flat.
pub fn compute_sharpe_proxy(candles: &[Candle]) -> f64 {
    if candles.len() < 3 {
        return 0.0;
    }
    let mut returns = Vec::with_capacity(candles.len() - 1);
    for pair in candles.windows(2) {
        let prev = pair[0].close_f64();
        let curr = pair[1].close_f64();
        if prev > 0.0 {
            returns.push((curr - prev) / prev);
        }
    }
    if returns.is_empty() {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    let std_dev = variance.sqrt();
    if std_dev > 0.0 { mean / std_dev } else { 0.0 }
}

/// Return over the second half of the window: rewards assets still moving.
pub fn compute_momentum(candles: &[Candle]) -> f64 {
    if candles.len() < 4 {
        return compute_returns(candles);
    }
    let mid = candles.len() / 2;
    compute_returns(&candles[mid..])
}

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
        .context("Strategy node: run not found")?;
    let mut plan = ctx
        .runs
        .get_execution_plan(run_id)
        .await?
        .context("Strategy node: no execution plan on run")?;

    let metric = plan.strategy_spec.metric.clone();
    let window = plan.strategy_spec.window.clone();
    let universe = plan.strategy_spec.universe.clone();
    let lookback_hours = plan.strategy_spec.lookback_hours;

    let mut rankings: Vec<RankingRow> = Vec::new();
    let mut used_financial_brief = false;

    // Prefer the research node's pre-ranked brief
    if let Some(brief) = ctx.artifacts.get(run_id, "financial_brief").await?
        && let Some(ranked_assets) = brief.get("ranked_assets").and_then(|v| v.as_array())
        && !ranked_assets.is_empty()
    {
        for asset in ranked_assets {
            let Some(product_id) = asset.get("product_id").and_then(|v| v.as_str()) else {
                continue;
            };
            rankings.push(RankingRow {
                symbol: product_id.to_string(),
                score: asset.get("return_pct").and_then(|v| v.as_f64()).unwrap_or(0.0),
                volume_proxy: 0.0,
                candles_count: asset
                    .get("candles_count")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as usize,
                first_price: asset.get("first_open").and_then(|v| v.as_f64()).unwrap_or(0.0),
                last_price: asset.get("last_price").and_then(|v| v.as_f64()).unwrap_or(0.0),
            });
        }
        used_financial_brief = true;
        info!(
            "Strategy consuming financial_brief: {} pre-ranked assets",
            rankings.len()
        );
    }

    // Fallback: fetch and score independently
    let mut candles_by_symbol: HashMap<String, Vec<Candle>> = HashMap::new();
    if !used_financial_brief {
        let provider = ctx.market_data_for(run.asset_class);
        let granularity = if lookback_hours <= 168.0 {
            Granularity::OneHour
        } else {
            Granularity::OneDay
        };
        let end_time = Utc::now();
        let buffer_hours = (lookback_hours * 1.25).max(lookback_hours + 12.0);
        let start_time = end_time - Duration::seconds((buffer_hours * 3600.0) as i64);
        let min_candles = if granularity == Granularity::OneHour {
            ((lookback_hours * 0.75) as usize).max(2)
        } else {
            2
        };

        for symbol in &universe {
            match provider
                .get_candles(symbol, granularity, start_time, end_time)
                .await
            {
                Ok(candles) => {
                    ctx.candles
                        .save_candles(symbol, granularity.label(), &candles)
                        .await?;
                    ctx.candles
                        .save_batch(
                            run_id,
                            node_id,
                            symbol,
                            &window,
                            &candles,
                            &json!({
                                "start_time": start_time.to_rfc3339(),
                                "end_time": end_time.to_rfc3339(),
                                "lookback_hours": lookback_hours,
                            }),
                        )
                        .await?;
                    candles_by_symbol.insert(symbol.clone(), candles);
                }
                Err(e) => {
                    warn!("Failed to fetch candles for {}: {}", symbol, e);
                    candles_by_symbol.insert(symbol.clone(), Vec::new());
                }
            }
        }

        for symbol in &universe {
            let candles = candles_by_symbol.get(symbol).map(Vec::as_slice).unwrap_or(&[]);
            if candles.len() < min_candles {
                continue;
            }
            let score = match metric.as_str() {
                "sharpe_proxy" => compute_sharpe_proxy(candles),
                "momentum" => compute_momentum(candles),
                _ => compute_returns(candles),
            };
            let volume_proxy =
                candles.iter().map(|c| c.volume_f64()).sum::<f64>() / candles.len() as f64;
            rankings.push(RankingRow {
                symbol: symbol.clone(),
                score,
                volume_proxy,
                candles_count: candles.len(),
                first_price: candles[0].close_f64(),
                last_price: candles[candles.len() - 1].close_f64(),
            });
        }
    }

    // Applies to both paths: pre-ranked briefs get the same tie-break as
    // locally scored candidates, so rankings[0] is deterministic.
    sort_rankings(&mut rankings);

    if rankings.is_empty() {
        let failure = json!({
            "summary": "Strategy node: no valid rankings computed.",
            "universe_size": universe.len(),
            "metric": metric,
            "lookback_hours": lookback_hours,
            "candles_counts": candles_by_symbol
                .iter()
                .map(|(s, c)| (s.clone(), c.len()))
                .collect::<HashMap<String, usize>>(),
            "failed_at": Utc::now().to_rfc3339(),
        });
        ctx.artifacts
            .insert(run_id, "strategy", "strategy_failure", &failure)
            .await?;
        anyhow::bail!(
            "No valid rankings computed - insufficient candle data (universe {}, lookback {}h)",
            universe.len(),
            lookback_hours
        );
    }

    let top = rankings[0].clone();
    let selected_symbol = top.symbol.clone();
    let selected_score = top.score;

    let strategy_result = StrategyResult {
        selected_symbol: selected_symbol.clone(),
        score: selected_score,
        rationale: format!(
            "Selected {} based on {} metric (score: {:.4}). Ranked {} assets over {}h. Top asset moved from ${:.2} to ${:.2}.",
            selected_symbol,
            metric,
            selected_score,
            rankings.len(),
            lookback_hours,
            top.first_price,
            top.last_price
        ),
        candles_used: top.candles_count,
        computed_at: Utc::now(),
    };

    // Evidence: rankings row plus decision artifacts
    let ranking_id = ctx
        .rankings
        .insert(
            run_id,
            node_id,
            &window,
            &metric,
            &rankings,
            &selected_symbol,
            selected_score,
            &strategy_result.rationale,
        )
        .await?;

    ctx.artifacts
        .insert(
            run_id,
            "strategy",
            "strategy_decision",
            &json!({
                "chosen_asset": selected_symbol,
                "chosen_score": selected_score,
                "metric": metric,
                "lookback_hours": lookback_hours,
                "alternatives": rankings
                    .iter()
                    .skip(1)
                    .take(4)
                    .map(|r| json!({"symbol": r.symbol, "score": r.score}))
                    .collect::<Vec<_>>(),
                "total_candidates": rankings.len(),
                "decided_at": Utc::now().to_rfc3339(),
            }),
        )
        .await?;

    ctx.artifacts
        .insert(
            run_id,
            "strategy",
            "selection_basis",
            &json!({
                "method": format!("{}h_{}_ranking", lookback_hours, metric),
                "selected_symbol": selected_symbol,
                "candidates_considered_count": rankings.len(),
                "candidates": rankings
                    .iter()
                    .take(10)
                    .map(|r| json!({
                        "symbol": r.symbol,
                        "score": r.score,
                        "first_price": r.first_price,
                        "last_price": r.last_price,
                        "candles_count": r.candles_count,
                        "skipped_reason": if r.candles_count >= 2 { serde_json::Value::Null } else { json!("insufficient_candle_data") },
                    }))
                    .collect::<Vec<_>>(),
                "used_financial_brief": used_financial_brief,
                "computed_at": Utc::now().to_rfc3339(),
            }),
        )
        .await?;

    // Seal the choice into the execution plan
    plan.selected_asset = Some(selected_symbol.clone());
    plan.selected_order = Some(SelectedOrder {
        symbol: selected_symbol.clone(),
        side: plan.trade_intent.side,
        notional_usd: plan.trade_intent.budget_usd,
    });
    plan.decision_trace.push(DecisionTraceEntry {
        step: "strategy_execution".to_string(),
        detail: json!({
            "selected_symbol": selected_symbol,
            "score": selected_score,
            "evidence_refs": {"ranking_id": ranking_id},
        }),
        timestamp: Utc::now(),
    });
    ctx.runs.set_execution_plan(run_id, &plan).await?;

    ctx.events
        .emit(
            run_id,
            "DECISION",
            &json!({
                "decision_type": "asset_selection",
                "selected_symbol": selected_symbol,
                "selected_score": selected_score,
                "metric": metric,
                "rankings_count": rankings.len(),
                "evidence_refs": {
                    "ranking_id": ranking_id,
                    "top_3_symbols": rankings.iter().take(3).map(|r| r.symbol.clone()).collect::<Vec<_>>(),
                },
            }),
        )
        .await;

    let _ = tenant_id;
    Ok(json!({
        "top_symbol": selected_symbol,
        "top_return": selected_score,
        "metric": metric,
        "rankings_count": rankings.len(),
        "evidence_refs": {"ranking_id": ranking_id},
        "safe_summary": format!(
            "Selected {} as top asset ({}={:.2}%) from {} candidates over {}h",
            selected_symbol,
            metric,
            selected_score * 100.0,
            rankings.len(),
            lookback_hours
        ),
    }))
}

/// Sort by score desc, then volume proxy desc, then symbol asc.
fn sort_rankings(rankings: &mut [RankingRow]) {
    rankings.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.volume_proxy
                    .partial_cmp(&a.volume_proxy)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.symbol.cmp(&b.symbol))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal::prelude::FromPrimitive;

    fn series(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .map(|c| Candle {
                start: Utc::now(),
                end: Utc::now(),
                open: Decimal::from_f64(closes[0]).unwrap(),
                high: Decimal::from_f64(*c).unwrap(),
                low: Decimal::from_f64(*c).unwrap(),
                close: Decimal::from_f64(*c).unwrap(),
                volume: Decimal::from_f64(10.0).unwrap(),
            })
            .collect()
    }

    #[test]
    fn test_compute_returns_fraction() {
        let candles = series(&[100.0, 105.0, 110.0]);
        assert!((compute_returns(&candles) - 0.10).abs() < 1e-9);
    }

    #[test]
    fn test_sharpe_proxy_zero_for_flat_series() {
        let candles = series(&[100.0, 100.0, 100.0, 100.0]);
        assert_eq!(compute_sharpe_proxy(&candles), 0.0);
    }

    #[test]
    fn test_sharpe_proxy_positive_for_steady_rise() {
        let candles = series(&[100.0, 101.0, 102.0, 103.0, 104.0]);
        assert!(compute_sharpe_proxy(&candles) > 0.0);
    }

    #[test]
    fn test_momentum_uses_second_half() {
        // Flat first half, rising second half
        let candles = series(&[100.0, 100.0, 100.0, 110.0]);
        assert!(compute_momentum(&candles) > 0.0);
    }

    #[test]
    fn test_sort_rankings_tiebreakers() {
        let mut rankings = vec![
            RankingRow {
                symbol: "B-USD".to_string(),
                score: 0.05,
                volume_proxy: 100.0,
                candles_count: 24,
                first_price: 1.0,
                last_price: 1.05,
            },
            RankingRow {
                symbol: "A-USD".to_string(),
                score: 0.05,
                volume_proxy: 100.0,
                candles_count: 24,
                first_price: 1.0,
                last_price: 1.05,
            },
            RankingRow {
                symbol: "C-USD".to_string(),
                score: 0.10,
                volume_proxy: 1.0,
                candles_count: 24,
                first_price: 1.0,
                last_price: 1.1,
            },
        ];
        sort_rankings(&mut rankings);
        assert_eq!(rankings[0].symbol, "C-USD"); // highest score wins
        assert_eq!(rankings[1].symbol, "A-USD"); // alphabetical tiebreak
        assert_eq!(rankings[2].symbol, "B-USD");
    }
}
