//! Research node: gather the product universe, fetch candles, compute
//! returns. Every fetch leaves a tool-call row, every drop a categorized
//! reason, and the universe snapshot is always persisted so evals can
//! reconstruct what the run looked at.

use crate::application::orchestrator::NodeContext;
use crate::domain::types::{AssetClass, Candle, ExecutionMode, Granularity, compute_return_pct};
use crate::infrastructure::audit::{ToolCallRecord, ToolCallStatus};
use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

const STABLECOINS: &[&str] = &[
    "USDT", "USDC", "DAI", "BUSD", "TUSD", "PAX", "GUSD", "USDP", "PYUSD", "FRAX",
];

const PREFERRED_MAJORS: &[&str] = &[
    "BTC-USD", "ETH-USD", "SOL-USD", "MATIC-USD", "AVAX-USD", "ADA-USD", "DOT-USD", "LINK-USD",
    "UNI-USD", "ATOM-USD",
];

const UNIVERSE_CAP: usize = 50;
const MAX_CONCURRENT_FETCHES: usize = 10;

fn select_granularity(lookback_hours: f64) -> Granularity {
    if lookback_hours <= 168.0 {
        Granularity::OneHour
    } else {
        Granularity::OneDay
    }
}

fn min_candles_required(lookback_hours: f64, granularity: Granularity) -> usize {
    if granularity == Granularity::OneHour {
        ((lookback_hours * 0.75) as usize).max(2)
    } else {
        2
    }
}

pub async fn execute(
    ctx: &NodeContext,
    run_id: &str,
    node_id: &str,
    _tenant_id: &str,
) -> Result<serde_json::Value> {
    let run = ctx
        .runs
        .get(run_id)
        .await?
        .context("Research node: run not found")?;

    // REPLAY runs read frozen evidence; no external calls are allowed.
    if run.execution_mode == ExecutionMode::Replay
        && let Some(source_run_id) = &run.source_run_id
    {
        info!(
            "REPLAY mode: loading stored artifacts from source_run_id={}",
            source_run_id
        );
        let copied = ctx.artifacts.copy_from_run(source_run_id, run_id).await?;
        let brief = ctx.artifacts.get(run_id, "financial_brief").await?;
        let returns_by_symbol = brief
            .as_ref()
            .and_then(|b| b.get("ranked_assets"))
            .and_then(|r| r.as_array())
            .map(|assets| {
                assets
                    .iter()
                    .filter_map(|a| {
                        Some((
                            a.get("product_id")?.as_str()?.to_string(),
                            a.get("return_pct")?.as_f64()?,
                        ))
                    })
                    .collect::<HashMap<String, f64>>()
            })
            .unwrap_or_default();
        return Ok(json!({
            "replayed": true,
            "source_run_id": source_run_id,
            "artifacts_copied": copied,
            "returns_by_symbol": returns_by_symbol,
            "safe_summary": format!("Replayed research from {} ({} artifacts)", source_run_id, copied),
        }));
    }

    // Policy/risk constraint retrieval runs before any market data fetch
    // so the chunks are available to the proposal as citable context.
    record_policy_retrieval(ctx, run_id, node_id).await;

    let plan = ctx.runs.get_execution_plan(run_id).await?;
    let (intent_universe, lookback_hours) = match &plan {
        Some(plan) => (
            plan.trade_intent.universe.clone(),
            plan.trade_intent.lookback_hours,
        ),
        None => (Vec::new(), 24.0),
    };

    // Resolve universe: the intent's if provided, else fetched and filtered.
    let mut filters_applied: Vec<String> = Vec::new();
    let mut provider_response_count = 0usize;
    let universe: Vec<String> = if !intent_universe.is_empty() {
        filters_applied.push("from_intent".to_string());
        intent_universe
    } else if run.asset_class == AssetClass::Stock {
        filters_applied.push("from_watchlist".to_string());
        ctx.config
            .stock_watchlist
            .iter()
            .map(|s| format!("{}-USD", s))
            .collect()
    } else {
        match ctx.crypto_data.list_products("USD").await {
            Ok(products) => {
                provider_response_count = products.len();
                filters_applied.extend(
                    ["status=online", "quote=USD", "exclude_stablecoins"]
                        .iter()
                        .map(|s| s.to_string()),
                );
                let mut universe: Vec<String> = products
                    .into_iter()
                    .filter(|p| {
                        p.is_online()
                            && !p.base_currency.is_empty()
                            && !STABLECOINS.contains(&p.base_currency.to_uppercase().as_str())
                    })
                    .map(|p| p.product_id)
                    .collect();
                if universe.len() > UNIVERSE_CAP {
                    // Cap deterministically, majors first
                    let preferred: Vec<String> = PREFERRED_MAJORS
                        .iter()
                        .filter(|p| universe.contains(&p.to_string()))
                        .map(|p| p.to_string())
                        .collect();
                    let rest: Vec<String> = universe
                        .iter()
                        .filter(|p| !preferred.contains(p))
                        .take(UNIVERSE_CAP - preferred.len())
                        .cloned()
                        .collect();
                    universe = preferred.into_iter().chain(rest).collect();
                    filters_applied.push("capped_at_50".to_string());
                }
                universe
            }
            Err(e) => {
                warn!("Failed to fetch universe from provider: {}", e);
                filters_applied.push("fallback_default".to_string());
                PREFERRED_MAJORS[..5].iter().map(|s| s.to_string()).collect()
            }
        }
    };

    // Persist universe_snapshot (always written)
    let provider = ctx.market_data_for(run.asset_class);
    let universe_snapshot = json!({
        "quote_currency_used": "USD",
        "asset_class": run.asset_class.to_string(),
        "products_considered_count": universe.len(),
        "filters_applied": filters_applied,
        "products_final": universe.iter().take(UNIVERSE_CAP).collect::<Vec<_>>(),
        "provider_metadata": {
            "endpoint": provider.name(),
            "request_time_iso": Utc::now().to_rfc3339(),
            "response_count": provider_response_count,
        }
    });
    ctx.artifacts
        .insert(run_id, "research", "universe_snapshot", &universe_snapshot)
        .await?;
    info!(
        "Persisted universe_snapshot: {} products for run {}",
        universe.len(),
        run_id
    );

    // Buffer the window to tolerate missing candles at the edges
    let end_time = Utc::now();
    let buffer_hours = (lookback_hours * 1.25).max(lookback_hours + 12.0);
    let start_time = end_time - Duration::seconds((buffer_hours * 3600.0) as i64);

    let granularity = select_granularity(lookback_hours);
    let min_candles = min_candles_required(lookback_hours, granularity);

    // Per-symbol fetches, parallel with bounded concurrency
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_FETCHES));
    let mut tasks = Vec::with_capacity(universe.len());
    for symbol in &universe {
        let provider = provider.clone();
        let semaphore = semaphore.clone();
        let symbol = symbol.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            let started = std::time::Instant::now();
            let result = provider
                .get_candles(&symbol, granularity, start_time, end_time)
                .await;
            (symbol, result, started.elapsed().as_millis() as i64)
        }));
    }

    let mut candles_by_symbol: HashMap<String, Vec<Candle>> = HashMap::new();
    let mut returns_by_symbol: HashMap<String, f64> = HashMap::new();
    let mut drop_reasons: HashMap<String, String> = HashMap::new();

    for task in futures::future::join_all(tasks).await {
        let (symbol, result, latency_ms) = task.context("Candle fetch task panicked")?;
        match result {
            Ok(candles) => {
                if candles.len() < min_candles {
                    drop_reasons.insert(
                        symbol.clone(),
                        format!("insufficient_candles_{}_need_{}", candles.len(), min_candles),
                    );
                    ctx.tool_log
                        .record_best_effort(ToolCallRecord {
                            run_id,
                            node_id: Some(node_id),
                            tool_name: "fetch_candles",
                            mcp_server: provider.name(),
                            request: json!({"product_id": symbol, "granularity": granularity.label()}),
                            response: Some(json!({"candles_count": candles.len()})),
                            status: ToolCallStatus::Success,
                            latency_ms,
                            http_status: Some(200),
                            error_text: None,
                            attempt: 1,
                        })
                        .await;
                    continue;
                }
                let first_open = candles[0].open_f64();
                if first_open <= 0.0 {
                    drop_reasons.insert(symbol.clone(), "invalid_price_zero_open".to_string());
                    warn!("Dropping {}: first open price is {}", symbol, first_open);
                    continue;
                }

                ctx.tool_log
                    .record_best_effort(ToolCallRecord {
                        run_id,
                        node_id: Some(node_id),
                        tool_name: "fetch_candles",
                        mcp_server: provider.name(),
                        request: json!({
                            "product_id": symbol,
                            "granularity": granularity.label(),
                            "start": start_time.to_rfc3339(),
                            "end": end_time.to_rfc3339(),
                        }),
                        response: Some(json!({"candles_count": candles.len()})),
                        status: ToolCallStatus::Success,
                        latency_ms,
                        http_status: Some(200),
                        error_text: None,
                        attempt: 1,
                    })
                    .await;

                let return_frac = compute_return_pct(&candles) / 100.0;

                // Candle evidence: individual rows plus the frozen batch
                ctx.candles
                    .save_candles(&symbol, granularity.label(), &candles)
                    .await?;
                ctx.candles
                    .save_batch(
                        run_id,
                        node_id,
                        &symbol,
                        granularity.label(),
                        &candles,
                        &json!({
                            "start_time": start_time.to_rfc3339(),
                            "end_time": end_time.to_rfc3339(),
                            "lookback_hours": lookback_hours,
                            "granularity": granularity.label(),
                        }),
                    )
                    .await?;

                returns_by_symbol.insert(symbol.clone(), return_frac);
                candles_by_symbol.insert(symbol, candles);
            }
            Err(e) => {
                drop_reasons.insert(symbol.clone(), e.drop_reason());
                ctx.tool_log
                    .record_best_effort(ToolCallRecord {
                        run_id,
                        node_id: Some(node_id),
                        tool_name: "fetch_candles",
                        mcp_server: provider.name(),
                        request: json!({"product_id": symbol, "granularity": granularity.label()}),
                        response: None,
                        status: match &e {
                            crate::domain::errors::MarketDataError::Timeout { .. } => {
                                ToolCallStatus::Timeout
                            }
                            _ => ToolCallStatus::Failed,
                        },
                        latency_ms,
                        http_status: match &e {
                            crate::domain::errors::MarketDataError::Api { status, .. } => {
                                Some(*status)
                            }
                            crate::domain::errors::MarketDataError::RateLimited { .. } => Some(429),
                            _ => None,
                        },
                        error_text: Some(e.to_string()),
                        attempt: 1,
                    })
                    .await;
            }
        }
    }

    // Ranked financial brief for the strategy node. Ties break on symbol
    // ascending so equal returns rank the same on every run.
    let mut ranked: Vec<(&String, &f64)> = returns_by_symbol.iter().collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(b.0))
    });
    let ranked_assets: Vec<serde_json::Value> = ranked
        .iter()
        .map(|(symbol, return_frac)| {
            let candles = &candles_by_symbol[*symbol];
            json!({
                "product_id": symbol,
                "symbol": crate::domain::symbols::to_base(symbol),
                "return_pct": **return_frac,
                "candles_count": candles.len(),
                "first_open": candles[0].open_f64(),
                "last_price": candles[candles.len() - 1].close_f64(),
            })
        })
        .collect();

    if !ranked_assets.is_empty() {
        ctx.artifacts
            .insert(
                run_id,
                "research",
                "financial_brief",
                &json!({
                    "ranked_assets": ranked_assets,
                    "lookback_hours": lookback_hours,
                    "granularity": granularity.label(),
                    "computed_at": Utc::now().to_rfc3339(),
                }),
            )
            .await?;
    }

    // Summary is always written, success or not
    let categorized = categorize_drop_reasons(&drop_reasons);
    let stats = ctx.api_stats.snapshot();
    let research_summary = json!({
        "universe_size": universe.len(),
        "kept_count": returns_by_symbol.len(),
        "dropped_count": drop_reasons.len(),
        "drop_reasons_categorized": categorized,
        "min_candles_required": min_candles,
        "granularity": granularity.label(),
        "api_call_stats": stats,
    });
    ctx.artifacts
        .insert(run_id, "research", "research_summary", &research_summary)
        .await?;

    // Full drop detail for diagnosis: the summary carries counts, this
    // carries the per-symbol reasons and the universe they applied to.
    ctx.artifacts
        .insert(
            run_id,
            "research",
            "research_debug",
            &json!({
                "universe": universe,
                "filters_applied": filters_applied,
                "drop_reasons": drop_reasons,
                "top_reasons_summary": categorized,
                "kept_count": returns_by_symbol.len(),
                "lookback_hours": lookback_hours,
            }),
        )
        .await?;

    if returns_by_symbol.is_empty() {
        let dominant = dominant_cause(&categorized);
        let failure = json!({
            "reason_code": "RESEARCH_EMPTY_RANKINGS",
            "root_cause_guess": dominant,
            "recommended_fix": recommend_fix(&dominant),
            "top_examples": drop_reasons.iter().take(5).map(|(s, r)| json!({"symbol": s, "reason": r})).collect::<Vec<_>>(),
        });
        ctx.artifacts
            .insert(run_id, "research", "research_failure", &failure)
            .await?;
        ctx.runs
            .mark_failed(
                run_id,
                "RESEARCH_EMPTY_RANKINGS",
                &format!(
                    "No symbols survived research: {} dropped, dominant cause {}",
                    drop_reasons.len(),
                    dominant
                ),
            )
            .await?;
        anyhow::bail!(
            "Research produced no rankings ({} of {} dropped, dominant cause: {})",
            drop_reasons.len(),
            universe.len(),
            dominant
        );
    }

    Ok(json!({
        "returns_by_symbol": returns_by_symbol,
        "universe_size": universe.len(),
        "kept_count": returns_by_symbol.len(),
        "dropped_count": drop_reasons.len(),
        "safe_summary": format!(
            "Researched {} assets, ranked {} over {}h",
            universe.len(),
            returns_by_symbol.len(),
            lookback_hours
        ),
    }))
}

async fn record_policy_retrieval(ctx: &NodeContext, run_id: &str, node_id: &str) {
    let query = "trading policy and risk constraints";
    let chunks = json!([
        {
            "chunk_id": "policy_chunk_1",
            "text": "Orders are capped per-trade by MAX_NOTIONAL_PER_ORDER_USD and may be restricted to an allowlist of symbols.",
            "source": "internal_policy_docs",
            "similarity": 0.85
        },
        {
            "chunk_id": "policy_chunk_2",
            "text": "LIVE orders require a verified tradable product and an explicit user confirmation.",
            "source": "internal_policy_docs",
            "similarity": 0.75
        },
        {
            "chunk_id": "policy_chunk_3",
            "text": "A blocked policy decision halts execution; no orders may be placed for the run.",
            "source": "internal_policy_docs",
            "similarity": 0.65
        }
    ]);

    let result = sqlx::query(
        "INSERT INTO retrievals (id, run_id, node_id, query, chunks_json, ts) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(crate::domain::ids::new_id("ret_"))
    .bind(run_id)
    .bind(node_id)
    .bind(query)
    .bind(chunks.to_string())
    .bind(Utc::now().to_rfc3339())
    .execute(&ctx.database.pool)
    .await;
    if let Err(e) = result {
        warn!("Failed to record policy retrieval: {}", e);
    }

    ctx.tool_log
        .record_best_effort(ToolCallRecord {
            run_id,
            node_id: Some(node_id),
            tool_name: "rag_search",
            mcp_server: "research_retrieval",
            request: json!({"query": query, "top_k": 3}),
            response: Some(json!({"chunks_count": 3})),
            status: ToolCallStatus::Success,
            latency_ms: 0,
            http_status: None,
            error_text: None,
            attempt: 1,
        })
        .await;
}

fn categorize_drop_reasons(drop_reasons: &HashMap<String, String>) -> HashMap<String, usize> {
    let mut categories: HashMap<String, usize> = HashMap::new();
    for reason in drop_reasons.values() {
        let category = if reason.starts_with("insufficient_candles") {
            "insufficient_candles"
        } else if reason.starts_with("api_error") {
            "api_error"
        } else {
            reason.as_str()
        };
        *categories.entry(category.to_string()).or_default() += 1;
    }
    categories
}

fn dominant_cause(categorized: &HashMap<String, usize>) -> String {
    categorized
        .iter()
        .max_by_key(|(_, count)| **count)
        .map(|(cause, _)| cause.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

fn recommend_fix(dominant: &str) -> &'static str {
    match dominant {
        "rate_limited" => "Reduce universe size or increase the delay between candle fetches.",
        "timeout" => "Check provider connectivity; consider a longer request timeout.",
        "insufficient_candles" => "Widen the lookback window or pick a coarser granularity.",
        "invalid_price_zero_open" => "Exclude newly listed products with no opening price.",
        _ => "Inspect the per-symbol drop reasons in research_summary.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_granularity_selection() {
        assert_eq!(select_granularity(24.0), Granularity::OneHour);
        assert_eq!(select_granularity(168.0), Granularity::OneHour);
        assert_eq!(select_granularity(500.0), Granularity::OneDay);
    }

    #[test]
    fn test_min_candles() {
        assert_eq!(min_candles_required(24.0, Granularity::OneHour), 18);
        assert_eq!(min_candles_required(1.0, Granularity::OneHour), 2);
        assert_eq!(min_candles_required(500.0, Granularity::OneDay), 2);
    }

    #[test]
    fn test_drop_reason_categorization() {
        let reasons = HashMap::from([
            ("A-USD".to_string(), "insufficient_candles_3_need_18".to_string()),
            ("B-USD".to_string(), "insufficient_candles_0_need_18".to_string()),
            ("C-USD".to_string(), "rate_limited".to_string()),
            ("D-USD".to_string(), "api_error_500".to_string()),
        ]);
        let categorized = categorize_drop_reasons(&reasons);
        assert_eq!(categorized["insufficient_candles"], 2);
        assert_eq!(categorized["rate_limited"], 1);
        assert_eq!(categorized["api_error"], 1);
        assert_eq!(dominant_cause(&categorized), "insufficient_candles");
    }
}
