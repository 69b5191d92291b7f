//! Data-integrity evaluators: schema validity, candle evidence coverage,
//! freshness, and series consistency.

use super::{EvalContext, EvalOutcome, Evaluator};
use crate::domain::types::AssetClass;
use anyhow::Result;
use chrono::{Datelike, Utc, Weekday};
use serde_json::json;

pub struct SchemaValidity;

impl Evaluator for SchemaValidity {
    fn name(&self) -> &'static str {
        "schema_validity"
    }
    fn category(&self) -> &'static str {
        "data"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let mut issues = Vec::new();

        if ctx.run.command_text.is_empty() {
            issues.push("run has empty command_text".to_string());
        }
        if ctx.run.intent.is_empty() {
            issues.push("run has empty intent".to_string());
        }
        if ctx.is_trade_run() && ctx.plan.is_none() {
            issues.push("trade run has no parseable execution plan".to_string());
        }
        for (step, kind, value) in &ctx.artifacts {
            if value.is_null() {
                issues.push(format!("artifact {}/{} is null", step, kind));
            }
        }

        if issues.is_empty() {
            Ok(EvalOutcome::pass("Run, plan, and artifacts all parse cleanly"))
        } else {
            let penalty = 0.25 * issues.len() as f64;
            Ok(EvalOutcome::score(1.0 - penalty, issues.join("; ")))
        }
    }
}

/// Every ranked symbol must have stored candle evidence.
pub struct MarketEvidenceIntegrity;

impl Evaluator for MarketEvidenceIntegrity {
    fn name(&self) -> &'static str {
        "market_evidence_integrity"
    }
    fn category(&self) -> &'static str {
        "data"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let Some(ranking) = &ctx.ranking else {
            if ctx.is_trade_run() {
                return Ok(EvalOutcome::fail("Trade run has no rankings row"));
            }
            return Ok(EvalOutcome::skipped("No rankings for this run type"));
        };

        let batch_symbols: Vec<&str> = ctx.batches.iter().map(|b| b.symbol.as_str()).collect();
        let total = ranking.table.len();
        let covered = ranking
            .table
            .iter()
            .filter(|row| batch_symbols.contains(&row.symbol.as_str()))
            .count();

        if total == 0 {
            return Ok(EvalOutcome::fail("Rankings table is empty"));
        }

        let score = covered as f64 / total as f64;
        Ok(EvalOutcome::score(
            score,
            format!("{}/{} ranked symbols have candle batch evidence", covered, total),
        )
        .with_thresholds(json!({"min_coverage": 1.0})))
    }
}

/// EOD stock data may lag up to 48h, with weekend tolerance; crypto candle
/// evidence should end near the run.
pub struct DataFreshness;

impl Evaluator for DataFreshness {
    fn name(&self) -> &'static str {
        "data_freshness"
    }
    fn category(&self) -> &'static str {
        "data"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        if ctx.batches.is_empty() {
            return Ok(EvalOutcome::skipped("No candle batches to check"));
        }

        let newest = ctx
            .batches
            .iter()
            .filter_map(|b| b.candles.last())
            .map(|c| c.end)
            .max();
        let Some(newest) = newest else {
            return Ok(EvalOutcome::fail("Candle batches contain no candles"));
        };

        let age_hours = (Utc::now() - newest).num_minutes() as f64 / 60.0;
        let max_stale_hours = if ctx.run.asset_class == AssetClass::Stock {
            // Friday close is acceptable through Monday
            let weekday = Utc::now().weekday();
            if weekday == Weekday::Sat || weekday == Weekday::Sun || weekday == Weekday::Mon {
                96.0
            } else {
                48.0
            }
        } else {
            48.0
        };

        if age_hours <= max_stale_hours {
            Ok(EvalOutcome::pass(format!(
                "Newest candle is {:.1}h old (limit {}h)",
                age_hours, max_stale_hours
            ))
            .with_thresholds(json!({"max_stale_hours": max_stale_hours})))
        } else {
            Ok(EvalOutcome::score(
                0.3,
                format!("Newest candle is {:.1}h old, beyond the {}h limit", age_hours, max_stale_hours),
            )
            .with_thresholds(json!({"max_stale_hours": max_stale_hours})))
        }
    }
}

/// Candle series must be ordered, gap-free within tolerance, and cover
/// enough of the query window.
pub struct CoinbaseDataIntegrity;

impl Evaluator for CoinbaseDataIntegrity {
    fn name(&self) -> &'static str {
        "coinbase_data_integrity"
    }
    fn category(&self) -> &'static str {
        "data"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        if ctx.batches.is_empty() {
            return Ok(EvalOutcome::skipped("No candle batches to check"));
        }

        let mut issues = Vec::new();
        let mut checked = 0usize;

        for batch in &ctx.batches {
            if batch.candles.len() < 2 {
                continue;
            }
            checked += 1;

            // Monotonic ordering
            if batch.candles.windows(2).any(|pair| pair[0].start >= pair[1].start) {
                issues.push(format!("{}: candles out of order", batch.symbol));
                continue;
            }

            // Gap detection: no gap more than twice the median spacing
            let mut gaps: Vec<i64> = batch
                .candles
                .windows(2)
                .map(|pair| (pair[1].start - pair[0].start).num_seconds())
                .collect();
            gaps.sort_unstable();
            let median = gaps[gaps.len() / 2].max(1);
            if gaps.iter().any(|gap| *gap > median * 2) {
                issues.push(format!("{}: gap exceeds 2x median spacing", batch.symbol));
            }

            // Coverage of the recorded query window
            if let (Some(start), Some(end)) = (
                batch.query_params.get("start_time").and_then(|v| v.as_str()),
                batch.query_params.get("end_time").and_then(|v| v.as_str()),
            ) && let (Ok(start), Ok(end)) = (
                chrono::DateTime::parse_from_rfc3339(start),
                chrono::DateTime::parse_from_rfc3339(end),
            ) {
                let window_secs = (end - start).num_seconds().max(1);
                let covered_secs = (batch.candles[batch.candles.len() - 1].end
                    - batch.candles[0].start)
                    .num_seconds();
                let coverage = covered_secs as f64 / window_secs as f64;
                if coverage < 0.8 {
                    issues.push(format!(
                        "{}: series covers {:.0}% of the query window",
                        batch.symbol,
                        coverage * 100.0
                    ));
                }
            }
        }

        if checked == 0 {
            return Ok(EvalOutcome::skipped("No batch has enough candles to check"));
        }
        if issues.is_empty() {
            Ok(EvalOutcome::pass(format!(
                "{} candle batch(es) ordered, gap-free, and well covered",
                checked
            ))
            .with_thresholds(json!({"max_gap_multiple": 2, "min_coverage": 0.8})))
        } else {
            let score = 1.0 - (issues.len() as f64 / checked as f64);
            Ok(EvalOutcome::score(score, issues.join("; "))
                .with_thresholds(json!({"max_gap_multiple": 2, "min_coverage": 0.8})))
        }
    }
}
