//! Performance evaluators: latency SLOs, time-window fidelity, and tool
//! reliability.

use super::{EvalContext, EvalOutcome, Evaluator};
use anyhow::Result;
use chrono::Utc;
use serde_json::json;

const TOTAL_LATENCY_SLO_SECS: f64 = 90.0;
const STEP_P95_SLO_SECS: f64 = 25.0;

/// Runs are graded from inside their own eval step, so a completed_at may
/// not exist yet; measure up to now in that case.
fn run_duration_secs(ctx: &EvalContext) -> Option<f64> {
    let start = ctx.run.started_at.unwrap_or(ctx.run.created_at);
    let end = ctx.run.completed_at.unwrap_or_else(Utc::now);
    Some((end - start).num_milliseconds() as f64 / 1000.0)
}

fn step_durations_secs(ctx: &EvalContext) -> Vec<f64> {
    ctx.node_timings
        .iter()
        .filter_map(|(_, started, completed)| {
            let started = chrono::DateTime::parse_from_rfc3339(started.as_deref()?).ok()?;
            let completed = chrono::DateTime::parse_from_rfc3339(completed.as_deref()?).ok()?;
            Some((completed - started).num_milliseconds() as f64 / 1000.0)
        })
        .collect()
}

pub struct LatencySlo;

impl Evaluator for LatencySlo {
    fn name(&self) -> &'static str {
        "latency_slo"
    }
    fn category(&self) -> &'static str {
        "performance"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let Some(total) = run_duration_secs(ctx) else {
            return Ok(EvalOutcome::skipped("Run not yet terminal; no duration"));
        };

        let mut steps = step_durations_secs(ctx);
        steps.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let p95 = if steps.is_empty() {
            0.0
        } else {
            let idx = ((steps.len() as f64) * 0.95).ceil() as usize - 1;
            steps[idx.min(steps.len() - 1)]
        };

        let total_ok = total <= TOTAL_LATENCY_SLO_SECS;
        let p95_ok = p95 <= STEP_P95_SLO_SECS;
        let thresholds = json!({
            "total_slo_secs": TOTAL_LATENCY_SLO_SECS,
            "step_p95_slo_secs": STEP_P95_SLO_SECS,
        });

        let score = match (total_ok, p95_ok) {
            (true, true) => 1.0,
            (true, false) | (false, true) => 0.5,
            (false, false) => 0.0,
        };
        Ok(EvalOutcome::score(
            score,
            format!(
                "Total {:.1}s (SLO {}s), step p95 {:.1}s (SLO {}s)",
                total, TOTAL_LATENCY_SLO_SECS, p95, STEP_P95_SLO_SECS
            ),
        )
        .with_thresholds(thresholds))
    }
}

pub struct EndToEndLatency;

impl Evaluator for EndToEndLatency {
    fn name(&self) -> &'static str {
        "end_to_end_latency"
    }
    fn category(&self) -> &'static str {
        "performance"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let Some(total) = run_duration_secs(ctx) else {
            return Ok(EvalOutcome::skipped("Run not yet terminal; no duration"));
        };
        // Grade degrades linearly up to 2x the SLO
        let score = if total <= TOTAL_LATENCY_SLO_SECS {
            1.0
        } else {
            (2.0 - total / TOTAL_LATENCY_SLO_SECS).max(0.0)
        };
        Ok(EvalOutcome::score(score, format!("End-to-end latency {:.1}s", total))
            .with_details(json!({"total_seconds": total})))
    }
}

/// Oracle check: the fetched candle window must cover at least 90% of the
/// intent's lookback window.
pub struct TimeWindowCorrectness;

impl Evaluator for TimeWindowCorrectness {
    fn name(&self) -> &'static str {
        "time_window_correctness"
    }
    fn category(&self) -> &'static str {
        "performance"
    }
    fn evaluator_type(&self) -> &'static str {
        "oracle"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let Some(plan) = &ctx.plan else {
            return Ok(EvalOutcome::skipped("No execution plan with a lookback window"));
        };
        if ctx.batches.is_empty() {
            return Ok(EvalOutcome::score(0.5, "no oracle comparison possible"));
        }

        let expected_secs = plan.trade_intent.lookback_hours * 3600.0;
        let mut worst_coverage: f64 = 1.0;
        for batch in &ctx.batches {
            if batch.candles.len() < 2 {
                continue;
            }
            let covered = (batch.candles[batch.candles.len() - 1].end - batch.candles[0].start)
                .num_seconds() as f64;
            worst_coverage = worst_coverage.min(covered / expected_secs);
        }

        if worst_coverage >= 0.9 {
            Ok(EvalOutcome::pass(format!(
                "Candle windows cover {:.0}% of the expected lookback",
                worst_coverage * 100.0
            ))
            .with_thresholds(json!({"min_window_coverage": 0.9})))
        } else {
            Ok(EvalOutcome::score(
                worst_coverage,
                format!(
                    "Worst candle window covers only {:.0}% of the expected lookback",
                    worst_coverage * 100.0
                ),
            )
            .with_thresholds(json!({"min_window_coverage": 0.9})))
        }
    }
}

pub struct ToolErrorRate;

impl Evaluator for ToolErrorRate {
    fn name(&self) -> &'static str {
        "tool_error_rate"
    }
    fn category(&self) -> &'static str {
        "performance"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        if ctx.tool_calls.is_empty() {
            return Ok(EvalOutcome::skipped("No tool calls recorded"));
        }
        let total = ctx.tool_calls.len();
        let failed = ctx
            .tool_calls
            .iter()
            .filter(|c| c.status != "SUCCESS")
            .count();
        let success_rate = (total - failed) as f64 / total as f64;
        Ok(EvalOutcome::score(
            success_rate,
            format!("{}/{} tool calls succeeded", total - failed, total),
        )
        .with_details(json!({"total": total, "failed": failed})))
    }
}

/// The audit trail must cover the external I/O the run performed.
pub struct ToolCallCoverage;

impl Evaluator for ToolCallCoverage {
    fn name(&self) -> &'static str {
        "tool_call_coverage"
    }
    fn category(&self) -> &'static str {
        "performance"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let mut missing = Vec::new();

        let research_ran = ctx.node_outputs.contains_key("research");
        let replayed = ctx
            .node_outputs
            .get("research")
            .and_then(|o| o.get("replayed"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if research_ran
            && !replayed
            && !ctx.tool_calls.iter().any(|c| c.tool_name == "fetch_candles")
        {
            missing.push("research ran but no fetch_candles calls are recorded");
        }
        if !ctx.orders.is_empty() && !ctx.tool_calls.iter().any(|c| c.tool_name == "place_order") {
            missing.push("orders exist but no place_order call is recorded");
        }

        if missing.is_empty() {
            Ok(EvalOutcome::pass("Audit trail covers the run's external I/O"))
        } else {
            Ok(EvalOutcome::fail(missing.join("; ")))
        }
    }
}

/// Rate limiting must be absorbed, not surfaced as failures.
pub struct RateLimitResilience;

impl Evaluator for RateLimitResilience {
    fn name(&self) -> &'static str {
        "rate_limit_resilience"
    }
    fn category(&self) -> &'static str {
        "performance"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let rate_limited: Vec<_> = ctx
            .tool_calls
            .iter()
            .filter(|c| c.http_status == Some(429))
            .collect();
        if rate_limited.is_empty() {
            return Ok(EvalOutcome::pass("No rate limiting observed"));
        }
        let failures = rate_limited.iter().filter(|c| c.status != "SUCCESS").count();
        let score = 1.0 - failures as f64 / rate_limited.len() as f64;
        Ok(EvalOutcome::score(
            score,
            format!(
                "{}/{} rate-limited calls were not recovered",
                failures,
                rate_limited.len()
            ),
        ))
    }
}

pub struct ProductMetadataAvailability;

impl Evaluator for ProductMetadataAvailability {
    fn name(&self) -> &'static str {
        "product_metadata_availability"
    }
    fn category(&self) -> &'static str {
        "performance"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        if !ctx.is_trade_run() {
            return Ok(EvalOutcome::skipped("Not a trade run"));
        }
        let Some(snapshot) = ctx.artifact("universe_snapshot") else {
            return Ok(EvalOutcome::fail("No universe_snapshot artifact"));
        };
        let count = snapshot
            .get("products_final")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        if count > 0 {
            Ok(EvalOutcome::pass(format!("Universe snapshot lists {} products", count)))
        } else {
            Ok(EvalOutcome::fail("Universe snapshot lists no products"))
        }
    }
}
