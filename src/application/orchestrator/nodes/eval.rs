//! Eval node: runs the entire registry in fixed order and writes one row
//! per evaluator. Never aborts; evaluator failures become zero-score rows
//! with the error message.

use crate::application::evals::{EvalContext, EvalOutcome, registry};
use crate::application::orchestrator::NodeContext;
use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};

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
        .context("Eval node: run not found")?;

    let eval_ctx = EvalContext::load(ctx, run).await?;
    let evaluators = registry();

    let mut scores = Vec::with_capacity(evaluators.len());
    let mut failures = 0usize;

    for evaluator in &evaluators {
        let outcome = match evaluator.evaluate(&eval_ctx) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Evaluator {} errored: {}", evaluator.name(), e);
                failures += 1;
                EvalOutcome::fail(format!("Evaluator error: {}", e))
            }
        };

        let thresholds = if outcome.thresholds.is_null() {
            None
        } else {
            Some(&outcome.thresholds)
        };
        if let Err(e) = ctx
            .eval_results
            .insert(
                run_id,
                tenant_id,
                evaluator.name(),
                outcome.score,
                &outcome.reasons,
                evaluator.evaluator_type(),
                evaluator.category(),
                thresholds,
                outcome.details.as_ref(),
            )
            .await
        {
            // A write failure must not abort the remaining evals
            warn!("Failed to persist eval {}: {}", evaluator.name(), e);
            continue;
        }
        scores.push((evaluator.name(), outcome.score));
    }

    let average = if scores.is_empty() {
        0.0
    } else {
        scores.iter().map(|(_, s)| s).sum::<f64>() / scores.len() as f64
    };

    ctx.events
        .emit(
            run_id,
            "EVALS_COMPLETED",
            &json!({
                "eval_count": scores.len(),
                "average_score": average,
                "evaluator_failures": failures,
            }),
        )
        .await;

    info!(
        "evals_completed: run={} count={} average={:.3}",
        run_id,
        scores.len(),
        average
    );

    Ok(json!({
        "eval_count": scores.len(),
        "average_score": average,
        "evaluator_failures": failures,
        "safe_summary": format!("Graded run with {} evals, average score {:.2}", scores.len(), average),
    }))
}
