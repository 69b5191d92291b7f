//! Eval inspection endpoints: per-run results, dashboard aggregations,
//! windowed summaries, and the registry definitions.

use super::AppState;
use crate::application::evals::registry;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use sqlx::Row;
use std::sync::Arc;

const DEFAULT_FAILURE_THRESHOLD: f64 = 0.7;

pub async fn for_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    match state.evals.list_for_run(&run_id).await {
        Ok(results) => {
            let average = if results.is_empty() {
                0.0
            } else {
                results.iter().map(|r| r.score).sum::<f64>() / results.len() as f64
            };
            (
                StatusCode::OK,
                Json(json!({
                    "run_id": run_id,
                    "eval_count": results.len(),
                    "average_score": average,
                    "results": results
                        .iter()
                        .map(|r| json!({
                            "eval_name": r.eval_name,
                            "score": r.score,
                            "category": r.eval_category,
                        }))
                        .collect::<Vec<_>>(),
                })),
            )
        }
        Err(e) => internal_error(e),
    }
}

pub async fn run_details(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    match state.evals.list_for_run(&run_id).await {
        Ok(results) => (StatusCode::OK, Json(json!({ "run_id": run_id, "results": results }))),
        Err(e) => internal_error(e),
    }
}

/// Attach deterministic explanations derived from the stored reasons. An
/// LLM explainer is an optional enhancement layered on top of this.
pub async fn explain_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    let results = match state.evals.list_for_run(&run_id).await {
        Ok(results) => results,
        Err(e) => return internal_error(e),
    };

    let mut explained = 0usize;
    for result in &results {
        if result.explanation.is_some() {
            continue;
        }
        let verdict = if result.score >= 0.9 {
            "passed"
        } else if result.score >= 0.5 {
            "partially passed"
        } else {
            "failed"
        };
        let explanation = format!(
            "{} {} with score {:.2}: {}",
            result.eval_name,
            verdict,
            result.score,
            result.reasons.join("; ")
        );
        if state
            .evals
            .set_explanation(&result.eval_id, &explanation, "deterministic")
            .await
            .is_ok()
        {
            explained += 1;
        }
    }

    (
        StatusCode::OK,
        Json(json!({ "run_id": run_id, "explained": explained })),
    )
}

#[derive(Debug, Deserialize)]
pub struct WindowParams {
    #[serde(default)]
    pub window: Option<String>,
}

fn window_hours(window: Option<&str>) -> i64 {
    match window {
        Some("48h") => 48,
        Some("7d") => 168,
        _ => 24,
    }
}

pub async fn dashboard(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WindowParams>,
) -> impl IntoResponse {
    match state
        .evals
        .dashboard(window_hours(params.window.as_deref()), DEFAULT_FAILURE_THRESHOLD)
        .await
    {
        Ok(dashboard) => (StatusCode::OK, Json(dashboard)),
        Err(e) => internal_error(e),
    }
}

pub async fn summary(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WindowParams>,
) -> impl IntoResponse {
    match state.evals.summary(window_hours(params.window.as_deref())).await {
        Ok(summary) => (StatusCode::OK, Json(summary)),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

pub async fn recent_runs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PageParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    let offset = params.offset.unwrap_or(0).max(0);
    match state.ctx.runs.list_recent(limit, offset).await {
        Ok(runs) => (StatusCode::OK, Json(json!({ "runs": runs }))),
        Err(e) => internal_error(e),
    }
}

/// Eval results for every run spawned from a conversation's confirmations.
pub async fn for_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> impl IntoResponse {
    let run_ids: Vec<String> = match sqlx::query(
        "SELECT run_id FROM trade_confirmations WHERE conversation_id = ? AND run_id IS NOT NULL",
    )
    .bind(&conversation_id)
    .fetch_all(&state.ctx.database.pool)
    .await
    {
        Ok(rows) => rows.into_iter().map(|r| r.get("run_id")).collect(),
        Err(e) => return internal_error(e.into()),
    };

    match state.evals.list_for_conversation_runs(&run_ids).await {
        Ok(results) => (
            StatusCode::OK,
            Json(json!({
                "conversation_id": conversation_id,
                "run_ids": run_ids,
                "results": results,
            })),
        ),
        Err(e) => internal_error(e),
    }
}

pub async fn definitions(State(_state): State<Arc<AppState>>) -> impl IntoResponse {
    let definitions: Vec<serde_json::Value> = registry()
        .iter()
        .map(|evaluator| {
            json!({
                "eval_name": evaluator.name(),
                "category": evaluator.category(),
                "evaluator_type": evaluator.evaluator_type(),
            })
        })
        .collect();
    (StatusCode::OK, Json(json!({ "definitions": definitions })))
}

pub async fn definition(
    State(_state): State<Arc<AppState>>,
    Path(eval_name): Path<String>,
) -> impl IntoResponse {
    match registry().iter().find(|e| e.name() == eval_name) {
        Some(evaluator) => (
            StatusCode::OK,
            Json(json!({
                "eval_name": evaluator.name(),
                "category": evaluator.category(),
                "evaluator_type": evaluator.evaluator_type(),
            })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": {
                    "code": "EVAL_NOT_FOUND",
                    "message": format!("No eval named {}", eval_name),
                }
            })),
        ),
    }
}

fn internal_error(e: anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": { "code": "INTERNAL_ERROR", "message": e.to_string() }
        })),
    )
}
