//! REST API surface.
//!
//! All endpoints live under `/api/v1/`. CORS is configured permissively
//! for development. Authentication is an external collaborator; requests
//! run as the default tenant.

pub mod chat;
pub mod evals;
pub mod format;
pub mod trade_tickets;

use crate::application::command::CommandService;
use crate::application::orchestrator::NodeContext;
use crate::infrastructure::persistence::repositories::evals::EvalResultsRepo;
use crate::infrastructure::persistence::repositories::tickets::TradeTicketsRepo;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Tenant used when no auth layer is mounted in front of the API.
pub const DEFAULT_TENANT: &str = "t_default";

pub struct AppState {
    pub ctx: Arc<NodeContext>,
    pub command: CommandService,
    pub tickets: TradeTicketsRepo,
    pub evals: EvalResultsRepo,
}

impl AppState {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self {
            command: CommandService::new(ctx.clone()),
            tickets: TradeTicketsRepo::new(ctx.database.clone()),
            evals: EvalResultsRepo::new(ctx.database.clone()),
            ctx,
        }
    }
}

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/chat/command", post(chat::chat_command))
        // Trade tickets (ASSISTED_LIVE)
        .route("/api/v1/trade_tickets", get(trade_tickets::list_pending))
        .route("/api/v1/trade_tickets/by-run/:run_id", get(trade_tickets::by_run))
        .route("/api/v1/trade_tickets/:ticket_id", get(trade_tickets::by_id))
        .route("/api/v1/trade_tickets/:ticket_id/receipt", post(trade_tickets::submit_receipt))
        .route("/api/v1/trade_tickets/:ticket_id/cancel", post(trade_tickets::cancel))
        // Evals
        .route("/api/v1/evals/run/:run_id", get(evals::for_run))
        .route("/api/v1/evals/run/:run_id/details", get(evals::run_details))
        .route("/api/v1/evals/run/:run_id/explain", post(evals::explain_run))
        .route("/api/v1/evals/dashboard", get(evals::dashboard))
        .route("/api/v1/evals/runs", get(evals::recent_runs))
        .route("/api/v1/evals/conversations/:conversation_id", get(evals::for_conversation))
        .route("/api/v1/evals/summary", get(evals::summary))
        .route("/api/v1/evals/definitions", get(evals::definitions))
        .route("/api/v1/evals/definition/:eval_name", get(evals::definition))
        .layer(cors)
        .with_state(state)
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "server_time": chrono::Utc::now().to_rfc3339(),
    }))
}
