//! Trade ticket endpoints for the ASSISTED_LIVE workflow. The user
//! executes the ticket manually and posts the receipt back.

use super::{AppState, DEFAULT_TENANT};
use crate::infrastructure::persistence::repositories::tickets::TicketReceipt;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub async fn list_pending(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.tickets.list_pending(DEFAULT_TENANT).await {
        Ok(tickets) => (StatusCode::OK, Json(json!({ "tickets": tickets }))),
        Err(e) => internal_error(e),
    }
}

pub async fn by_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    match state.tickets.list_for_run(&run_id).await {
        Ok(tickets) => (StatusCode::OK, Json(json!({ "tickets": tickets }))),
        Err(e) => internal_error(e),
    }
}

pub async fn by_id(
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<String>,
) -> impl IntoResponse {
    match state.tickets.get(&ticket_id).await {
        Ok(Some(mut ticket)) => {
            // TTL expiry observed on read
            if ticket.status == crate::domain::types::TicketStatus::Pending
                && Utc::now() > ticket.expires_at
            {
                let _ = state.tickets.mark_expired(&ticket_id).await;
                ticket.status = crate::domain::types::TicketStatus::Expired;
            }
            (StatusCode::OK, Json(json!({ "ticket": ticket })))
        }
        Ok(None) => not_found(&ticket_id),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReceiptBody {
    #[serde(default)]
    pub broker_order_id: Option<String>,
    #[serde(default)]
    pub filled_qty: Option<Decimal>,
    #[serde(default)]
    pub filled_price: Option<Decimal>,
    #[serde(default)]
    pub fees: Option<Decimal>,
    #[serde(default)]
    pub fill_time: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub async fn submit_receipt(
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<String>,
    Json(body): Json<ReceiptBody>,
) -> impl IntoResponse {
    let receipt = TicketReceipt {
        broker_order_id: body.broker_order_id,
        filled_qty: body.filled_qty,
        filled_price: body.filled_price,
        fees: body.fees,
        fill_time: body.fill_time,
        notes: body.notes,
    };
    match state.tickets.submit_receipt(&ticket_id, &receipt).await {
        Ok(true) => (
            StatusCode::OK,
            Json(json!({ "ticket_id": ticket_id, "status": "EXECUTED" })),
        ),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": {
                    "code": "TICKET_NOT_PENDING",
                    "message": "Ticket is not pending; receipt not accepted.",
                }
            })),
        ),
        Err(e) => internal_error(e),
    }
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<String>,
) -> impl IntoResponse {
    match state.tickets.cancel(&ticket_id).await {
        Ok(true) => (
            StatusCode::OK,
            Json(json!({ "ticket_id": ticket_id, "status": "CANCELLED" })),
        ),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": {
                    "code": "TICKET_NOT_PENDING",
                    "message": "Ticket is not pending; nothing to cancel.",
                }
            })),
        ),
        Err(e) => internal_error(e),
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

fn not_found(ticket_id: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": { "code": "TICKET_NOT_FOUND", "message": format!("No ticket {}", ticket_id) }
        })),
    )
}
