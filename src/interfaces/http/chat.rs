//! The chat command endpoint: input validation, dispatch to the command
//! service, display formatting, and the 500 safety net. Every response
//! carries the request id.

use super::{AppState, DEFAULT_TENANT, format};
use crate::application::command::CommandRequest;
use crate::domain::ids::new_request_id;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::error;

pub const MAX_COMMAND_LENGTH: usize = 5000;

#[derive(Debug, Deserialize)]
pub struct CommandRequestBody {
    pub text: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub confirmation_id: Option<String>,
    #[serde(default)]
    pub news_enabled: Option<bool>,
}

/// Strip control bytes and collapse runs of spaces/tabs; newlines survive
/// but never more than two in a row.
pub fn sanitize_text(raw: &str) -> String {
    let mut cleaned = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_control() && c != '\n' {
            if c == '\t' {
                cleaned.push(' ');
            }
            continue;
        }
        cleaned.push(c);
    }

    let mut out = String::with_capacity(cleaned.len());
    let mut spaces = 0usize;
    let mut newlines = 0usize;
    for c in cleaned.chars() {
        match c {
            ' ' => {
                spaces += 1;
                newlines = 0;
                if spaces == 1 {
                    out.push(' ');
                }
            }
            '\n' => {
                newlines += 1;
                spaces = 0;
                if newlines <= 2 {
                    out.push('\n');
                }
            }
            other => {
                spaces = 0;
                newlines = 0;
                out.push(other);
            }
        }
    }
    out.trim().to_string()
}

pub async fn chat_command(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CommandRequestBody>,
) -> Response {
    let request_id = new_request_id();

    let text = sanitize_text(&body.text);
    if text.is_empty() {
        return reply(
            StatusCode::OK,
            json!({
                "content": "Command text cannot be empty.",
                "run_id": null,
                "intent": "VALIDATION_FAILED",
                "status": "REJECTED",
                "reason_code": "VALIDATION_FAILED",
            }),
            &request_id,
        );
    }
    if text.chars().count() > MAX_COMMAND_LENGTH {
        return reply(
            StatusCode::OK,
            json!({
                "content": format!("Command text exceeds {} characters.", MAX_COMMAND_LENGTH),
                "run_id": null,
                "intent": "VALIDATION_FAILED",
                "status": "REJECTED",
                "reason_code": "VALIDATION_FAILED",
            }),
            &request_id,
        );
    }

    let request = CommandRequest {
        text,
        conversation_id: body.conversation_id,
        confirmation_id: body.confirmation_id,
        news_enabled: body.news_enabled,
    };

    match state.command.handle(&request, DEFAULT_TENANT, &request_id).await {
        Ok(outcome) => {
            let mut body = outcome.body;
            enhance_content(&mut body);
            reply(
                StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::OK),
                body,
                &request_id,
            )
        }
        Err(e) => {
            // Logging must never itself raise; keep it simple and bounded.
            error!(
                "chat_command_internal_error: {} | req={} | text={}",
                e.to_string().chars().take(200).collect::<String>(),
                request_id,
                request.text.chars().take(100).collect::<String>()
            );
            reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": {
                        "code": "INTERNAL_ERROR",
                        "message": format!("Command failed: {}", e.to_string().chars().take(200).collect::<String>()),
                        "request_id": request_id,
                    },
                    "content": "Something went wrong processing your request.",
                    "run_id": null,
                    "intent": "ERROR",
                    "status": "FAILED",
                }),
                &request_id,
            )
        }
    }
}

/// Upgrade structured payloads into display text. Formatting failures keep
/// the service's safe content; the response is already complete.
fn enhance_content(body: &mut Value) {
    if let Some(brief) = body.get("portfolio_brief").cloned()
        && body.get("status").and_then(|v| v.as_str()) == Some("COMPLETED")
    {
        let content = match body.get("queried_asset").and_then(|v| v.as_str()) {
            Some(asset) => format::format_asset_holdings_response(asset, &brief),
            None => format::format_portfolio_analysis(&brief),
        };
        body["content"] = json!(content);
    }

    if let Some(snapshot) = body.get("portfolio_snapshot").cloned() {
        body["content"] = json!(format::format_portfolio_snapshot(&snapshot));
    }
}

fn reply(status: StatusCode, mut body: Value, request_id: &str) -> Response {
    if let Some(map) = body.as_object_mut() {
        map.insert("request_id".to_string(), json!(request_id));
    }
    let mut response = (status, Json(body)).into_response();
    if let Ok(header) = request_id.parse() {
        response.headers_mut().insert("X-Request-ID", header);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_control_bytes() {
        assert_eq!(sanitize_text("buy\x00 $10\x07 of BTC"), "buy $10 of BTC");
        assert_eq!(sanitize_text("  a \t b  "), "a b");
    }

    #[test]
    fn test_sanitize_collapses_blank_lines() {
        assert_eq!(sanitize_text("a\n\n\n\nb"), "a\n\nb");
    }

    #[test]
    fn test_boundary_length_is_accepted() {
        let exactly = "a".repeat(MAX_COMMAND_LENGTH);
        assert_eq!(sanitize_text(&exactly).len(), MAX_COMMAND_LENGTH);
    }
}
