//! Tool-call audit trail.
//!
//! Every external call made on behalf of a run gets a row with its request,
//! response, status, latency and attempt number. Secret redaction runs over
//! the payload tree before anything is persisted; callers never have to
//! strip credentials themselves.

use crate::domain::ids::new_id;
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::events::RunEventsRepo;
use crate::infrastructure::persistence::repositories::now_iso;
use anyhow::{Context, Result};
use serde_json::Value;
use tracing::warn;

const SENSITIVE_KEYS: &[&str] = &[
    "api_key",
    "api_secret",
    "private_key",
    "cb-access-key",
    "cb-access-sign",
    "authorization",
];

pub const REDACTED: &str = "***REDACTED***";

/// Replace the value of any key whose name contains a sensitive pattern
/// (case-insensitive), recursively through objects and arrays.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                let key_lower = key.to_lowercase();
                if SENSITIVE_KEYS.iter().any(|s| key_lower.contains(s)) {
                    out.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(key.clone(), redact(val));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallStatus {
    Success,
    Failed,
    Timeout,
}

impl std::fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolCallStatus::Success => "SUCCESS",
            ToolCallStatus::Failed => "FAILED",
            ToolCallStatus::Timeout => "TIMEOUT",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct ToolCallRecord<'a> {
    pub run_id: &'a str,
    pub node_id: Option<&'a str>,
    pub tool_name: &'a str,
    pub mcp_server: &'a str,
    pub request: Value,
    pub response: Option<Value>,
    pub status: ToolCallStatus,
    pub latency_ms: i64,
    pub http_status: Option<u16>,
    pub error_text: Option<String>,
    pub attempt: u32,
}

/// Writes audit rows and mirrors TOOL_CALL / TOOL_RESULT / RETRY events to
/// the best-effort event bus.
pub struct ToolCallLog {
    database: Database,
    events: RunEventsRepo,
}

impl ToolCallLog {
    pub fn new(database: Database) -> Self {
        let events = RunEventsRepo::new(database.clone());
        Self { database, events }
    }

    pub async fn record(&self, record: ToolCallRecord<'_>) -> Result<String> {
        let tool_call_id = new_id("tool_");
        let safe_request = redact(&record.request);
        let safe_response = record.response.as_ref().map(redact);

        sqlx::query(
            r#"
            INSERT INTO tool_calls (
                id, run_id, node_id, tool_name, mcp_server,
                request_json, response_json, status,
                latency_ms, http_status, error_text, attempt, ts
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&tool_call_id)
        .bind(record.run_id)
        .bind(record.node_id)
        .bind(record.tool_name)
        .bind(record.mcp_server)
        .bind(safe_request.to_string())
        .bind(safe_response.as_ref().map(Value::to_string))
        .bind(record.status.to_string())
        .bind(record.latency_ms)
        .bind(record.http_status.map(|s| s as i64))
        .bind(&record.error_text)
        .bind(record.attempt as i64)
        .bind(now_iso())
        .execute(&self.database.pool)
        .await
        .context("Failed to record tool call")?;

        // Event emission is best effort; a bus failure never fails the call.
        if record.attempt == 1 {
            self.events
                .emit(
                    record.run_id,
                    "TOOL_CALL",
                    &serde_json::json!({
                        "tool_call_id": tool_call_id,
                        "tool_name": record.tool_name,
                        "mcp_server": record.mcp_server,
                        "request_summary": summarize_request(&safe_request),
                        "attempt": record.attempt,
                    }),
                )
                .await;
        } else {
            self.events
                .emit(
                    record.run_id,
                    "RETRY",
                    &serde_json::json!({
                        "tool_call_id": tool_call_id,
                        "tool_name": record.tool_name,
                        "attempt": record.attempt,
                    }),
                )
                .await;
        }

        self.events
            .emit(
                record.run_id,
                "TOOL_RESULT",
                &serde_json::json!({
                    "tool_call_id": tool_call_id,
                    "tool_name": record.tool_name,
                    "status": record.status.to_string(),
                    "latency_ms": record.latency_ms,
                    "response_summary": summarize_response(safe_response.as_ref(), record.status, record.error_text.as_deref()),
                }),
            )
            .await;

        Ok(tool_call_id)
    }

    /// Variant for callers that must not propagate audit failures.
    pub async fn record_best_effort(&self, record: ToolCallRecord<'_>) -> Option<String> {
        match self.record(record).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Tool call audit write failed: {}", e);
                None
            }
        }
    }
}

fn summarize_request(request: &Value) -> String {
    let mut parts = Vec::new();
    if let Some(sym) = request.get("product_id").or_else(|| request.get("symbol")) {
        parts.push(format!("symbol={}", sym.as_str().unwrap_or_default()));
    }
    if let Some(amount) = request.get("notional_usd") {
        parts.push(format!("amount=${}", amount));
    }
    if let Some(side) = request.get("side") {
        parts.push(format!("side={}", side.as_str().unwrap_or_default()));
    }
    if parts.is_empty() {
        let raw = request.to_string();
        raw.chars().take(100).collect()
    } else {
        parts.join(" | ")
    }
}

fn summarize_response(
    response: Option<&Value>,
    status: ToolCallStatus,
    error_text: Option<&str>,
) -> String {
    if status != ToolCallStatus::Success
        && let Some(err) = error_text
    {
        return format!("Error: {}", err.chars().take(100).collect::<String>());
    }
    let Some(response) = response else {
        return "No response details".to_string();
    };
    if let Some(order_id) = response.get("order_id") {
        return format!("Order placed: {}", order_id.as_str().unwrap_or_default());
    }
    if let Some(count) = response.get("candles_count") {
        return format!("Fetched {} candles", count);
    }
    if let Some(count) = response.get("fills_count") {
        return format!("Found {} fills", count);
    }
    response.to_string().chars().take(100).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redact_sensitive_keys() {
        let payload = json!({
            "product_id": "BTC-USD",
            "api_key": "sk-live-123",
            "headers": {
                "CB-ACCESS-KEY": "abc",
                "CB-ACCESS-SIGN": "def",
                "Authorization": "Bearer xyz",
                "Accept": "application/json"
            },
            "nested": [{"coinbase_api_secret": "shh"}]
        });

        let safe = redact(&payload);
        assert_eq!(safe["product_id"], "BTC-USD");
        assert_eq!(safe["api_key"], REDACTED);
        assert_eq!(safe["headers"]["CB-ACCESS-KEY"], REDACTED);
        assert_eq!(safe["headers"]["CB-ACCESS-SIGN"], REDACTED);
        assert_eq!(safe["headers"]["Authorization"], REDACTED);
        assert_eq!(safe["headers"]["Accept"], "application/json");
        assert_eq!(safe["nested"][0]["coinbase_api_secret"], REDACTED);
    }

    #[test]
    fn test_redacted_payload_has_no_secret_values() {
        let payload = json!({"api_key": "sk-live-123", "Authorization": "Bearer tok"});
        let safe = redact(&payload).to_string();
        assert!(!safe.contains("sk-live-123"));
        assert!(!safe.contains("Bearer tok"));
    }

    #[tokio::test]
    async fn test_record_redacts_before_persisting() {
        use sqlx::Row;

        let db = Database::in_memory().await.unwrap();
        let log = ToolCallLog::new(db.clone());

        log.record(ToolCallRecord {
            run_id: "run_1",
            node_id: Some("node_1"),
            tool_name: "place_order",
            mcp_server: "coinbase_provider",
            request: json!({"product_id": "BTC-USD", "api_key": "sk-live-9"}),
            response: Some(json!({"order_id": "ord_1"})),
            status: ToolCallStatus::Success,
            latency_ms: 42,
            http_status: Some(200),
            error_text: None,
            attempt: 1,
        })
        .await
        .unwrap();

        let row = sqlx::query("SELECT request_json FROM tool_calls LIMIT 1")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        let raw: String = row.get("request_json");
        assert!(!raw.contains("sk-live-9"));
        assert!(raw.contains(REDACTED));
    }
}
