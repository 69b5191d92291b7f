//! Best-effort event rows: run step progress and notification outcomes.
//! Writers swallow their own failures; an event that cannot be recorded
//! must never fail the operation that produced it.

use crate::domain::ports::NotificationStatus;
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::now_iso;
use anyhow::Result;
use sqlx::Row;
use tracing::warn;

pub struct RunEventsRepo {
    database: Database,
}

impl RunEventsRepo {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    /// Append an event. Best effort: failures are logged and swallowed.
    pub async fn emit(&self, run_id: &str, event_type: &str, payload: &serde_json::Value) {
        let result = sqlx::query(
            "INSERT INTO run_events (run_id, event_type, payload_json, ts) VALUES (?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(event_type)
        .bind(payload.to_string())
        .bind(now_iso())
        .execute(&self.database.pool)
        .await;

        if let Err(e) = result {
            warn!("Failed to emit run event {} for {}: {}", event_type, run_id, e);
        }
    }

    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let rows = sqlx::query(
            "SELECT event_type, payload_json FROM run_events WHERE run_id = ? ORDER BY id ASC",
        )
        .bind(run_id)
        .fetch_all(&self.database.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let event_type: String = r.get("event_type");
                let raw: String = r.get("payload_json");
                (event_type, serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null))
            })
            .collect())
    }
}

pub struct NotificationEventsRepo {
    database: Database,
}

impl NotificationEventsRepo {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    pub async fn record(
        &self,
        channel: &str,
        status: NotificationStatus,
        action: &str,
        run_id: Option<&str>,
        error: Option<&str>,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO notification_events (channel, status, action, run_id, error, ts)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(channel)
        .bind(status.to_string())
        .bind(action)
        .bind(run_id)
        .bind(error)
        .bind(now_iso())
        .execute(&self.database.pool)
        .await;

        if let Err(e) = result {
            warn!("Failed to record notification event for {}: {}", action, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_emit_and_list_events() {
        let db = Database::in_memory().await.unwrap();
        let repo = RunEventsRepo::new(db);

        repo.emit("run_1", "STARTED", &json!({"step": "research"})).await;
        repo.emit("run_1", "FINISHED", &json!({"step": "research", "summary": "ok"}))
            .await;

        let events = repo.list_for_run("run_1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "STARTED");
        assert_eq!(events[1].1["summary"], "ok");
    }
}
