//! Pushover notification dispatcher.
//!
//! Strictly best-effort: a delivery failure is recorded in
//! `notification_events` and never surfaces to the caller. Unconfigured
//! deployments record every attempt as skipped so audits can tell "not
//! sent" from "not configured".

use crate::domain::ports::{NotificationRequest, NotificationStatus, Notifier};
use crate::infrastructure::http_client_factory::HttpClientFactory;
use crate::infrastructure::persistence::Database;
use crate::infrastructure::persistence::repositories::events::NotificationEventsRepo;
use async_trait::async_trait;
use tracing::warn;

const PUSHOVER_API_URL: &str = "https://api.pushover.net/1/messages.json";
const CHANNEL: &str = "pushover";

pub struct PushoverNotifier {
    client: reqwest_middleware::ClientWithMiddleware,
    token: String,
    user_key: String,
    enabled: bool,
    events: NotificationEventsRepo,
    api_url: String,
}

impl PushoverNotifier {
    pub fn new(database: Database, token: String, user_key: String, enabled: bool) -> Self {
        Self {
            // Retrying client: transient pushover failures are absorbed
            client: HttpClientFactory::create_client(),
            token,
            user_key,
            enabled,
            events: NotificationEventsRepo::new(database),
            api_url: PUSHOVER_API_URL.to_string(),
        }
    }

    /// Record a deliberately skipped notification (e.g. PAPER mode pushes).
    pub async fn record_skipped(&self, action: &str, reason: &str, run_id: Option<&str>) {
        self.events
            .record(CHANNEL, NotificationStatus::Skipped, action, run_id, Some(reason))
            .await;
    }
}

#[async_trait]
impl Notifier for PushoverNotifier {
    async fn notify(&self, request: NotificationRequest) -> NotificationStatus {
        if !self.enabled {
            self.events
                .record(
                    CHANNEL,
                    NotificationStatus::Skipped,
                    &request.action,
                    request.run_id.as_deref(),
                    Some("pushover not configured"),
                )
                .await;
            return NotificationStatus::Skipped;
        }

        let result = self
            .client
            .post(&self.api_url)
            .form(&[
                ("token", self.token.as_str()),
                ("user", self.user_key.as_str()),
                ("title", request.title.as_str()),
                ("message", request.message.as_str()),
            ])
            .send()
            .await;

        let status = match result {
            Ok(resp) if resp.status().is_success() => NotificationStatus::Sent,
            Ok(resp) => {
                warn!(
                    "Pushover delivery failed for {}: HTTP {}",
                    request.action,
                    resp.status()
                );
                NotificationStatus::Failed
            }
            Err(e) => {
                warn!("Pushover delivery failed for {}: {}", request.action, e);
                NotificationStatus::Failed
            }
        };

        let error = match status {
            NotificationStatus::Failed => Some("delivery failed"),
            _ => None,
        };
        self.events
            .record(CHANNEL, status, &request.action, request.run_id.as_deref(), error)
            .await;

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    #[tokio::test]
    async fn test_unconfigured_notifier_skips_and_records() {
        let db = Database::in_memory().await.unwrap();
        let notifier =
            PushoverNotifier::new(db.clone(), String::new(), String::new(), false);

        let status = notifier
            .notify(NotificationRequest {
                action: "pending_confirmation".to_string(),
                title: "Trade pending".to_string(),
                message: "BUY $10 of BTC".to_string(),
                run_id: None,
            })
            .await;

        assert_eq!(status, NotificationStatus::Skipped);

        let row = sqlx::query("SELECT status, action FROM notification_events LIMIT 1")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        let status: String = row.get("status");
        let action: String = row.get("action");
        assert_eq!(status, "skipped");
        assert_eq!(action, "pending_confirmation");
    }

    #[tokio::test]
    async fn test_record_skipped_keeps_reason() {
        let db = Database::in_memory().await.unwrap();
        let notifier = PushoverNotifier::new(db.clone(), String::new(), String::new(), false);

        notifier
            .record_skipped("portfolio_snapshot", "PAPER mode", Some("run_1"))
            .await;

        let row = sqlx::query("SELECT error, run_id FROM notification_events LIMIT 1")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        let error: Option<String> = row.get("error");
        let run_id: Option<String> = row.get("run_id");
        assert_eq!(error.as_deref(), Some("PAPER mode"));
        assert_eq!(run_id.as_deref(), Some("run_1"));
    }
}
