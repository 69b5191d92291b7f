//! Durable pending-trade confirmations.
//!
//! The single-use CONFIRM transition is a compare-and-set on the status
//! column: `UPDATE ... WHERE status = 'PENDING'`. Concurrent confirms are
//! safe because exactly one UPDATE matches; the losers observe the
//! terminal row instead.

use crate::domain::ids::new_id;
use crate::domain::types::{ConfirmationStatus, TradeProposal};
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::{now_iso, parse_ts};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

pub const DEFAULT_TTL_SECONDS: i64 = 300;

#[derive(Debug, Clone)]
pub struct Confirmation {
    pub id: String,
    pub tenant_id: String,
    pub conversation_id: String,
    pub proposal: TradeProposal,
    pub mode: String,
    pub status: ConfirmationStatus,
    pub run_id: Option<String>,
    pub insight: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Confirmation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ConfirmationStatus::Pending && now > self.expires_at
    }
}

pub struct TradeConfirmationsRepo {
    database: Database,
}

impl TradeConfirmationsRepo {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    pub async fn create_pending(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        proposal: &TradeProposal,
        ttl_seconds: i64,
    ) -> Result<String> {
        let id = new_id("conf_");
        let now = Utc::now();
        let expires_at = now + Duration::seconds(ttl_seconds);

        sqlx::query(
            r#"
            INSERT INTO trade_confirmations (
                id, tenant_id, conversation_id, proposal_json, mode, status, created_at, expires_at
            ) VALUES (?, ?, ?, ?, ?, 'PENDING', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(tenant_id)
        .bind(conversation_id)
        .bind(serde_json::to_string(proposal)?)
        .bind(proposal.mode.to_string())
        .bind(now.to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .execute(&self.database.pool)
        .await
        .context("Failed to create pending confirmation")?;

        info!(
            "confirmation_created: conf={} tenant={} conv={} mode={} asset={} amount={}",
            id, tenant_id, conversation_id, proposal.mode, proposal.asset, proposal.amount_usd
        );
        Ok(id)
    }

    pub async fn get_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<Confirmation>> {
        let row = sqlx::query(
            "SELECT * FROM trade_confirmations WHERE id = ? AND tenant_id = ?",
        )
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.database.pool)
        .await
        .context("Failed to load confirmation")?;

        row.map(Self::map_row).transpose()
    }

    pub async fn get_latest_pending_for_conversation(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Confirmation>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM trade_confirmations
            WHERE conversation_id = ? AND tenant_id = ? AND status = 'PENDING'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(conversation_id)
        .bind(tenant_id)
        .fetch_optional(&self.database.pool)
        .await
        .context("Failed to load pending confirmation for conversation")?;

        row.map(Self::map_row).transpose()
    }

    /// Mark confirmation as CONFIRMED (single-use, idempotent).
    ///
    /// The `AND status = 'PENDING'` predicate makes concurrent requests
    /// safe: only the first one succeeds, later ones return false.
    pub async fn mark_confirmed(&self, tenant_id: &str, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE trade_confirmations
            SET status = 'CONFIRMED', confirmed_at = ?
            WHERE id = ? AND tenant_id = ? AND status = 'PENDING'
            "#,
        )
        .bind(now_iso())
        .bind(id)
        .bind(tenant_id)
        .execute(&self.database.pool)
        .await
        .context("Failed to mark confirmation confirmed")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_cancelled(&self, tenant_id: &str, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE trade_confirmations
            SET status = 'CANCELLED'
            WHERE id = ? AND tenant_id = ? AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .execute(&self.database.pool)
        .await
        .context("Failed to mark confirmation cancelled")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_expired(&self, tenant_id: &str, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE trade_confirmations
            SET status = 'EXPIRED'
            WHERE id = ? AND tenant_id = ? AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .execute(&self.database.pool)
        .await
        .context("Failed to mark confirmation expired")?;

        Ok(result.rows_affected() > 0)
    }

    /// Update the proposal on a staged confirmation (used when the selection
    /// engine locks in a concrete product id).
    pub async fn update_proposal(&self, id: &str, proposal: &TradeProposal) -> Result<()> {
        sqlx::query("UPDATE trade_confirmations SET proposal_json = ? WHERE id = ?")
            .bind(serde_json::to_string(proposal)?)
            .bind(id)
            .execute(&self.database.pool)
            .await
            .context("Failed to update confirmation proposal")?;
        Ok(())
    }

    /// Persist the pre-confirm insight on a confirmation row.
    pub async fn update_insight(&self, id: &str, insight: &serde_json::Value) -> Result<()> {
        sqlx::query("UPDATE trade_confirmations SET insight_json = ? WHERE id = ?")
            .bind(serde_json::to_string(insight)?)
            .bind(id)
            .execute(&self.database.pool)
            .await
            .context("Failed to update confirmation insight")?;
        Ok(())
    }

    /// Record the run created from this confirmation so duplicate CONFIRMs
    /// can replay the same run_id.
    pub async fn set_run_id(&self, id: &str, run_id: &str) -> Result<()> {
        sqlx::query("UPDATE trade_confirmations SET run_id = ? WHERE id = ?")
            .bind(run_id)
            .bind(id)
            .execute(&self.database.pool)
            .await
            .context("Failed to set run id on confirmation")?;
        Ok(())
    }

    fn map_row(row: sqlx::sqlite::SqliteRow) -> Result<Confirmation> {
        let proposal_raw: String = row.try_get("proposal_json")?;
        let proposal: TradeProposal =
            serde_json::from_str(&proposal_raw).context("Malformed proposal_json")?;
        let status_raw: String = row.try_get("status")?;
        let insight_raw: Option<String> = row.try_get("insight_json")?;
        let created_raw: String = row.try_get("created_at")?;
        let expires_raw: String = row.try_get("expires_at")?;

        Ok(Confirmation {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            conversation_id: row.try_get("conversation_id")?,
            proposal,
            mode: row.try_get("mode")?,
            status: ConfirmationStatus::from_str(&status_raw)?,
            run_id: row.try_get("run_id")?,
            insight: insight_raw.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: parse_ts(&created_raw).unwrap_or_else(Utc::now),
            // Malformed expiry reads as already expired
            expires_at: parse_ts(&expires_raw).unwrap_or_else(|| Utc::now() - Duration::seconds(1)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{AssetClass, ExecutionMode, OrderSide};
    use rust_decimal_macros::dec;

    fn proposal() -> TradeProposal {
        TradeProposal {
            side: OrderSide::Buy,
            asset: "BTC".to_string(),
            amount_usd: dec!(10),
            mode: ExecutionMode::Paper,
            asset_class: AssetClass::Crypto,
            lookback_hours: 24.0,
            is_most_profitable: false,
            news_enabled: true,
            locked_product_id: Some("BTC-USD".to_string()),
            tradability_verified: false,
            auto_sell: None,
            selection_result: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_pending() {
        let db = Database::in_memory().await.unwrap();
        let repo = TradeConfirmationsRepo::new(db);

        let id = repo
            .create_pending("t1", "c1", &proposal(), DEFAULT_TTL_SECONDS)
            .await
            .unwrap();

        let conf = repo.get_by_id("t1", &id).await.unwrap().unwrap();
        assert_eq!(conf.status, ConfirmationStatus::Pending);
        assert_eq!(conf.proposal.asset, "BTC");
        assert!(conf.expires_at > conf.created_at);

        // Tenant scoping
        assert!(repo.get_by_id("t2", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_confirmed_is_single_use() {
        let db = Database::in_memory().await.unwrap();
        let repo = TradeConfirmationsRepo::new(db);

        let id = repo
            .create_pending("t1", "c1", &proposal(), DEFAULT_TTL_SECONDS)
            .await
            .unwrap();

        assert!(repo.mark_confirmed("t1", &id).await.unwrap());
        assert!(!repo.mark_confirmed("t1", &id).await.unwrap());
        assert!(!repo.mark_cancelled("t1", &id).await.unwrap());

        let conf = repo.get_by_id("t1", &id).await.unwrap().unwrap();
        assert_eq!(conf.status, ConfirmationStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_concurrent_confirms_one_winner() {
        let db = Database::in_memory().await.unwrap();
        let repo = std::sync::Arc::new(TradeConfirmationsRepo::new(db));

        let id = repo
            .create_pending("t1", "c1", &proposal(), DEFAULT_TTL_SECONDS)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = repo.clone();
            let id = id.clone();
            handles.push(tokio::spawn(
                async move { repo.mark_confirmed("t1", &id).await },
            ));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_cancel_then_confirm_is_noop() {
        let db = Database::in_memory().await.unwrap();
        let repo = TradeConfirmationsRepo::new(db);

        let id = repo
            .create_pending("t1", "c1", &proposal(), DEFAULT_TTL_SECONDS)
            .await
            .unwrap();

        assert!(repo.mark_cancelled("t1", &id).await.unwrap());
        assert!(!repo.mark_confirmed("t1", &id).await.unwrap());

        let conf = repo.get_by_id("t1", &id).await.unwrap().unwrap();
        assert_eq!(conf.status, ConfirmationStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_latest_pending_for_conversation() {
        let db = Database::in_memory().await.unwrap();
        let repo = TradeConfirmationsRepo::new(db);

        assert!(repo
            .get_latest_pending_for_conversation("t1", "c1")
            .await
            .unwrap()
            .is_none());

        let first = repo
            .create_pending("t1", "c1", &proposal(), DEFAULT_TTL_SECONDS)
            .await
            .unwrap();
        repo.mark_cancelled("t1", &first).await.unwrap();

        let second = repo
            .create_pending("t1", "c1", &proposal(), DEFAULT_TTL_SECONDS)
            .await
            .unwrap();

        let latest = repo
            .get_latest_pending_for_conversation("t1", "c1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, second);
    }

    #[tokio::test]
    async fn test_ttl_expiry_observed_on_read() {
        let db = Database::in_memory().await.unwrap();
        let repo = TradeConfirmationsRepo::new(db);

        let id = repo.create_pending("t1", "c1", &proposal(), -1).await.unwrap();
        let conf = repo.get_by_id("t1", &id).await.unwrap().unwrap();
        assert!(conf.is_expired(Utc::now()));

        assert!(repo.mark_expired("t1", &id).await.unwrap());
        let conf = repo.get_by_id("t1", &id).await.unwrap().unwrap();
        assert_eq!(conf.status, ConfirmationStatus::Expired);
    }
}
