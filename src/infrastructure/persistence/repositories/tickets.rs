//! Trade tickets for ASSISTED_LIVE stock orders. The user executes the
//! order manually in their brokerage and submits a receipt; until then the
//! ticket stays PENDING with a TTL.

use crate::domain::ids::new_id;
use crate::domain::types::{OrderSide, TicketStatus};
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::{now_iso, parse_ts};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::str::FromStr;

pub const TICKET_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeTicket {
    pub id: String,
    pub run_id: String,
    pub tenant_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub notional_usd: Decimal,
    pub tif: String,
    pub status: TicketStatus,
    pub receipt: Option<TicketReceipt>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketReceipt {
    pub broker_order_id: Option<String>,
    pub filled_qty: Option<Decimal>,
    pub filled_price: Option<Decimal>,
    pub fees: Option<Decimal>,
    pub fill_time: Option<String>,
    pub notes: Option<String>,
}

pub struct TradeTicketsRepo {
    database: Database,
}

impl TradeTicketsRepo {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    pub async fn create(
        &self,
        run_id: &str,
        tenant_id: &str,
        symbol: &str,
        side: OrderSide,
        notional_usd: Decimal,
    ) -> Result<String> {
        let id = new_id("tick_");
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO trade_tickets (
                id, run_id, tenant_id, symbol, side, notional_usd, tif, status, created_at, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'DAY', 'PENDING', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(run_id)
        .bind(tenant_id)
        .bind(symbol)
        .bind(side.to_string())
        .bind(notional_usd.to_string())
        .bind(now.to_rfc3339())
        .bind((now + Duration::hours(TICKET_TTL_HOURS)).to_rfc3339())
        .execute(&self.database.pool)
        .await
        .context("Failed to create trade ticket")?;
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Option<TradeTicket>> {
        let row = sqlx::query("SELECT * FROM trade_tickets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.database.pool)
            .await
            .context("Failed to load trade ticket")?;
        row.map(Self::map_row).transpose()
    }

    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<TradeTicket>> {
        let rows = sqlx::query("SELECT * FROM trade_tickets WHERE run_id = ? ORDER BY created_at ASC")
            .bind(run_id)
            .fetch_all(&self.database.pool)
            .await?;
        rows.into_iter().map(Self::map_row).collect()
    }

    pub async fn list_pending(&self, tenant_id: &str) -> Result<Vec<TradeTicket>> {
        let rows = sqlx::query(
            "SELECT * FROM trade_tickets WHERE tenant_id = ? AND status = 'PENDING' ORDER BY created_at DESC",
        )
        .bind(tenant_id)
        .fetch_all(&self.database.pool)
        .await?;
        rows.into_iter().map(Self::map_row).collect()
    }

    /// Attach an execution receipt and mark EXECUTED. Single-use: only a
    /// PENDING ticket accepts a receipt.
    pub async fn submit_receipt(&self, id: &str, receipt: &TicketReceipt) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE trade_tickets
            SET status = 'EXECUTED', receipt_json = ?, updated_at = ?
            WHERE id = ? AND status = 'PENDING'
            "#,
        )
        .bind(serde_json::to_string(receipt)?)
        .bind(now_iso())
        .bind(id)
        .execute(&self.database.pool)
        .await
        .context("Failed to submit ticket receipt")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE trade_tickets SET status = 'CANCELLED', updated_at = ? WHERE id = ? AND status = 'PENDING'",
        )
        .bind(now_iso())
        .bind(id)
        .execute(&self.database.pool)
        .await
        .context("Failed to cancel ticket")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_expired(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE trade_tickets SET status = 'EXPIRED', updated_at = ? WHERE id = ? AND status = 'PENDING'",
        )
        .bind(now_iso())
        .bind(id)
        .execute(&self.database.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    fn map_row(row: sqlx::sqlite::SqliteRow) -> Result<TradeTicket> {
        let side_raw: String = row.try_get("side")?;
        let status_raw: String = row.try_get("status")?;
        let notional_raw: String = row.try_get("notional_usd")?;
        let receipt_raw: Option<String> = row.try_get("receipt_json")?;
        let created_raw: String = row.try_get("created_at")?;
        let expires_raw: String = row.try_get("expires_at")?;

        let status = match status_raw.as_str() {
            "PENDING" => TicketStatus::Pending,
            "EXECUTED" => TicketStatus::Executed,
            "CANCELLED" => TicketStatus::Cancelled,
            "EXPIRED" => TicketStatus::Expired,
            other => anyhow::bail!("Invalid ticket status: {}", other),
        };

        Ok(TradeTicket {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            tenant_id: row.try_get("tenant_id")?,
            symbol: row.try_get("symbol")?,
            side: OrderSide::from_str(&side_raw)?,
            notional_usd: Decimal::from_str(&notional_raw).unwrap_or_default(),
            tif: row.try_get("tif")?,
            status,
            receipt: receipt_raw.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: parse_ts(&created_raw).unwrap_or_else(Utc::now),
            expires_at: parse_ts(&expires_raw).unwrap_or_else(Utc::now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_ticket_receipt_is_single_use() {
        let db = Database::in_memory().await.unwrap();
        let repo = TradeTicketsRepo::new(db);

        let id = repo
            .create("run_1", "t1", "AAPL", OrderSide::Buy, dec!(50))
            .await
            .unwrap();

        let receipt = TicketReceipt {
            broker_order_id: Some("brk_1".to_string()),
            filled_qty: Some(dec!(0.25)),
            filled_price: Some(dec!(200)),
            fees: Some(dec!(0)),
            fill_time: None,
            notes: None,
        };

        assert!(repo.submit_receipt(&id, &receipt).await.unwrap());
        assert!(!repo.submit_receipt(&id, &receipt).await.unwrap());
        assert!(!repo.cancel(&id).await.unwrap());

        let ticket = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(ticket.status, TicketStatus::Executed);
        assert_eq!(ticket.receipt.unwrap().filled_qty, Some(dec!(0.25)));
    }

    #[tokio::test]
    async fn test_one_active_ticket_listing() {
        let db = Database::in_memory().await.unwrap();
        let repo = TradeTicketsRepo::new(db);

        let id = repo
            .create("run_1", "t1", "MSFT", OrderSide::Sell, dec!(100))
            .await
            .unwrap();

        let pending = repo.list_pending("t1").await.unwrap();
        assert_eq!(pending.len(), 1);

        repo.cancel(&id).await.unwrap();
        assert!(repo.list_pending("t1").await.unwrap().is_empty());
    }
}
