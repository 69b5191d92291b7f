use crate::domain::types::{Order, OrderSide};
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::{now_iso, parse_ts};
use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::Row;
use std::str::FromStr;

pub struct OrdersRepo {
    database: Database,
}

/// The last filled BUY for a tenant, used to resolve "sell my last purchase".
#[derive(Debug, Clone)]
pub struct LastPurchase {
    pub base_symbol: String,
    pub product_id: String,
    pub notional_usd: Decimal,
}

impl OrdersRepo {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    pub async fn insert(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                order_id, run_id, tenant_id, symbol, side, notional_usd,
                status, filled_qty, avg_fill_price, fees, client_order_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&order.order_id)
        .bind(&order.run_id)
        .bind(&order.tenant_id)
        .bind(&order.symbol)
        .bind(order.side.to_string())
        .bind(order.notional_usd.to_string())
        .bind(&order.status)
        .bind(order.filled_qty.map(|d| d.to_string()))
        .bind(order.avg_fill_price.map(|d| d.to_string()))
        .bind(order.fees.map(|d| d.to_string()))
        .bind(&order.client_order_id)
        .bind(order.created_at.to_rfc3339())
        .execute(&self.database.pool)
        .await
        .context("Failed to insert order")?;
        Ok(())
    }

    pub async fn update_fill(
        &self,
        order_id: &str,
        status: &str,
        filled_qty: Decimal,
        avg_fill_price: Decimal,
        fees: Decimal,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET status = ?, filled_qty = ?, avg_fill_price = ?, fees = ?, status_updated_at = ?
            WHERE order_id = ?
            "#,
        )
        .bind(status)
        .bind(filled_qty.to_string())
        .bind(avg_fill_price.to_string())
        .bind(fees.to_string())
        .bind(now_iso())
        .bind(order_id)
        .execute(&self.database.pool)
        .await
        .context("Failed to update order fill")?;
        Ok(())
    }

    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<Order>> {
        let rows = sqlx::query("SELECT * FROM orders WHERE run_id = ? ORDER BY created_at ASC")
            .bind(run_id)
            .fetch_all(&self.database.pool)
            .await
            .context("Failed to list orders for run")?;

        rows.into_iter().map(Self::map_row).collect()
    }

    pub async fn list_recent_for_tenant(&self, tenant_id: &str, limit: i64) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            "SELECT * FROM orders WHERE tenant_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.database.pool)
        .await
        .context("Failed to list recent orders")?;

        rows.into_iter().map(Self::map_row).collect()
    }

    /// Most recent filled BUY order for the tenant, if any.
    pub async fn find_last_purchase(&self, tenant_id: &str) -> Result<Option<LastPurchase>> {
        let row = sqlx::query(
            r#"
            SELECT symbol, notional_usd FROM orders
            WHERE tenant_id = ? AND side = 'BUY' AND status = 'FILLED'
            ORDER BY created_at DESC LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.database.pool)
        .await
        .context("Failed to query last purchase")?;

        Ok(row.map(|r| {
            let product_id: String = r.get("symbol");
            let notional_raw: String = r.get("notional_usd");
            LastPurchase {
                base_symbol: crate::domain::symbols::to_base(&product_id),
                product_id,
                notional_usd: Decimal::from_str(&notional_raw).unwrap_or_default(),
            }
        }))
    }

    fn map_row(row: sqlx::sqlite::SqliteRow) -> Result<Order> {
        let side_raw: String = row.try_get("side")?;
        let notional_raw: String = row.try_get("notional_usd")?;
        let filled_raw: Option<String> = row.try_get("filled_qty")?;
        let price_raw: Option<String> = row.try_get("avg_fill_price")?;
        let fees_raw: Option<String> = row.try_get("fees")?;
        let created_raw: String = row.try_get("created_at")?;

        Ok(Order {
            order_id: row.try_get("order_id")?,
            run_id: row.try_get("run_id")?,
            tenant_id: row.try_get("tenant_id")?,
            symbol: row.try_get("symbol")?,
            side: OrderSide::from_str(&side_raw)?,
            notional_usd: Decimal::from_str(&notional_raw).unwrap_or_default(),
            status: row.try_get("status")?,
            filled_qty: filled_raw.and_then(|s| Decimal::from_str(&s).ok()),
            avg_fill_price: price_raw.and_then(|s| Decimal::from_str(&s).ok()),
            fees: fees_raw.and_then(|s| Decimal::from_str(&s).ok()),
            client_order_id: row.try_get("client_order_id")?,
            created_at: parse_ts(&created_raw).unwrap_or_else(Utc::now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(run: &str, side: OrderSide, status: &str) -> Order {
        Order {
            order_id: crate::domain::ids::new_id("ord_"),
            run_id: run.to_string(),
            tenant_id: "t1".to_string(),
            symbol: "BTC-USD".to_string(),
            side,
            notional_usd: dec!(10),
            status: status.to_string(),
            filled_qty: None,
            avg_fill_price: None,
            fees: None,
            client_order_id: crate::domain::ids::new_id("cli_"),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_fill() {
        let db = Database::in_memory().await.unwrap();
        let repo = OrdersRepo::new(db);

        let o = order("run_1", OrderSide::Buy, "SUBMITTED");
        repo.insert(&o).await.unwrap();

        repo.update_fill(&o.order_id, "FILLED", dec!(0.0002), dec!(50000), dec!(0.06))
            .await
            .unwrap();

        let orders = repo.list_for_run("run_1").await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, "FILLED");
        assert_eq!(orders[0].filled_qty, Some(dec!(0.0002)));
        assert_eq!(orders[0].avg_fill_price, Some(dec!(50000)));
    }

    #[tokio::test]
    async fn test_find_last_purchase() {
        let db = Database::in_memory().await.unwrap();
        let repo = OrdersRepo::new(db);

        assert!(repo.find_last_purchase("t1").await.unwrap().is_none());

        let o = order("run_1", OrderSide::Buy, "FILLED");
        repo.insert(&o).await.unwrap();
        // A SELL after the BUY must not shadow the purchase
        repo.insert(&order("run_2", OrderSide::Sell, "FILLED"))
            .await
            .unwrap();

        let last = repo.find_last_purchase("t1").await.unwrap().unwrap();
        assert_eq!(last.base_symbol, "BTC");
        assert_eq!(last.product_id, "BTC-USD");
    }
}
