use crate::domain::ids::new_id;
use crate::domain::portfolio::PortfolioBrief;
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::{now_iso, parse_ts};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use sqlx::Row;
use std::collections::HashMap;

pub struct PortfolioRepo {
    database: Database,
}

#[derive(Debug, Clone)]
pub struct PortfolioSnapshot {
    pub snapshot_id: String,
    pub run_id: Option<String>,
    pub tenant_id: String,
    pub balances: HashMap<String, Decimal>,
    pub positions: HashMap<String, Decimal>,
    pub total_value_usd: f64,
    pub ts: DateTime<Utc>,
}

impl PortfolioRepo {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    pub async fn save_snapshot(
        &self,
        run_id: Option<&str>,
        tenant_id: &str,
        balances: &HashMap<String, Decimal>,
        positions: &HashMap<String, Decimal>,
        total_value_usd: Decimal,
    ) -> Result<String> {
        let snapshot_id = new_id("snap_");
        sqlx::query(
            r#"
            INSERT INTO portfolio_snapshots (
                snapshot_id, run_id, tenant_id, balances_json, positions_json, total_value_usd, ts
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot_id)
        .bind(run_id)
        .bind(tenant_id)
        .bind(serde_json::to_string(balances)?)
        .bind(serde_json::to_string(positions)?)
        .bind(total_value_usd.to_f64().unwrap_or(0.0))
        .bind(now_iso())
        .execute(&self.database.pool)
        .await
        .context("Failed to save portfolio snapshot")?;
        Ok(snapshot_id)
    }

    pub async fn latest_snapshot(&self, tenant_id: &str) -> Result<Option<PortfolioSnapshot>> {
        let row = sqlx::query(
            "SELECT * FROM portfolio_snapshots WHERE tenant_id = ? ORDER BY ts DESC LIMIT 1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.database.pool)
        .await
        .context("Failed to load latest portfolio snapshot")?;

        Ok(row.map(|r| {
            let balances_raw: String = r.get("balances_json");
            let positions_raw: String = r.get("positions_json");
            let ts_raw: String = r.get("ts");
            PortfolioSnapshot {
                snapshot_id: r.get("snapshot_id"),
                run_id: r.get("run_id"),
                tenant_id: r.get("tenant_id"),
                balances: serde_json::from_str(&balances_raw).unwrap_or_default(),
                positions: serde_json::from_str(&positions_raw).unwrap_or_default(),
                total_value_usd: r.get("total_value_usd"),
                ts: parse_ts(&ts_raw).unwrap_or_else(Utc::now),
            }
        }))
    }

    /// Freeze the full brief for REPLAY determinism.
    pub async fn save_analysis_snapshot(
        &self,
        run_id: &str,
        tenant_id: &str,
        brief: &PortfolioBrief,
    ) -> Result<String> {
        let snapshot_id = new_id("analysis_");
        sqlx::query(
            r#"
            INSERT INTO portfolio_analysis_snapshots (
                snapshot_id, run_id, tenant_id, mode, total_value_usd, brief_json, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot_id)
        .bind(run_id)
        .bind(tenant_id)
        .bind(brief.mode.to_string())
        .bind(brief.total_value_usd.to_f64().unwrap_or(0.0))
        .bind(serde_json::to_string(brief)?)
        .bind(now_iso())
        .execute(&self.database.pool)
        .await
        .context("Failed to save analysis snapshot")?;
        Ok(snapshot_id)
    }

    pub async fn get_analysis_snapshot_for_run(&self, run_id: &str) -> Result<Option<PortfolioBrief>> {
        let row = sqlx::query(
            "SELECT brief_json FROM portfolio_analysis_snapshots WHERE run_id = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(run_id)
        .fetch_optional(&self.database.pool)
        .await?;

        Ok(row.and_then(|r| {
            let raw: String = r.get("brief_json");
            serde_json::from_str(&raw).ok()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        let repo = PortfolioRepo::new(db);

        let mut balances = HashMap::new();
        balances.insert("USD".to_string(), dec!(10000));
        let mut positions = HashMap::new();
        positions.insert("BTC".to_string(), dec!(0.5));

        repo.save_snapshot(Some("run_1"), "t1", &balances, &positions, dec!(32500))
            .await
            .unwrap();

        let snap = repo.latest_snapshot("t1").await.unwrap().unwrap();
        assert_eq!(snap.balances.get("USD"), Some(&dec!(10000)));
        assert_eq!(snap.positions.get("BTC"), Some(&dec!(0.5)));
        assert!((snap.total_value_usd - 32500.0).abs() < 1e-6);

        assert!(repo.latest_snapshot("t2").await.unwrap().is_none());
    }
}
