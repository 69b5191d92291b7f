use crate::domain::ids::new_id;
use crate::domain::plan::RankingRow;
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::now_iso;
use anyhow::{Context, Result};
use sqlx::Row;

pub struct RankingsRepo {
    database: Database,
}

#[derive(Debug, Clone)]
pub struct Ranking {
    pub ranking_id: String,
    pub window: String,
    pub metric: String,
    pub table: Vec<RankingRow>,
    pub selected_symbol: String,
    pub selected_score: f64,
    pub rationale: Option<String>,
}

impl RankingsRepo {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    pub async fn insert(
        &self,
        run_id: &str,
        node_id: &str,
        window: &str,
        metric: &str,
        table: &[RankingRow],
        selected_symbol: &str,
        selected_score: f64,
        rationale: &str,
    ) -> Result<String> {
        let ranking_id = new_id("rank_");
        sqlx::query(
            r#"
            INSERT INTO rankings (
                ranking_id, run_id, node_id, window, metric, table_json,
                selected_symbol, selected_score, rationale, ts
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&ranking_id)
        .bind(run_id)
        .bind(node_id)
        .bind(window)
        .bind(metric)
        .bind(serde_json::to_string(table)?)
        .bind(selected_symbol)
        .bind(selected_score)
        .bind(rationale)
        .bind(now_iso())
        .execute(&self.database.pool)
        .await
        .context("Failed to insert ranking")?;
        Ok(ranking_id)
    }

    pub async fn get_latest_for_run(&self, run_id: &str) -> Result<Option<Ranking>> {
        let row = sqlx::query("SELECT * FROM rankings WHERE run_id = ? ORDER BY ts DESC LIMIT 1")
            .bind(run_id)
            .fetch_optional(&self.database.pool)
            .await
            .context("Failed to load ranking")?;

        Ok(row.map(|r| {
            let table_raw: String = r.get("table_json");
            Ranking {
                ranking_id: r.get("ranking_id"),
                window: r.get("window"),
                metric: r.get("metric"),
                table: serde_json::from_str(&table_raw).unwrap_or_default(),
                selected_symbol: r.get("selected_symbol"),
                selected_score: r.get("selected_score"),
                rationale: r.get("rationale"),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_selected_symbol_present_in_table() {
        let db = Database::in_memory().await.unwrap();
        let repo = RankingsRepo::new(db);

        let table = vec![
            RankingRow {
                symbol: "SOL-USD".to_string(),
                score: 0.08,
                volume_proxy: 1000.0,
                candles_count: 24,
                first_price: 100.0,
                last_price: 108.0,
            },
            RankingRow {
                symbol: "BTC-USD".to_string(),
                score: 0.02,
                volume_proxy: 9000.0,
                candles_count: 24,
                first_price: 50000.0,
                last_price: 51000.0,
            },
        ];

        repo.insert("run_1", "node_1", "24h", "return", &table, "SOL-USD", 0.08, "top return")
            .await
            .unwrap();

        let ranking = repo.get_latest_for_run("run_1").await.unwrap().unwrap();
        assert_eq!(ranking.selected_symbol, "SOL-USD");
        assert!(ranking.table.iter().any(|r| r.symbol == ranking.selected_symbol));
    }
}
