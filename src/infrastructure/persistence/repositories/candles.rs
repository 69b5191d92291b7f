//! Candle evidence storage. Individual candles are deduplicated per
//! (symbol, interval, start); batches freeze the exact query window for
//! REPLAY and oracle evals.

use crate::domain::ids::new_id;
use crate::domain::types::Candle;
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::now_iso;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::Row;
use std::str::FromStr;

pub struct CandlesRepo {
    database: Database,
}

#[derive(Debug, Clone)]
pub struct CandleBatch {
    pub batch_id: String,
    pub symbol: String,
    pub window: String,
    pub candles: Vec<Candle>,
    pub query_params: serde_json::Value,
}

impl CandlesRepo {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    pub async fn save_candles(&self, symbol: &str, interval: &str, candles: &[Candle]) -> Result<()> {
        for candle in candles {
            sqlx::query(
                r#"
                INSERT INTO market_candles (
                    id, symbol, interval, start_time, end_time,
                    open, high, low, close, volume, ts
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(symbol, interval, start_time) DO NOTHING
                "#,
            )
            .bind(new_id("candle_"))
            .bind(symbol)
            .bind(interval)
            .bind(candle.start.to_rfc3339())
            .bind(candle.end.to_rfc3339())
            .bind(candle.open.to_string())
            .bind(candle.high.to_string())
            .bind(candle.low.to_string())
            .bind(candle.close.to_string())
            .bind(candle.volume.to_string())
            .bind(now_iso())
            .execute(&self.database.pool)
            .await
            .context("Failed to save candle")?;
        }
        Ok(())
    }

    pub async fn save_batch(
        &self,
        run_id: &str,
        node_id: &str,
        symbol: &str,
        window: &str,
        candles: &[Candle],
        query_params: &serde_json::Value,
    ) -> Result<String> {
        let batch_id = new_id("batch_");
        sqlx::query(
            r#"
            INSERT INTO market_candles_batches (
                batch_id, run_id, node_id, symbol, window, candles_json, query_params_json, ts
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&batch_id)
        .bind(run_id)
        .bind(node_id)
        .bind(symbol)
        .bind(window)
        .bind(serde_json::to_string(candles)?)
        .bind(serde_json::to_string(query_params)?)
        .bind(now_iso())
        .execute(&self.database.pool)
        .await
        .context("Failed to save candle batch")?;
        Ok(batch_id)
    }

    pub async fn list_batches_for_run(&self, run_id: &str) -> Result<Vec<CandleBatch>> {
        let rows = sqlx::query("SELECT * FROM market_candles_batches WHERE run_id = ? ORDER BY ts ASC")
            .bind(run_id)
            .fetch_all(&self.database.pool)
            .await
            .context("Failed to list candle batches")?;

        rows.into_iter()
            .map(|r| {
                let candles_raw: String = r.get("candles_json");
                let params_raw: String = r.get("query_params_json");
                Ok(CandleBatch {
                    batch_id: r.get("batch_id"),
                    symbol: r.get("symbol"),
                    window: r.get("window"),
                    candles: serde_json::from_str(&candles_raw).unwrap_or_default(),
                    query_params: serde_json::from_str(&params_raw)
                        .unwrap_or(serde_json::Value::Null),
                })
            })
            .collect()
    }

    /// Latest stored close for a symbol, used as a price fallback.
    pub async fn latest_close(&self, symbol: &str) -> Result<Option<Decimal>> {
        let row = sqlx::query(
            "SELECT close FROM market_candles WHERE symbol = ? ORDER BY start_time DESC LIMIT 1",
        )
        .bind(symbol)
        .fetch_optional(&self.database.pool)
        .await?;

        Ok(row.and_then(|r| {
            let raw: String = r.get("close");
            Decimal::from_str(&raw).ok()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn candle(open: Decimal, close: Decimal) -> Candle {
        Candle {
            start: Utc::now(),
            end: Utc::now(),
            open,
            high: close,
            low: open,
            close,
            volume: dec!(10),
        }
    }

    #[tokio::test]
    async fn test_batch_roundtrip_preserves_query_window() {
        let db = Database::in_memory().await.unwrap();
        let repo = CandlesRepo::new(db);

        let candles = vec![candle(dec!(100), dec!(105)), candle(dec!(105), dec!(110))];
        let params = json!({"start": "2025-01-01T00:00:00Z", "end": "2025-01-02T00:00:00Z"});
        repo.save_batch("run_1", "node_1", "BTC-USD", "1h", &candles, &params)
            .await
            .unwrap();

        let batches = repo.list_batches_for_run("run_1").await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].symbol, "BTC-USD");
        assert_eq!(batches[0].candles.len(), 2);
        assert_eq!(batches[0].query_params["start"], "2025-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn test_duplicate_candles_ignored() {
        let db = Database::in_memory().await.unwrap();
        let repo = CandlesRepo::new(db);

        let c = candle(dec!(100), dec!(101));
        repo.save_candles("BTC-USD", "1h", &[c.clone()]).await.unwrap();
        repo.save_candles("BTC-USD", "1h", &[c]).await.unwrap();

        let close = repo.latest_close("BTC-USD").await.unwrap();
        assert_eq!(close, Some(dec!(101)));
    }
}
