use crate::domain::ids::new_id;
use crate::domain::plan::ExecutionPlan;
use crate::domain::types::{AssetClass, ExecutionMode, Run, RunStatus};
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::{now_iso, parse_ts};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

pub struct RunsRepo {
    database: Database,
}

/// Fields stamped onto a run at creation.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub tenant_id: String,
    pub execution_mode: ExecutionMode,
    pub source_run_id: Option<String>,
    pub asset_class: AssetClass,
    pub news_enabled: bool,
    pub locked_product_id: Option<String>,
    pub tradability_verified: bool,
    pub command_text: String,
    pub intent: String,
}

impl RunsRepo {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    pub async fn create(&self, new_run: &NewRun) -> Result<String> {
        let run_id = new_id("run_");

        sqlx::query(
            r#"
            INSERT INTO runs (
                run_id, tenant_id, execution_mode, source_run_id, asset_class,
                news_enabled, locked_product_id, tradability_verified,
                command_text, intent, status, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'CREATED', ?)
            "#,
        )
        .bind(&run_id)
        .bind(&new_run.tenant_id)
        .bind(new_run.execution_mode.to_string())
        .bind(&new_run.source_run_id)
        .bind(new_run.asset_class.to_string())
        .bind(new_run.news_enabled)
        .bind(&new_run.locked_product_id)
        .bind(new_run.tradability_verified)
        .bind(&new_run.command_text)
        .bind(&new_run.intent)
        .bind(now_iso())
        .execute(&self.database.pool)
        .await
        .context("Failed to create run")?;

        info!(
            "run_created: run={} tenant={} mode={} intent={}",
            run_id, new_run.tenant_id, new_run.execution_mode, new_run.intent
        );
        Ok(run_id)
    }

    pub async fn get(&self, run_id: &str) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.database.pool)
            .await
            .context("Failed to load run")?;

        row.map(Self::map_row).transpose()
    }

    /// Active-run guard: at most one run in CREATED/RUNNING per tenant.
    pub async fn find_active_for_tenant(&self, tenant_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT run_id FROM runs WHERE tenant_id = ? AND status IN ('CREATED', 'RUNNING') LIMIT 1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.database.pool)
        .await
        .context("Failed to query active runs")?;

        Ok(row.map(|r| r.get("run_id")))
    }

    pub async fn mark_running(&self, run_id: &str) -> Result<()> {
        sqlx::query("UPDATE runs SET status = 'RUNNING', started_at = ? WHERE run_id = ?")
            .bind(now_iso())
            .bind(run_id)
            .execute(&self.database.pool)
            .await
            .context("Failed to mark run running")?;
        Ok(())
    }

    pub async fn mark_completed(&self, run_id: &str) -> Result<()> {
        sqlx::query("UPDATE runs SET status = 'COMPLETED', completed_at = ? WHERE run_id = ?")
            .bind(now_iso())
            .bind(run_id)
            .execute(&self.database.pool)
            .await
            .context("Failed to mark run completed")?;
        Ok(())
    }

    pub async fn mark_failed(
        &self,
        run_id: &str,
        failure_code: &str,
        failure_reason: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runs
            SET status = 'FAILED', failure_code = ?, failure_reason = ?, completed_at = ?
            WHERE run_id = ?
            "#,
        )
        .bind(failure_code)
        .bind(failure_reason)
        .bind(now_iso())
        .bind(run_id)
        .execute(&self.database.pool)
        .await
        .context("Failed to mark run failed")?;
        Ok(())
    }

    pub async fn set_execution_plan(&self, run_id: &str, plan: &ExecutionPlan) -> Result<()> {
        sqlx::query("UPDATE runs SET execution_plan_json = ? WHERE run_id = ?")
            .bind(serde_json::to_string(plan)?)
            .bind(run_id)
            .execute(&self.database.pool)
            .await
            .context("Failed to set execution plan")?;
        Ok(())
    }

    pub async fn get_execution_plan(&self, run_id: &str) -> Result<Option<ExecutionPlan>> {
        let row = sqlx::query("SELECT execution_plan_json FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.database.pool)
            .await
            .context("Failed to load execution plan")?;

        Ok(row
            .and_then(|r| r.get::<Option<String>, _>("execution_plan_json"))
            .and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    pub async fn set_metadata(&self, run_id: &str, metadata: &serde_json::Value) -> Result<()> {
        sqlx::query("UPDATE runs SET metadata_json = ? WHERE run_id = ?")
            .bind(serde_json::to_string(metadata)?)
            .bind(run_id)
            .execute(&self.database.pool)
            .await
            .context("Failed to set run metadata")?;
        Ok(())
    }

    pub async fn get_metadata(&self, run_id: &str) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT metadata_json FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.database.pool)
            .await?;
        Ok(row
            .and_then(|r| r.get::<Option<String>, _>("metadata_json"))
            .and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    pub async fn set_trade_proposal(&self, run_id: &str, proposal: &serde_json::Value) -> Result<()> {
        sqlx::query("UPDATE runs SET trade_proposal_json = ? WHERE run_id = ?")
            .bind(serde_json::to_string(proposal)?)
            .bind(run_id)
            .execute(&self.database.pool)
            .await
            .context("Failed to set trade proposal")?;
        Ok(())
    }

    pub async fn set_tradability_verified(&self, run_id: &str, verified: bool) -> Result<()> {
        sqlx::query("UPDATE runs SET tradability_verified = ? WHERE run_id = ?")
            .bind(verified)
            .bind(run_id)
            .execute(&self.database.pool)
            .await
            .context("Failed to set tradability flag")?;
        Ok(())
    }

    pub async fn list_recent(&self, limit: i64, offset: i64) -> Result<Vec<Run>> {
        let rows = sqlx::query("SELECT * FROM runs ORDER BY created_at DESC LIMIT ? OFFSET ?")
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.database.pool)
            .await
            .context("Failed to list runs")?;

        rows.into_iter().map(Self::map_row).collect()
    }

    fn map_row(row: sqlx::sqlite::SqliteRow) -> Result<Run> {
        let mode_raw: String = row.try_get("execution_mode")?;
        let status_raw: String = row.try_get("status")?;
        let asset_class_raw: String = row.try_get("asset_class")?;
        let created_raw: String = row.try_get("created_at")?;
        let started_raw: Option<String> = row.try_get("started_at")?;
        let completed_raw: Option<String> = row.try_get("completed_at")?;

        Ok(Run {
            run_id: row.try_get("run_id")?,
            tenant_id: row.try_get("tenant_id")?,
            execution_mode: ExecutionMode::from_str(&mode_raw)?,
            source_run_id: row.try_get("source_run_id")?,
            asset_class: AssetClass::from_str(&asset_class_raw)?,
            news_enabled: row.try_get("news_enabled")?,
            locked_product_id: row.try_get("locked_product_id")?,
            tradability_verified: row.try_get("tradability_verified")?,
            command_text: row.try_get("command_text")?,
            intent: row.try_get("intent")?,
            status: RunStatus::from_str(&status_raw)?,
            failure_code: row.try_get("failure_code")?,
            failure_reason: row.try_get("failure_reason")?,
            created_at: parse_ts(&created_raw).unwrap_or_else(Utc::now),
            started_at: started_raw.as_deref().and_then(parse_ts),
            completed_at: completed_raw.as_deref().and_then(parse_ts),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_run(tenant: &str) -> NewRun {
        NewRun {
            tenant_id: tenant.to_string(),
            execution_mode: ExecutionMode::Paper,
            source_run_id: None,
            asset_class: AssetClass::Crypto,
            news_enabled: true,
            locked_product_id: Some("BTC-USD".to_string()),
            tradability_verified: false,
            command_text: "Buy $10 of BTC".to_string(),
            intent: "TRADE_EXECUTION".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_run() {
        let db = Database::in_memory().await.unwrap();
        let repo = RunsRepo::new(db);

        let run_id = repo.create(&new_run("t1")).await.unwrap();
        let run = repo.get(&run_id).await.unwrap().unwrap();

        assert_eq!(run.status, RunStatus::Created);
        assert_eq!(run.execution_mode, ExecutionMode::Paper);
        assert_eq!(run.locked_product_id.as_deref(), Some("BTC-USD"));
        assert!(!run.tradability_verified);
    }

    #[tokio::test]
    async fn test_active_run_guard() {
        let db = Database::in_memory().await.unwrap();
        let repo = RunsRepo::new(db);

        assert!(repo.find_active_for_tenant("t1").await.unwrap().is_none());

        let run_id = repo.create(&new_run("t1")).await.unwrap();
        assert_eq!(
            repo.find_active_for_tenant("t1").await.unwrap(),
            Some(run_id.clone())
        );

        repo.mark_running(&run_id).await.unwrap();
        assert!(repo.find_active_for_tenant("t1").await.unwrap().is_some());

        repo.mark_completed(&run_id).await.unwrap();
        assert!(repo.find_active_for_tenant("t1").await.unwrap().is_none());

        // Other tenants are unaffected
        assert!(repo.find_active_for_tenant("t2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_failed_records_code_and_reason() {
        let db = Database::in_memory().await.unwrap();
        let repo = RunsRepo::new(db);

        let run_id = repo.create(&new_run("t1")).await.unwrap();
        repo.mark_failed(&run_id, "RESEARCH_EMPTY_RANKINGS", "no candles")
            .await
            .unwrap();

        let run = repo.get(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure_code.as_deref(), Some("RESEARCH_EMPTY_RANKINGS"));
        assert!(run.completed_at.is_some());
    }
}
