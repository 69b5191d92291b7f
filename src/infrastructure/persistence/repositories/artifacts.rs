//! Append-only run artifacts. Once written a row is never mutated; the
//! eval harness treats these as the sole source of evidence.

use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::now_iso;
use anyhow::{Context, Result};
use sqlx::Row;

pub struct RunArtifactsRepo {
    database: Database,
}

impl RunArtifactsRepo {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    pub async fn insert(
        &self,
        run_id: &str,
        step_name: &str,
        artifact_type: &str,
        artifact: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_artifacts (run_id, step_name, artifact_type, artifact_json, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id)
        .bind(step_name)
        .bind(artifact_type)
        .bind(serde_json::to_string(artifact)?)
        .bind(now_iso())
        .execute(&self.database.pool)
        .await
        .with_context(|| format!("Failed to insert artifact {}", artifact_type))?;
        Ok(())
    }

    /// Latest artifact of a given type for a run.
    pub async fn get(
        &self,
        run_id: &str,
        artifact_type: &str,
    ) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query(
            r#"
            SELECT artifact_json FROM run_artifacts
            WHERE run_id = ? AND artifact_type = ?
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(run_id)
        .bind(artifact_type)
        .fetch_optional(&self.database.pool)
        .await
        .context("Failed to load artifact")?;

        Ok(row.and_then(|r| {
            let raw: String = r.get("artifact_json");
            serde_json::from_str(&raw).ok()
        }))
    }

    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<(String, String, serde_json::Value)>> {
        let rows = sqlx::query(
            "SELECT step_name, artifact_type, artifact_json FROM run_artifacts WHERE run_id = ? ORDER BY id ASC",
        )
        .bind(run_id)
        .fetch_all(&self.database.pool)
        .await
        .context("Failed to list artifacts")?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let step: String = r.get("step_name");
                let kind: String = r.get("artifact_type");
                let raw: String = r.get("artifact_json");
                serde_json::from_str(&raw).ok().map(|v| (step, kind, v))
            })
            .collect())
    }

    /// Copy all artifacts from a source run into a REPLAY run.
    pub async fn copy_from_run(&self, source_run_id: &str, target_run_id: &str) -> Result<usize> {
        let artifacts = self.list_for_run(source_run_id).await?;
        for (step, kind, value) in &artifacts {
            self.insert(target_run_id, step, kind, value).await?;
        }
        Ok(artifacts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_and_get_latest() {
        let db = Database::in_memory().await.unwrap();
        let repo = RunArtifactsRepo::new(db);

        repo.insert("run_1", "research", "research_summary", &json!({"v": 1}))
            .await
            .unwrap();
        repo.insert("run_1", "research", "research_summary", &json!({"v": 2}))
            .await
            .unwrap();

        let latest = repo.get("run_1", "research_summary").await.unwrap().unwrap();
        assert_eq!(latest["v"], 2);
        assert!(repo.get("run_1", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_copy_from_run() {
        let db = Database::in_memory().await.unwrap();
        let repo = RunArtifactsRepo::new(db);

        repo.insert("run_src", "research", "universe_snapshot", &json!({"n": 5}))
            .await
            .unwrap();
        repo.insert("run_src", "research", "financial_brief", &json!({"ranked_assets": []}))
            .await
            .unwrap();

        let copied = repo.copy_from_run("run_src", "run_replay").await.unwrap();
        assert_eq!(copied, 2);
        assert!(repo.get("run_replay", "universe_snapshot").await.unwrap().is_some());
    }
}
