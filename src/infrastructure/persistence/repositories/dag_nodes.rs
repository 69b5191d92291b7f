use crate::domain::ids::new_id;
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::now_iso;
use anyhow::{Context, Result};
use sqlx::Row;

pub struct DagNodesRepo {
    database: Database,
}

impl DagNodesRepo {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    /// Create a node row in RUNNING state and return its id.
    pub async fn start(&self, run_id: &str, name: &str, inputs: &serde_json::Value) -> Result<String> {
        let node_id = new_id("node_");
        sqlx::query(
            r#"
            INSERT INTO dag_nodes (node_id, run_id, name, status, inputs_json, started_at)
            VALUES (?, ?, ?, 'RUNNING', ?, ?)
            "#,
        )
        .bind(&node_id)
        .bind(run_id)
        .bind(name)
        .bind(serde_json::to_string(inputs)?)
        .bind(now_iso())
        .execute(&self.database.pool)
        .await
        .with_context(|| format!("Failed to start dag node {}", name))?;
        Ok(node_id)
    }

    /// COMPLETED requires outputs set.
    pub async fn complete(&self, node_id: &str, outputs: &serde_json::Value) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dag_nodes
            SET status = 'COMPLETED', outputs_json = ?, completed_at = ?
            WHERE node_id = ?
            "#,
        )
        .bind(serde_json::to_string(outputs)?)
        .bind(now_iso())
        .bind(node_id)
        .execute(&self.database.pool)
        .await
        .context("Failed to complete dag node")?;
        Ok(())
    }

    pub async fn fail(&self, node_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dag_nodes
            SET status = 'FAILED', outputs_json = ?, completed_at = ?
            WHERE node_id = ?
            "#,
        )
        .bind(serde_json::json!({ "error": error }).to_string())
        .bind(now_iso())
        .bind(node_id)
        .execute(&self.database.pool)
        .await
        .context("Failed to fail dag node")?;
        Ok(())
    }

    /// Latest outputs of a named node within a run.
    pub async fn get_outputs(&self, run_id: &str, name: &str) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query(
            r#"
            SELECT outputs_json FROM dag_nodes
            WHERE run_id = ? AND name = ?
            ORDER BY started_at DESC LIMIT 1
            "#,
        )
        .bind(run_id)
        .bind(name)
        .fetch_optional(&self.database.pool)
        .await
        .context("Failed to load node outputs")?;

        Ok(row
            .and_then(|r| r.get::<Option<String>, _>("outputs_json"))
            .and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT name, status FROM dag_nodes WHERE run_id = ? ORDER BY started_at ASC",
        )
        .bind(run_id)
        .fetch_all(&self.database.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get("name"), r.get("status")))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_node_lifecycle() {
        let db = Database::in_memory().await.unwrap();
        let repo = DagNodesRepo::new(db);

        let node_id = repo.start("run_1", "research", &json!({})).await.unwrap();
        assert!(repo.get_outputs("run_1", "research").await.unwrap().is_none());

        repo.complete(&node_id, &json!({"returns_by_symbol": {"BTC-USD": 1.5}}))
            .await
            .unwrap();

        let outputs = repo.get_outputs("run_1", "research").await.unwrap().unwrap();
        assert_eq!(outputs["returns_by_symbol"]["BTC-USD"], 1.5);

        let nodes = repo.list_for_run("run_1").await.unwrap();
        assert_eq!(nodes, vec![("research".to_string(), "COMPLETED".to_string())]);
    }
}
