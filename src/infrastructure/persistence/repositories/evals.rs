use crate::domain::ids::new_id;
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::now_iso;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::collections::HashMap;

pub struct EvalResultsRepo {
    database: Database,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResultRow {
    pub eval_id: String,
    pub run_id: String,
    pub tenant_id: String,
    pub eval_name: String,
    pub score: f64,
    pub reasons: Vec<String>,
    pub evaluator_type: String,
    pub eval_category: String,
    pub thresholds: Option<serde_json::Value>,
    pub details: Option<serde_json::Value>,
    pub explanation: Option<String>,
    pub explanation_source: Option<String>,
    pub ts: String,
}

/// Letter grade over a [0, 1] score: A >= 0.9, B >= 0.8, C >= 0.7, D >= 0.6, else F.
pub fn letter_grade(score: f64) -> &'static str {
    if score >= 0.9 {
        "A"
    } else if score >= 0.8 {
        "B"
    } else if score >= 0.7 {
        "C"
    } else if score >= 0.6 {
        "D"
    } else {
        "F"
    }
}

impl EvalResultsRepo {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        &self,
        run_id: &str,
        tenant_id: &str,
        eval_name: &str,
        score: f64,
        reasons: &[String],
        evaluator_type: &str,
        eval_category: &str,
        thresholds: Option<&serde_json::Value>,
        details: Option<&serde_json::Value>,
    ) -> Result<String> {
        let eval_id = new_id("eval_");
        sqlx::query(
            r#"
            INSERT INTO eval_results (
                eval_id, run_id, tenant_id, eval_name, score, reasons_json,
                evaluator_type, eval_category, thresholds_json, details_json, ts
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&eval_id)
        .bind(run_id)
        .bind(tenant_id)
        .bind(eval_name)
        .bind(score)
        .bind(serde_json::to_string(reasons)?)
        .bind(evaluator_type)
        .bind(eval_category)
        .bind(thresholds.map(serde_json::Value::to_string))
        .bind(details.map(serde_json::Value::to_string))
        .bind(now_iso())
        .execute(&self.database.pool)
        .await
        .with_context(|| format!("Failed to insert eval result {}", eval_name))?;
        Ok(eval_id)
    }

    pub async fn set_explanation(
        &self,
        eval_id: &str,
        explanation: &str,
        source: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE eval_results SET explanation = ?, explanation_source = ? WHERE eval_id = ?",
        )
        .bind(explanation)
        .bind(source)
        .bind(eval_id)
        .execute(&self.database.pool)
        .await
        .context("Failed to set eval explanation")?;
        Ok(())
    }

    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<EvalResultRow>> {
        let rows = sqlx::query("SELECT * FROM eval_results WHERE run_id = ? ORDER BY eval_name ASC")
            .bind(run_id)
            .fetch_all(&self.database.pool)
            .await
            .context("Failed to list eval results")?;

        Ok(rows.into_iter().map(Self::map_row).collect())
    }

    /// Read-only dashboard aggregation: per-category average + grade,
    /// grade distribution, and top failures sorted worst-first.
    pub async fn dashboard(&self, window_hours: i64, failure_threshold: f64) -> Result<serde_json::Value> {
        let rows = self.rows_in_window(window_hours).await?;

        let mut by_category: HashMap<String, Vec<f64>> = HashMap::new();
        let mut grade_distribution: HashMap<&'static str, usize> = HashMap::new();
        let mut failures: Vec<&EvalResultRow> = Vec::new();

        for row in &rows {
            by_category
                .entry(row.eval_category.clone())
                .or_default()
                .push(row.score);
            *grade_distribution.entry(letter_grade(row.score)).or_default() += 1;
            if row.score < failure_threshold {
                failures.push(row);
            }
        }

        failures.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));

        let categories: serde_json::Map<String, serde_json::Value> = by_category
            .into_iter()
            .map(|(category, scores)| {
                let avg = scores.iter().sum::<f64>() / scores.len() as f64;
                (
                    category,
                    serde_json::json!({
                        "average": avg,
                        "grade": letter_grade(avg),
                        "count": scores.len(),
                    }),
                )
            })
            .collect();

        Ok(serde_json::json!({
            "window_hours": window_hours,
            "total_evals": rows.len(),
            "categories": categories,
            "grade_distribution": grade_distribution,
            "top_failures": failures
                .iter()
                .take(20)
                .map(|f| serde_json::json!({
                    "run_id": f.run_id,
                    "eval_name": f.eval_name,
                    "score": f.score,
                    "reasons": f.reasons,
                }))
                .collect::<Vec<_>>(),
        }))
    }

    pub async fn summary(&self, window_hours: i64) -> Result<serde_json::Value> {
        let rows = self.rows_in_window(window_hours).await?;
        let total = rows.len();
        let avg = if total > 0 {
            rows.iter().map(|r| r.score).sum::<f64>() / total as f64
        } else {
            0.0
        };
        let run_count = rows
            .iter()
            .map(|r| r.run_id.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(serde_json::json!({
            "window_hours": window_hours,
            "eval_count": total,
            "run_count": run_count,
            "average_score": avg,
            "grade": letter_grade(avg),
        }))
    }

    pub async fn list_for_conversation_runs(&self, run_ids: &[String]) -> Result<Vec<EvalResultRow>> {
        let mut out = Vec::new();
        for run_id in run_ids {
            out.extend(self.list_for_run(run_id).await?);
        }
        Ok(out)
    }

    async fn rows_in_window(&self, window_hours: i64) -> Result<Vec<EvalResultRow>> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::hours(window_hours)).to_rfc3339();
        let rows = sqlx::query("SELECT * FROM eval_results WHERE ts >= ? ORDER BY ts DESC")
            .bind(cutoff)
            .fetch_all(&self.database.pool)
            .await
            .context("Failed to query eval window")?;
        Ok(rows.into_iter().map(Self::map_row).collect())
    }

    fn map_row(row: sqlx::sqlite::SqliteRow) -> EvalResultRow {
        let reasons_raw: String = row.get("reasons_json");
        let thresholds_raw: Option<String> = row.get("thresholds_json");
        let details_raw: Option<String> = row.get("details_json");
        EvalResultRow {
            eval_id: row.get("eval_id"),
            run_id: row.get("run_id"),
            tenant_id: row.get("tenant_id"),
            eval_name: row.get("eval_name"),
            score: row.get("score"),
            reasons: serde_json::from_str(&reasons_raw).unwrap_or_default(),
            evaluator_type: row.get("evaluator_type"),
            eval_category: row.get("eval_category"),
            thresholds: thresholds_raw.and_then(|s| serde_json::from_str(&s).ok()),
            details: details_raw.and_then(|s| serde_json::from_str(&s).ok()),
            explanation: row.get("explanation"),
            explanation_source: row.get("explanation_source"),
            ts: row.get("ts"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letter_grades() {
        assert_eq!(letter_grade(0.95), "A");
        assert_eq!(letter_grade(0.9), "A");
        assert_eq!(letter_grade(0.85), "B");
        assert_eq!(letter_grade(0.7), "C");
        assert_eq!(letter_grade(0.65), "D");
        assert_eq!(letter_grade(0.1), "F");
    }

    #[tokio::test]
    async fn test_insert_and_dashboard() {
        let db = Database::in_memory().await.unwrap();
        let repo = EvalResultsRepo::new(db);

        repo.insert("run_1", "t1", "ranking_correctness", 1.0, &["ok".to_string()], "rule", "quality", None, None)
            .await
            .unwrap();
        repo.insert("run_1", "t1", "latency_slo", 0.4, &["slow".to_string()], "rule", "performance", None, None)
            .await
            .unwrap();

        let results = repo.list_for_run("run_1").await.unwrap();
        assert_eq!(results.len(), 2);

        let dashboard = repo.dashboard(24, 0.7).await.unwrap();
        assert_eq!(dashboard["total_evals"], 2);
        assert_eq!(dashboard["categories"]["quality"]["grade"], "A");
        assert_eq!(dashboard["top_failures"][0]["eval_name"], "latency_slo");
    }
}
