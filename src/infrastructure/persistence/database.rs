use anyhow::{Context, Result};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Singleton database wrapper
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.exists()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal); // Better for concurrency

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// In-memory database for tests and ephemeral runs.
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
                tenant_id TEXT PRIMARY KEY,
                kill_switch_enabled INTEGER NOT NULL DEFAULT 0,
                created_at TEXT DEFAULT (datetime('now'))
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create tenants table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                metadata_json TEXT,
                created_at TEXT DEFAULT (datetime('now'))
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create conversations table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                execution_mode TEXT NOT NULL,
                source_run_id TEXT,
                asset_class TEXT NOT NULL DEFAULT 'CRYPTO',
                news_enabled INTEGER NOT NULL DEFAULT 1,
                locked_product_id TEXT,
                tradability_verified INTEGER NOT NULL DEFAULT 0,
                command_text TEXT NOT NULL DEFAULT '',
                intent TEXT NOT NULL DEFAULT '',
                metadata_json TEXT,
                execution_plan_json TEXT,
                trade_proposal_json TEXT,
                status TEXT NOT NULL DEFAULT 'CREATED',
                failure_code TEXT,
                failure_reason TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_runs_tenant_status
            ON runs (tenant_id, status);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create runs table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dag_nodes (
                node_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'CREATED',
                inputs_json TEXT,
                outputs_json TEXT,
                started_at TEXT,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_dag_nodes_run ON dag_nodes (run_id, name);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create dag_nodes table")?;

        // Append-only evidence store. Rows are never mutated.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_artifacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                step_name TEXT NOT NULL,
                artifact_type TEXT NOT NULL,
                artifact_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_artifacts_run_type
            ON run_artifacts (run_id, artifact_type);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create run_artifacts table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tool_calls (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                node_id TEXT,
                tool_name TEXT NOT NULL,
                mcp_server TEXT NOT NULL,
                request_json TEXT NOT NULL,
                response_json TEXT,
                status TEXT NOT NULL,
                latency_ms INTEGER,
                http_status INTEGER,
                error_text TEXT,
                attempt INTEGER NOT NULL DEFAULT 1,
                ts TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tool_calls_run ON tool_calls (run_id);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create tool_calls table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS market_candles (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                ts TEXT NOT NULL,
                UNIQUE (symbol, interval, start_time)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create market_candles table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS market_candles_batches (
                batch_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                window TEXT NOT NULL,
                candles_json TEXT NOT NULL,
                query_params_json TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_candle_batches_run ON market_candles_batches (run_id);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create market_candles_batches table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rankings (
                ranking_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                window TEXT NOT NULL,
                metric TEXT NOT NULL,
                table_json TEXT NOT NULL,
                selected_symbol TEXT NOT NULL,
                selected_score REAL NOT NULL,
                rationale TEXT,
                ts TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rankings_run ON rankings (run_id);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create rankings table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS retrievals (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                node_id TEXT,
                query TEXT NOT NULL,
                chunks_json TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create retrievals table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                notional_usd TEXT NOT NULL,
                status TEXT NOT NULL,
                filled_qty TEXT,
                avg_fill_price TEXT,
                fees TEXT,
                client_order_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                status_updated_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_orders_run ON orders (run_id);
            CREATE INDEX IF NOT EXISTS idx_orders_tenant ON orders (tenant_id, created_at);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create orders table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fills (
                fill_id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                qty TEXT NOT NULL,
                price TEXT NOT NULL,
                fee TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create fills table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS portfolio_snapshots (
                snapshot_id TEXT PRIMARY KEY,
                run_id TEXT,
                tenant_id TEXT NOT NULL,
                balances_json TEXT NOT NULL,
                positions_json TEXT NOT NULL,
                total_value_usd REAL NOT NULL,
                ts TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_portfolio_snapshots_tenant
            ON portfolio_snapshots (tenant_id, ts);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create portfolio_snapshots table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS portfolio_analysis_snapshots (
                snapshot_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                mode TEXT NOT NULL,
                total_value_usd REAL NOT NULL,
                brief_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create portfolio_analysis_snapshots table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS eval_results (
                eval_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                eval_name TEXT NOT NULL,
                score REAL NOT NULL,
                reasons_json TEXT NOT NULL,
                evaluator_type TEXT NOT NULL,
                eval_category TEXT NOT NULL,
                thresholds_json TEXT,
                details_json TEXT,
                explanation TEXT,
                explanation_source TEXT,
                ts TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_eval_results_run ON eval_results (run_id);
            CREATE INDEX IF NOT EXISTS idx_eval_results_ts ON eval_results (ts);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create eval_results table")?;

        // Single-use transitions rely on the status predicate in UPDATE.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_confirmations (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                proposal_json TEXT NOT NULL,
                mode TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                run_id TEXT,
                insight_json TEXT,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                confirmed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_confirmations_conversation
            ON trade_confirmations (conversation_id, tenant_id, status);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create trade_confirmations table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_tickets (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                notional_usd TEXT NOT NULL,
                tif TEXT NOT NULL DEFAULT 'DAY',
                status TEXT NOT NULL DEFAULT 'PENDING',
                receipt_json TEXT,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                updated_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_trade_tickets_run ON trade_tickets (run_id);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create trade_tickets table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS policy_events (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                decision TEXT NOT NULL,
                rules_fired_json TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create policy_events table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events (run_id);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create run_events table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notification_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel TEXT NOT NULL,
                status TEXT NOT NULL,
                action TEXT NOT NULL,
                run_id TEXT,
                error TEXT,
                ts TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create notification_events table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS news_items (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                summary TEXT,
                source TEXT,
                published_at TEXT,
                ts TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS news_asset_mentions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                news_id TEXT NOT NULL,
                asset_symbol TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS run_news_evidence (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                news_id TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create news tables")?;

        info!("Database schema initialized.");
        Ok(())
    }
}
