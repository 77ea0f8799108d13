//! Database connection management and the embedded schema.

use crate::error::{Error, Result};

use anyhow::Context as _;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Raw per-page-view observations.
pub const RAW_TABLE: &str = "page_metrics";
/// Rolled-up periods written by the aggregation job.
pub const AGGREGATED_TABLE: &str = "page_metrics_aggregated";
/// Persisted key/value state.
pub const STATE_TABLE: &str = "engine_state";

/// Bumped whenever [`SCHEMA`] changes shape. Persisted schema caches tagged
/// with another version are ignored.
pub const SCHEMA_VERSION: u32 = 1;

/// Wraps the SQLite pool that backs both metric tables.
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Connect to (or create) the database at `path` and apply the schema.
    pub async fn connect(path: &Path) -> Result<Arc<Self>> {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|error| Error::Config(format!("invalid db path: {error}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open SQLite at {}", path.display()))?;

        let db = Self { pool };
        db.ensure_schema().await?;

        tracing::debug!(path = %path.display(), "metrics database ready");
        Ok(Arc::new(db))
    }

    /// Apply the embedded schema. Every statement is `IF NOT EXISTS`, so this
    /// doubles as the on-demand repair after a missing table or column.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Upsert a key in the state table.
    pub async fn set_state(&self, key: &str, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        sqlx::query(
            "INSERT INTO engine_state (key, value, updated_at) VALUES (?, ?, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(&value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM engine_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    /// Remove every state key starting with `prefix`.
    pub async fn delete_state_prefix(&self, prefix: &str) -> Result<u64> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let rows = sqlx::query("DELETE FROM engine_state WHERE key LIKE ? ESCAPE '\\'")
            .bind(&pattern)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

const SCHEMA: &str = r#"
-- One row per page view. Written by ingestion, deleted only by retention.
CREATE TABLE IF NOT EXISTS page_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    page_id INTEGER NOT NULL,
    data_transfer INTEGER NOT NULL DEFAULT 0,
    load_time REAL NOT NULL DEFAULT 0,
    requests INTEGER NOT NULL DEFAULT 0,
    carbon_footprint REAL NOT NULL DEFAULT 0,
    energy_consumption REAL NOT NULL DEFAULT 0,
    performance_score REAL NOT NULL DEFAULT 100,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_page_metrics_page ON page_metrics(page_id, created_at);
CREATE INDEX IF NOT EXISTS idx_page_metrics_created ON page_metrics(created_at);
CREATE INDEX IF NOT EXISTS idx_page_metrics_load_time ON page_metrics(page_id, load_time);

-- Rollups per page and calendar bucket.
CREATE TABLE IF NOT EXISTS page_metrics_aggregated (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    page_id INTEGER NOT NULL,
    period_start TEXT NOT NULL,
    period_end TEXT NOT NULL,
    granularity TEXT NOT NULL,
    views INTEGER NOT NULL DEFAULT 0,
    total_data_transfer INTEGER NOT NULL DEFAULT 0,
    avg_data_transfer REAL NOT NULL DEFAULT 0,
    total_load_time REAL NOT NULL DEFAULT 0,
    avg_load_time REAL NOT NULL DEFAULT 0,
    total_requests INTEGER NOT NULL DEFAULT 0,
    avg_requests REAL NOT NULL DEFAULT 0,
    total_carbon_footprint REAL NOT NULL DEFAULT 0,
    avg_carbon_footprint REAL NOT NULL DEFAULT 0,
    total_energy_consumption REAL NOT NULL DEFAULT 0,
    avg_energy_consumption REAL NOT NULL DEFAULT 0,
    avg_performance_score REAL NOT NULL DEFAULT 100,
    covered_until TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (page_id, period_start, period_end, granularity)
);
CREATE INDEX IF NOT EXISTS idx_page_metrics_aggregated_lookup
    ON page_metrics_aggregated(page_id, granularity, period_start);

-- Key/value state: refresh timestamps, schema cache, last maintenance run.
CREATE TABLE IF NOT EXISTS engine_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> Arc<Db> {
        let path = std::env::temp_dir().join(format!(
            "carbonmeter_test_db_{}.db",
            uuid::Uuid::new_v4()
        ));
        Db::connect(&path).await.unwrap()
    }

    #[tokio::test]
    async fn test_state_roundtrip_and_overwrite() {
        let db = setup().await;

        assert_eq!(db.get_state("missing").await.unwrap(), None);

        db.set_state("last_refresh", "2024-01-01 00:00:00").await.unwrap();
        db.set_state("last_refresh", "2024-01-02 00:00:00").await.unwrap();

        assert_eq!(
            db.get_state("last_refresh").await.unwrap().as_deref(),
            Some("2024-01-02 00:00:00")
        );
    }

    #[tokio::test]
    async fn test_delete_state_prefix_leaves_other_keys() {
        let db = setup().await;

        db.set_state("schema.columns.page_metrics", "[]").await.unwrap();
        db.set_state("schema.columns.engine_state", "[]").await.unwrap();
        db.set_state("stats.all.refreshed_at", "x").await.unwrap();

        let removed = db.delete_state_prefix("schema.columns.").await.unwrap();
        assert_eq!(removed, 2);
        assert!(db.get_state("stats.all.refreshed_at").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ensure_schema_recreates_dropped_table() {
        let db = setup().await;

        sqlx::query("DROP TABLE page_metrics")
            .execute(db.pool())
            .await
            .unwrap();
        db.ensure_schema().await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM page_metrics")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
