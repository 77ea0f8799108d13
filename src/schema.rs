//! Cached table and column introspection.
//!
//! The shape of the metric tables only changes when the crate upgrades its
//! schema, so the ingestion hot path should never pay for `sqlite_master` or
//! `pragma_table_info` lookups. `SchemaInspector` answers from an in-process
//! map first, then from the persisted copy in `engine_state`, and only then
//! asks SQLite. Every live answer is written back to both levels.

use crate::db::{AGGREGATED_TABLE, Db, RAW_TABLE, SCHEMA_VERSION, STATE_TABLE};
use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Tables that may be named in an introspection query.
const KNOWN_TABLES: &[&str] = &[RAW_TABLE, AGGREGATED_TABLE, STATE_TABLE];

/// Columns ingestion writes. A raw table missing any of these is repaired.
pub const RAW_COLUMNS: &[&str] = &[
    "id",
    "page_id",
    "data_transfer",
    "load_time",
    "requests",
    "carbon_footprint",
    "energy_consumption",
    "performance_score",
    "created_at",
];

const COLUMN_CACHE_PREFIX: &str = "schema.columns.";

/// Persisted form of a column list, tagged with the schema version that
/// produced it.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedColumns {
    version: u32,
    columns: Vec<String>,
}

pub struct SchemaInspector {
    db: Arc<Db>,
    tables: RwLock<HashMap<String, bool>>,
    columns: RwLock<HashMap<String, Vec<String>>>,
}

impl SchemaInspector {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            tables: RwLock::new(HashMap::new()),
            columns: RwLock::new(HashMap::new()),
        }
    }

    /// Whether `name` exists. Cached for the life of the process unless
    /// `force` asks for a live check, e.g. right after a schema repair.
    pub async fn table_exists(&self, name: &str, force: bool) -> Result<bool> {
        let name = checked_table(name)?;

        if !force {
            let cached = self
                .tables
                .read()
                .expect("tables lock poisoned")
                .get(name)
                .copied();
            if let Some(exists) = cached {
                return Ok(exists);
            }
        }

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(name)
                .fetch_one(self.db.pool())
                .await?;
        let exists = count > 0;

        self.tables
            .write()
            .expect("tables lock poisoned")
            .insert(name.to_string(), exists);

        Ok(exists)
    }

    /// Column names of `name` in declaration order.
    pub async fn get_columns(&self, name: &str, force: bool) -> Result<Vec<String>> {
        let name = checked_table(name)?;
        let state_key = format!("{COLUMN_CACHE_PREFIX}{name}");

        if !force {
            let cached = self
                .columns
                .read()
                .expect("columns lock poisoned")
                .get(name)
                .cloned();
            if let Some(columns) = cached {
                return Ok(columns);
            }

            if let Some(columns) = self.load_persisted(&state_key).await {
                self.columns
                    .write()
                    .expect("columns lock poisoned")
                    .insert(name.to_string(), columns.clone());
                return Ok(columns);
            }
        }

        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM pragma_table_info(?) ORDER BY cid")
                .bind(name)
                .fetch_all(self.db.pool())
                .await?;
        let columns: Vec<String> = rows.into_iter().map(|(column,)| column).collect();

        // An empty list means the table is gone; persisting it would pin the
        // miss until the next forced check.
        if !columns.is_empty() {
            let persisted = PersistedColumns {
                version: SCHEMA_VERSION,
                columns: columns.clone(),
            };
            match serde_json::to_string(&persisted) {
                Ok(json) => {
                    if let Err(error) = self.db.set_state(&state_key, json).await {
                        tracing::warn!(%error, table = name, "failed to persist column cache");
                    }
                }
                Err(error) => tracing::warn!(%error, table = name, "failed to encode column cache"),
            }
        }

        self.columns
            .write()
            .expect("columns lock poisoned")
            .insert(name.to_string(), columns.clone());

        Ok(columns)
    }

    /// Confirm the raw table carries every ingestion column.
    ///
    /// On a miss, repairs the schema once and re-checks live. A table that is
    /// still incomplete after the repair is a terminal schema error.
    pub async fn ensure_raw_table(&self) -> Result<()> {
        if self.raw_table_complete(false).await? {
            return Ok(());
        }

        tracing::warn!(table = RAW_TABLE, "raw metrics table incomplete, repairing schema");
        self.repair().await?;

        if self.raw_table_complete(true).await? {
            Ok(())
        } else {
            Err(Error::Schema(format!(
                "{RAW_TABLE} is missing required columns after repair"
            )))
        }
    }

    /// Re-apply the embedded schema and drop both cache levels.
    pub async fn repair(&self) -> Result<()> {
        self.db.ensure_schema().await?;
        self.invalidate().await
    }

    pub async fn invalidate(&self) -> Result<()> {
        self.tables.write().expect("tables lock poisoned").clear();
        self.columns.write().expect("columns lock poisoned").clear();
        self.db.delete_state_prefix(COLUMN_CACHE_PREFIX).await?;
        Ok(())
    }

    async fn raw_table_complete(&self, force: bool) -> Result<bool> {
        if !self.table_exists(RAW_TABLE, force).await? {
            return Ok(false);
        }
        let columns = self.get_columns(RAW_TABLE, force).await?;
        Ok(RAW_COLUMNS
            .iter()
            .all(|required| columns.iter().any(|column| column == required)))
    }

    async fn load_persisted(&self, state_key: &str) -> Option<Vec<String>> {
        let json = match self.db.get_state(state_key).await {
            Ok(value) => value?,
            Err(error) => {
                tracing::warn!(%error, key = state_key, "failed to read persisted column cache");
                return None;
            }
        };
        let persisted: PersistedColumns = serde_json::from_str(&json).ok()?;
        (persisted.version == SCHEMA_VERSION && !persisted.columns.is_empty())
            .then_some(persisted.columns)
    }
}

impl std::fmt::Debug for SchemaInspector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaInspector").finish_non_exhaustive()
    }
}

/// Reject any table name outside the known set before it reaches SQL.
fn checked_table(name: &str) -> Result<&str> {
    KNOWN_TABLES
        .iter()
        .find(|known| **known == name)
        .copied()
        .ok_or_else(|| Error::Validation(format!("unknown table: {name}")))
}
