//! Error taxonomy for the metrics engine.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by ingestion, queries, and maintenance.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed ingestion input, rejected before any calculation runs.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("metrics database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Required table or columns are still missing after a repair attempt.
    #[error("schema error: {0}")]
    Schema(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True when the underlying SQLite error points at a missing table or
    /// column, which is the one case that triggers an on-demand schema repair.
    /// `Error::Schema` is the outcome of a failed repair and never matches.
    pub fn is_missing_schema(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db_error)) => {
                let message = db_error.message();
                message.contains("no such table") || message.contains("no such column")
            }
            _ => false,
        }
    }
}
