//! Error types for the SQLite backend.

use resync_core::SyncError;
use thiserror::Error;

/// Result type for SQLite backend operations.
pub type SqliteResult<T> = Result<T, SqliteError>;

/// Errors raised by the SQLite backend.
#[derive(Debug, Error)]
pub enum SqliteError {
    /// The database rejected a statement.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A table the entity needs does not exist.
    #[error("table '{0}' does not exist")]
    MissingTable(String),

    /// An operation cannot be expressed as SQL.
    #[error("cannot render statement: {0}")]
    Render(String),

    /// A stored checkpoint could not be parsed.
    #[error("invalid checkpoint '{value}' for '{title}'")]
    InvalidCheckpoint {
        /// Checkpoint record title.
        title: String,
        /// Stored value.
        value: String,
    },
}

impl From<SqliteError> for SyncError {
    fn from(e: SqliteError) -> Self {
        SyncError::Store(e.to_string())
    }
}
