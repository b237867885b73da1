//! Storage error types.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Local persistence failures. The operation that hit one is aborted and the
/// error surfaced; storage errors are never retried silently.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt local data: {0}")]
    Corrupt(String),

    #[error("storage task failed: {0}")]
    Task(String),
}

impl StorageError {
    /// Only corrupted local data is fatal; everything else may succeed on a
    /// later attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::Corrupt(_))
    }
}
