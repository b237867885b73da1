use taskstack_storage::StorageError;
use taskstack_sync::SyncError;
use taskstack_transfer::TransferError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("core task failed: {0}")]
    Task(String),
}

impl CoreError {
    /// Short machine-readable kind for error reports.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Storage(_) => "storage",
            CoreError::Sync(_) => "sync",
            CoreError::Transfer(e) => e.kind(),
            CoreError::Io(_) => "io",
            CoreError::Task(_) => "task",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
