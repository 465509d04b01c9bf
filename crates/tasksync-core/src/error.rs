//! Engine errors
//!
//! Errors surfaced to callers of the sync engine handle. Delivery failures of
//! individual records are not errors here: they are tracked in each task's
//! sync state and retried by the dispatcher.

use thiserror::Error;

use crate::models::TaskId;
use crate::remote::RemoteError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Task text was empty after trimming
    #[error("Task text cannot be empty")]
    EmptyText,

    #[error("Task not found: {0}")]
    NotFound(TaskId),

    /// Bulk delete needs the remote store
    #[error("Cannot clear completed tasks while offline")]
    Offline,

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The engine task is no longer running
    #[error("Sync engine has stopped")]
    Stopped,
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
