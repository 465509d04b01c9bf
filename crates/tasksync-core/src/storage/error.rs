//! Storage errors

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Cannot create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Permission denied writing '{path}'")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No space left while writing '{path}'")]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot read snapshot '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot write snapshot '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot move '{from}' to '{to}': {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The saved snapshot could not be decoded; the store started empty
    #[error("Unreadable snapshot discarded ({details})")]
    CorruptSnapshot {
        /// Where the unreadable data was kept, if anywhere
        backup: Option<String>,
        details: String,
    },

    #[error("Invalid snapshot format: {0}")]
    InvalidFormat(String),

    #[error("Failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Classify a write-side I/O error for `path`
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        if error.kind() == io::ErrorKind::PermissionDenied {
            StorageError::PermissionDenied {
                path,
                source: error,
            }
        } else if is_out_of_space(&error) {
            StorageError::DiskFull {
                path,
                source: error,
            }
        } else {
            StorageError::Write {
                path,
                source: error,
            }
        }
    }

    /// What the user can do about it, shown by front-ends
    pub fn recovery_suggestion(&self) -> Option<String> {
        match self {
            StorageError::DiskFull { .. } => Some("Free up disk space and try again.".to_string()),
            StorageError::PermissionDenied { path, .. } | StorageError::CreateDirectory { path, .. } => {
                Some(format!(
                    "Check write permissions for '{}' or set a different data_dir.",
                    path.display()
                ))
            }
            StorageError::CorruptSnapshot {
                backup: Some(backup),
                ..
            } => Some(format!(
                "Unsynced changes may be recoverable from {}.",
                backup
            )),
            _ => None,
        }
    }
}

// ENOSPC on unix, ERROR_DISK_FULL on windows
fn is_out_of_space(error: &io::Error) -> bool {
    matches!(error.raw_os_error(), Some(28) | Some(112))
        || error.to_string().to_lowercase().contains("no space left")
}

pub type StorageResult<T> = Result<T, StorageError>;
