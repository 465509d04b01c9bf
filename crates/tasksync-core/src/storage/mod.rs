//! Storage layer
//!
//! Durable snapshot save/load for the record store.
//!
//! ## Architecture
//!
//! - **Snapshot**: the full task list with sync metadata, as JSON
//! - **Persistence**: where the snapshot lives (file, SQLite, memory)
//!
//! The store writes a snapshot after every committed mutation so a restart
//! resumes from the last known state, pending tasks included.

use crate::config::{Config, StorageBackend};

pub mod error;
pub mod persistence;
pub mod snapshot;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use persistence::{FilePersistence, MemoryPersistence, Persistence};
pub use snapshot::{Snapshot, SNAPSHOT_VERSION};
pub use sqlite::SqlitePersistence;

/// Open the persistence adapter selected by `config`
pub fn open_persistence(config: &Config) -> StorageResult<Box<dyn Persistence>> {
    match config.storage {
        StorageBackend::Json => Ok(Box::new(FilePersistence::new(config.snapshot_path()))),
        StorageBackend::Sqlite => Ok(Box::new(SqlitePersistence::open(&config.sqlite_path())?)),
    }
}
