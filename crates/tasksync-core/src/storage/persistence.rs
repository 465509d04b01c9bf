//! Snapshot persistence
//!
//! The record store only needs durable `save` / `load` of one serialized
//! snapshot. Adapters:
//!
//! - [`FilePersistence`]: JSON file, written atomically (temp file, then rename)
//! - [`MemoryPersistence`]: in-process, for tests and throwaway sessions
//! - [`SqlitePersistence`](super::SqlitePersistence): key/value row in SQLite
//!
//! Default location: `~/.local/share/tasksync/tasks.json` (configurable via `Config`)

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::error::{StorageError, StorageResult};

/// Durable storage for the serialized store snapshot
pub trait Persistence: Send {
    /// Persist the serialized state, replacing any previous one
    fn save(&self, snapshot: &str) -> StorageResult<()>;

    /// Load the last saved state, `None` if nothing was saved yet
    fn load(&self) -> StorageResult<Option<String>>;

    /// Move an unreadable snapshot aside so it is not overwritten
    ///
    /// Returns the backup location when the adapter keeps one. Earlier
    /// backups are never replaced.
    fn quarantine(&self) -> StorageResult<Option<String>> {
        Ok(None)
    }
}

/// Snapshot stored as a JSON file
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if a snapshot exists on disk
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// First free `<path>.corrupt[.N].backup`
    fn backup_path(&self) -> PathBuf {
        let candidate = |suffix: String| {
            let mut name = self.path.as_os_str().to_owned();
            name.push(suffix);
            PathBuf::from(name)
        };
        let mut backup = candidate(".corrupt.backup".to_string());
        let mut n = 1;
        while backup.exists() {
            backup = candidate(format!(".corrupt.{}.backup", n));
            n += 1;
        }
        backup
    }
}

impl Persistence for FilePersistence {
    fn save(&self, snapshot: &str) -> StorageResult<()> {
        atomic_write(&self.path, snapshot.as_bytes())
    }

    fn load(&self) -> StorageResult<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }

        fs::read_to_string(&self.path)
            .map(Some)
            .map_err(|source| StorageError::Read {
                path: self.path.clone(),
                source,
            })
    }

    fn quarantine(&self) -> StorageResult<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let backup = self.backup_path();
        fs::rename(&self.path, &backup).map_err(|source| StorageError::Rename {
            from: self.path.clone(),
            to: backup.clone(),
            source,
        })?;
        Ok(Some(backup.display().to_string()))
    }
}

/// In-memory snapshot holder
///
/// Clones share the same slot, so a test can keep a handle while the store
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    slot: Arc<Mutex<Option<String>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an existing serialized snapshot
    pub fn with_snapshot(raw: impl Into<String>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(raw.into()))),
        }
    }

    /// The raw saved snapshot
    pub fn raw(&self) -> Option<String> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Persistence for MemoryPersistence {
    fn save(&self, snapshot: &str) -> StorageResult<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.to_string());
        Ok(())
    }

    fn load(&self) -> StorageResult<Option<String>> {
        Ok(self.raw())
    }

    fn quarantine(&self) -> StorageResult<Option<String>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(None)
    }
}

/// Write data to a file atomically
///
/// 1. Write to a temporary file in the same directory
/// 2. Sync the file to disk
/// 3. Rename the temp file to the target path
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    // Same directory, so the rename stays on one filesystem
    let temp_path = path.with_extension("tmp");

    let mut file =
        File::create(&temp_path).map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.write_all(data)
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.sync_all()
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;

    fs::rename(&temp_path, path).map_err(|source| StorageError::Rename {
        from: temp_path.clone(),
        to: path.to_path_buf(),
        source,
    })?;

    Ok(())
}
