//! Snapshot codec
//!
//! The persisted state is the full task list including sync metadata,
//! wrapped in a small versioned envelope:
//!
//! ```text
//! { "version": 1, "tasks": [ { "id": ..., "pending": true, ... } ] }
//! ```
//!
//! A bare JSON array of tasks is also accepted on load.

use serde::{Deserialize, Serialize};

use super::error::{StorageError, StorageResult};
use crate::models::Task;

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serialized store state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub tasks: Vec<Task>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AnySnapshot {
    Versioned(Snapshot),
    Bare(Vec<Task>),
}

impl Snapshot {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            tasks,
        }
    }

    /// Encode to a JSON string
    pub fn encode(&self) -> StorageResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from a JSON string
    pub fn decode(raw: &str) -> StorageResult<Self> {
        let parsed: AnySnapshot = serde_json::from_str(raw)
            .map_err(|e| StorageError::InvalidFormat(e.to_string()))?;

        match parsed {
            AnySnapshot::Versioned(snapshot) if snapshot.version > SNAPSHOT_VERSION => {
                Err(StorageError::InvalidFormat(format!(
                    "unsupported snapshot version {}",
                    snapshot.version
                )))
            }
            AnySnapshot::Versioned(snapshot) => Ok(snapshot),
            AnySnapshot::Bare(tasks) => Ok(Self::new(tasks)),
        }
    }
}
