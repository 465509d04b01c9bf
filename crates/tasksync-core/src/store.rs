//! Record store
//!
//! The `RecordStore` owns the ordered task collection and is the single
//! source of truth the front-end renders from. Every change goes through
//! [`RecordStore::apply`] with a [`Mutation`]:
//!
//! 1. The mutation is applied to the collection (pure, keyed by id)
//! 2. The new state is written to the persistence adapter
//! 3. Subscribers are notified with the committed state
//!
//! ## Usage
//!
//! ```ignore
//! let mut store = RecordStore::open(Box::new(FilePersistence::new(path)))?;
//! store.apply(Mutation::Prepend(task));
//!
//! let mut rx = store.subscribe();
//! rx.changed().await?;
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::models::{Task, TaskId};
use crate::storage::{Persistence, Snapshot, StorageError, StorageResult};

/// A change to the task collection
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Add a task at the front, replacing any task with the same id
    Prepend(Task),
    /// Replace the task with `id` in place
    ///
    /// The replacement may carry a different id (remote canonical id). Any
    /// other task already holding that id is dropped.
    Replace { id: TaskId, task: Task },
    /// Remove all tasks with these ids
    Remove(Vec<TaskId>),
    /// Replace the whole collection
    Reset(Vec<Task>),
}

impl Mutation {
    /// Apply this mutation to an ordered collection
    ///
    /// Returns whether the collection changed.
    pub fn apply_to(self, tasks: &mut Vec<Task>) -> bool {
        match self {
            Mutation::Prepend(task) => {
                tasks.retain(|t| t.id != task.id);
                tasks.insert(0, task);
                true
            }
            Mutation::Replace { id, task } => {
                let Some(pos) = tasks.iter().position(|t| t.id == id) else {
                    return false;
                };
                if tasks[pos] == task {
                    return false;
                }
                let new_id = task.id.clone();
                tasks[pos] = task;
                if new_id != id {
                    // Drop every other holder of the new id; the replaced slot stays
                    let mut index = 0;
                    tasks.retain(|t| {
                        let keep = index == pos || t.id != new_id;
                        index += 1;
                        keep
                    });
                }
                true
            }
            Mutation::Remove(ids) => {
                let before = tasks.len();
                tasks.retain(|t| !ids.contains(&t.id));
                tasks.len() != before
            }
            Mutation::Reset(new_tasks) => {
                let mut seen = BTreeSet::new();
                let deduped: Vec<Task> = new_tasks
                    .into_iter()
                    .filter(|t| seen.insert(t.id.clone()))
                    .collect();
                if *tasks == deduped {
                    return false;
                }
                *tasks = deduped;
                true
            }
        }
    }
}

/// Summary counts for the current collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct Summary {
    /// Tasks not yet done
    pub open: usize,
    /// Tasks marked done
    pub completed: usize,
    /// Tasks with local changes the remote has not confirmed
    pub unsynced: usize,
    /// Tasks whose delivery attempts are exhausted
    pub failed: usize,
}

/// Owned, persisted task collection
pub struct RecordStore {
    tasks: Vec<Task>,
    persistence: Box<dyn Persistence>,
    tx: watch::Sender<Arc<Vec<Task>>>,
    discarded: Option<StorageError>,
}

impl RecordStore {
    /// Open a store, loading the last persisted snapshot if any
    ///
    /// An unreadable snapshot is moved aside and the store starts empty;
    /// [`RecordStore::discarded_snapshot`] then describes what happened.
    pub fn open(persistence: Box<dyn Persistence>) -> StorageResult<Self> {
        let mut discarded = None;
        let tasks = match persistence.load()? {
            Some(raw) => match Snapshot::decode(&raw) {
                Ok(snapshot) => snapshot.tasks,
                Err(e) => {
                    let err = StorageError::CorruptSnapshot {
                        backup: persistence.quarantine()?,
                        details: e.to_string(),
                    };
                    warn!("{}", err);
                    discarded = Some(err);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        debug!("Loaded {} task(s) from snapshot", tasks.len());

        let (tx, _) = watch::channel(Arc::new(tasks.clone()));
        Ok(Self {
            tasks,
            persistence,
            tx,
            discarded,
        })
    }

    /// Apply a mutation, persist, and notify subscribers
    ///
    /// Returns whether the collection changed. A persistence failure is
    /// logged; the in-memory state stays committed.
    pub fn apply(&mut self, mutation: Mutation) -> bool {
        if !mutation.apply_to(&mut self.tasks) {
            return false;
        }
        if let Err(e) = self.persist() {
            warn!("Failed to persist snapshot: {}", e);
        }
        self.tx.send_replace(Arc::new(self.tasks.clone()));
        true
    }

    /// Write the current state to the persistence adapter
    pub fn persist(&self) -> StorageResult<()> {
        let raw = Snapshot::new(self.tasks.clone()).encode()?;
        self.persistence.save(&raw)
    }

    /// Subscribe to committed states
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Task>>> {
        self.tx.subscribe()
    }

    /// Set when `open` had to discard an unreadable snapshot
    pub fn discarded_snapshot(&self) -> Option<&StorageError> {
        self.discarded.as_ref()
    }

    /// Tasks in store order (newest first)
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether `id` belongs to a task with unconfirmed local state
    ///
    /// This is the gate the reconciler consults before applying any remote
    /// change event.
    pub fn is_unconfirmed(&self, id: &TaskId) -> bool {
        self.get(id).is_some_and(|t| t.sync.is_unconfirmed())
    }

    /// Ids of tasks queued for delivery
    pub fn pending_ids(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.sync.is_pending())
            .map(|t| t.id.clone())
            .collect()
    }

    /// Ids of tasks marked done
    pub fn done_ids(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.done)
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn summary(&self) -> Summary {
        summarize(&self.tasks)
    }
}

/// Tasks sorted by recency
///
/// Unconfirmed tasks without a `created_at` are the newest and come first,
/// in store order.
pub fn sorted_by_recency(tasks: &[Task]) -> Vec<Task> {
    let mut sorted = tasks.to_vec();
    sorted.sort_by(|a, b| match (a.created_at, b.created_at) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(x), Some(y)) => y.cmp(&x),
    });
    sorted
}

/// Distinct tags across all tasks, sorted
pub fn all_tags(tasks: &[Task]) -> Vec<String> {
    tasks
        .iter()
        .flat_map(|t| t.tags.iter().map(|tag| tag.to_lowercase()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Tasks matching an optional tag and a free-text query
///
/// `None` for the tag selects all tasks. The query is trimmed and matched
/// case-insensitively against text and description; a blank query matches
/// everything.
pub fn filtered(tasks: &[Task], tag: Option<&str>, query: &str) -> Vec<Task> {
    let needle = query.trim().to_lowercase();
    let tag = tag.map(str::to_lowercase);
    tasks
        .iter()
        .filter(|t| tag.as_deref().map_or(true, |tag| t.has_tag(tag)))
        .filter(|t| needle.is_empty() || t.matches_query(&needle))
        .cloned()
        .collect()
}

pub fn summarize(tasks: &[Task]) -> Summary {
    let mut summary = Summary::default();
    for task in tasks {
        if task.done {
            summary.completed += 1;
        } else {
            summary.open += 1;
        }
        if task.sync.is_unconfirmed() {
            summary.unsynced += 1;
        }
        if task.sync.is_failed() {
            summary.failed += 1;
        }
    }
    summary
}
