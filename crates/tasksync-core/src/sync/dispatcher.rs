//! Sync dispatcher
//!
//! Drives pending tasks through to remote confirmation. The dispatcher owns
//! the bookkeeping that makes concurrent delivery safe:
//!
//! - `revisions`: a per-task counter bumped on every local mutation, so a
//!   response or retry can tell whether the task changed since it was sent
//! - `in_flight`: at most one remote call per task at a time
//! - `scheduled`: retry timers that are still armed
//!
//! It never performs I/O itself. [`Dispatcher::prepare`] hands back a
//! [`Request`] for the engine to send, and [`Dispatcher::complete`] folds the
//! result back into the store.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tracing::{debug, warn};

use crate::models::{SyncAction, SyncState, Task, TaskFields, TaskId, TaskRow};
use crate::remote::{RemoteAdapter, RemoteError};
use crate::store::{Mutation, RecordStore};

/// Bounded retry policy for failed deliveries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per action before a task is marked failed
    pub max_retries: u32,
    /// Fixed delay before the next automatic attempt
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(5),
        }
    }
}

/// A remote call for one pending task, without sync metadata
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Create(TaskRow),
    Update(TaskId, TaskFields),
}

impl Request {
    /// Build the call a pending task needs
    pub fn for_task(task: &Task) -> Option<Self> {
        match task.sync {
            SyncState::Pending {
                action: SyncAction::Insert,
                ..
            } => Some(Request::Create(task.to_row())),
            SyncState::Pending {
                action: SyncAction::Update,
                ..
            } => Some(Request::Update(task.id.clone(), task.fields())),
            _ => None,
        }
    }

    pub async fn send(self, remote: &dyn RemoteAdapter) -> Result<TaskRow, RemoteError> {
        match self {
            Request::Create(row) => remote.create(&row).await,
            Request::Update(id, fields) => remote.update(&id, &fields).await,
        }
    }
}

/// Receipt for a dispatched call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub action: SyncAction,
    /// Task revision at dispatch time
    pub revision: u64,
}

/// Identity of a scheduled retry
///
/// A retry is only acted on if the task is still pending with the same
/// action, attempt count and revision when the timer fires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RetryKey {
    pub id: TaskId,
    pub action: SyncAction,
    pub attempts: u32,
    pub revision: u64,
}

/// What happened when a delivery result was folded into the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Task replaced by the canonical remote record
    Confirmed(TaskId),
    /// Delivered, but the task was edited meanwhile; send the newer state
    Superseded(TaskId),
    /// Failed; retry after the policy delay
    Retry(RetryKey),
    /// Failed and out of attempts
    Exhausted(TaskId),
    /// Task gone or no longer pending; result dropped
    Ignored,
}

/// Per-task delivery bookkeeping
#[derive(Debug, Default)]
pub struct Dispatcher {
    policy: RetryPolicy,
    revisions: HashMap<TaskId, u64>,
    in_flight: HashMap<TaskId, Ticket>,
    scheduled: HashSet<RetryKey>,
}

impl Dispatcher {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Record a local mutation of `id`, invalidating earlier retries
    pub fn touch(&mut self, id: &TaskId) -> u64 {
        self.scheduled.retain(|k| &k.id != id);
        let revision = self.revisions.entry(id.clone()).or_insert(0);
        *revision += 1;
        *revision
    }

    pub fn revision(&self, id: &TaskId) -> u64 {
        self.revisions.get(id).copied().unwrap_or(0)
    }

    pub fn is_in_flight(&self, id: &TaskId) -> bool {
        self.in_flight.contains_key(id)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn scheduled_retries(&self) -> usize {
        self.scheduled.len()
    }

    /// Start delivery of `id` if it is pending and nothing is in flight
    ///
    /// Offline dispatches are skipped without counting an attempt; the
    /// reconnect replay picks them up.
    pub fn prepare(
        &mut self,
        store: &RecordStore,
        id: &TaskId,
        online: bool,
    ) -> Option<(Request, Ticket)> {
        if self.in_flight.contains_key(id) {
            debug!("Task {} already in flight", id);
            return None;
        }
        let task = store.get(id)?;
        let request = Request::for_task(task)?;
        if !online {
            debug!("Offline, deferring delivery of {}", id);
            return None;
        }

        let ticket = Ticket {
            action: task.sync.action()?,
            revision: self.revision(id),
        };
        self.in_flight.insert(id.clone(), ticket);
        // A dispatch makes any armed timer for this task moot
        self.scheduled.retain(|k| &k.id != id);
        debug!("Dispatching {:?} for {}", ticket.action, id);
        Some((request, ticket))
    }

    /// Fold a delivery result into the store
    pub fn complete(
        &mut self,
        store: &mut RecordStore,
        id: &TaskId,
        ticket: Ticket,
        result: Result<TaskRow, RemoteError>,
    ) -> Completion {
        if self.in_flight.get(id) == Some(&ticket) {
            self.in_flight.remove(id);
        }
        let Some(task) = store.get(id).filter(|t| t.sync.is_pending()).cloned() else {
            debug!("Dropping delivery result for {}", id);
            return Completion::Ignored;
        };
        let superseded = self.revision(id) != ticket.revision;

        match result {
            Ok(row) if !superseded => {
                let canonical = row.id.clone();
                self.rekey(id, &canonical);
                store.apply(Mutation::Replace {
                    id: id.clone(),
                    task: row.into_task(),
                });
                debug!("Confirmed {}", canonical);
                Completion::Confirmed(canonical)
            }
            Ok(row) => {
                // The remote has the record now; the local edit goes out as an update
                let mut local = task;
                local.id = row.id.clone();
                local.created_at = row.created_at.or(local.created_at);
                local.sync = SyncState::Pending {
                    action: SyncAction::Update,
                    attempts: 0,
                };
                let canonical = local.id.clone();
                self.rekey(id, &canonical);
                store.apply(Mutation::Replace {
                    id: id.clone(),
                    task: local,
                });
                debug!("Delivery of {} superseded by a local edit", canonical);
                Completion::Superseded(canonical)
            }
            Err(e) => {
                let mut failed = task;
                failed.sync = failed.sync.after_failure(self.policy.max_retries);
                let state = failed.sync;
                store.apply(Mutation::Replace {
                    id: id.clone(),
                    task: failed,
                });

                match state {
                    SyncState::Failed { attempts, .. } => {
                        warn!(
                            "Giving up on {} after {} attempt(s): {}",
                            id, attempts, e
                        );
                        Completion::Exhausted(id.clone())
                    }
                    SyncState::Pending { action, attempts } => {
                        warn!(
                            "Delivery of {} failed (attempt {}/{}): {}",
                            id, attempts, self.policy.max_retries, e
                        );
                        let key = RetryKey {
                            id: id.clone(),
                            action,
                            attempts,
                            revision: self.revision(id),
                        };
                        self.scheduled.insert(key.clone());
                        Completion::Retry(key)
                    }
                    SyncState::Confirmed => Completion::Ignored,
                }
            }
        }
    }

    /// Consume a fired retry timer; returns whether it is still current
    pub fn retry_due(&mut self, store: &RecordStore, key: &RetryKey) -> bool {
        if !self.scheduled.remove(key) {
            return false;
        }
        let current = store.get(&key.id).is_some_and(|t| {
            t.sync
                == SyncState::Pending {
                    action: key.action,
                    attempts: key.attempts,
                }
        }) && self.revision(&key.id) == key.revision
            && !self.in_flight.contains_key(&key.id);

        if !current {
            debug!("Stale retry for {}", key.id);
        }
        current
    }

    /// Drop bookkeeping for tasks that left the store
    pub fn forget(&mut self, ids: &[TaskId]) {
        for id in ids {
            self.revisions.remove(id);
            self.in_flight.remove(id);
        }
        self.scheduled.retain(|k| !ids.contains(&k.id));
    }

    fn rekey(&mut self, from: &TaskId, to: &TaskId) {
        if from == to {
            return;
        }
        if let Some(revision) = self.revisions.remove(from) {
            self.revisions.insert(to.clone(), revision);
        }
        self.scheduled.retain(|k| &k.id != from);
    }
}
