//! Change-feed reconciliation
//!
//! Folds remote change events into the record store. The feed is
//! at-least-once and unordered, and may echo writes that are still in
//! flight from this client.
//!
//! One gate decides everything: if the affected id belongs to a task with
//! unconfirmed local state, the event is dropped. That task's own delivery
//! path is the only authority for its id until it resolves. Events for
//! confirmed ids are applied as-is. Sync metadata is never touched here.

use tracing::debug;

use crate::models::TaskId;
use crate::remote::{ChangeEvent, ChangeKind};
use crate::store::{Mutation, RecordStore};

/// Result of reconciling one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    Inserted(TaskId),
    Updated(TaskId),
    Deleted(TaskId),
    /// Dropped: the id has unconfirmed local state
    Suppressed(TaskId),
    /// Unknown type, missing record, or no effect
    Ignored,
}

/// The reconciliation gate
pub fn is_suppressed(store: &RecordStore, id: &TaskId) -> bool {
    store.is_unconfirmed(id)
}

/// Apply one change event to the store
pub fn reconcile(store: &mut RecordStore, event: ChangeEvent) -> Reconciled {
    let Some(id) = event.affected_id().cloned() else {
        return Reconciled::Ignored;
    };
    if is_suppressed(store, &id) {
        debug!("Suppressed {:?} event for unconfirmed {}", event.event_type, id);
        return Reconciled::Suppressed(id);
    }

    match event.event_type {
        ChangeKind::Insert => match event.new {
            Some(row) => {
                store.apply(Mutation::Prepend(row.into_task()));
                Reconciled::Inserted(id)
            }
            None => Reconciled::Ignored,
        },
        ChangeKind::Update => match event.new {
            Some(row) => {
                let task = row.into_task();
                if store.apply(Mutation::Replace {
                    id: id.clone(),
                    task,
                }) {
                    Reconciled::Updated(id)
                } else {
                    Reconciled::Ignored
                }
            }
            None => Reconciled::Ignored,
        },
        ChangeKind::Delete => {
            if store.apply(Mutation::Remove(vec![id.clone()])) {
                Reconciled::Deleted(id)
            } else {
                Reconciled::Ignored
            }
        }
        ChangeKind::Unknown => Reconciled::Ignored,
    }
}
