//! In-process remote store
//!
//! Behaves like the authoritative store: assigns `created_at` on create,
//! keeps rows, and broadcasts change events to every subscriber. Tests use
//! the failure and latency knobs to drive the engine through retries and
//! in-flight races, and the `external_*` methods to play another client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::{ChangeEvent, QueryOrder, RemoteAdapter, RemoteError, Subscription};
use crate::models::{TaskFields, TaskId, TaskRow};

/// Number of calls made per operation, failed ones included
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub query: usize,
}

impl CallCounts {
    /// Calls that write to the store
    pub fn writes(&self) -> usize {
        self.create + self.update + self.delete
    }
}

#[derive(Default)]
struct Inner {
    rows: Vec<TaskRow>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<ChangeEvent>>,
    next_subscriber: u64,
    calls: CallCounts,
    failing: bool,
    fail_next: u32,
    fail_subscribe: u32,
    latency: Option<Duration>,
    canonical_prefix: Option<String>,
    next_canonical: u64,
    last_created: Option<DateTime<Utc>>,
}

impl Inner {
    fn broadcast(&mut self, event: ChangeEvent) {
        self.subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    fn next_created_at(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_created {
            if now <= last {
                now = last + chrono::Duration::milliseconds(1);
            }
        }
        self.last_created = Some(now);
        now
    }
}

#[derive(Debug, Clone, Copy)]
enum Call {
    Create,
    Update,
    Delete,
    Query,
}

/// In-memory authoritative store
#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with existing rows (first row is the newest)
    pub fn with_rows(rows: Vec<TaskRow>) -> Self {
        let remote = Self::new();
        remote.lock().rows = rows;
        remote
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every call fail until cleared
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Make the next `n` write calls fail
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Make the next `n` subscribe calls fail
    pub fn fail_next_subscribe(&self, n: u32) {
        self.lock().fail_subscribe = n;
    }

    /// End every open change feed, as a dropped connection would
    pub fn close_feeds(&self) {
        self.lock().subscribers.clear();
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Assign server-side ids (`<prefix>-<n>`) instead of keeping client ids
    pub fn assign_canonical_ids(&self, prefix: impl Into<String>) {
        self.lock().canonical_prefix = Some(prefix.into());
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Stored rows, newest first
    pub fn rows(&self) -> Vec<TaskRow> {
        self.lock().rows.clone()
    }

    pub fn get(&self, id: &TaskId) -> Option<TaskRow> {
        self.lock().rows.iter().find(|r| &r.id == id).cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Another client inserted a row
    pub fn external_insert(&self, mut row: TaskRow) -> TaskRow {
        let mut inner = self.lock();
        if row.created_at.is_none() {
            row.created_at = Some(inner.next_created_at());
        }
        inner.rows.retain(|r| r.id != row.id);
        inner.rows.insert(0, row.clone());
        inner.broadcast(ChangeEvent::insert(row.clone()));
        row
    }

    /// Another client updated a row
    pub fn external_update(&self, row: TaskRow) {
        let mut inner = self.lock();
        let old = inner.rows.iter().position(|r| r.id == row.id).map(|pos| {
            let old = inner.rows[pos].clone();
            inner.rows[pos] = row.clone();
            old
        });
        inner.broadcast(ChangeEvent::update(old, row));
    }

    /// Another client deleted a row
    pub fn external_delete(&self, id: &TaskId) {
        let mut inner = self.lock();
        if let Some(pos) = inner.rows.iter().position(|r| &r.id == id) {
            let old = inner.rows.remove(pos);
            inner.broadcast(ChangeEvent::delete(old));
        }
    }

    /// Push a raw event to subscribers without touching rows
    pub fn emit(&self, event: ChangeEvent) {
        self.lock().broadcast(event);
    }

    async fn begin(&self, call: Call) -> Result<(), RemoteError> {
        let latency = {
            let mut inner = self.lock();
            match call {
                Call::Create => inner.calls.create += 1,
                Call::Update => inner.calls.update += 1,
                Call::Delete => inner.calls.delete += 1,
                Call::Query => inner.calls.query += 1,
            }
            inner.latency
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.lock();
        if inner.failing {
            return Err(RemoteError::Network("connection refused".to_string()));
        }
        if !matches!(call, Call::Query) && inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(RemoteError::Rejected {
                status: 503,
                message: "service unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteAdapter for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self, row: &TaskRow) -> Result<TaskRow, RemoteError> {
        self.begin(Call::Create).await?;

        let mut inner = self.lock();
        let mut stored = row.clone();
        if let Some(prefix) = inner.canonical_prefix.clone() {
            inner.next_canonical += 1;
            stored.id = TaskId::from(format!("{}-{}", prefix, inner.next_canonical));
        }
        if inner.rows.iter().any(|r| r.id == stored.id) {
            return Err(RemoteError::Rejected {
                status: 409,
                message: format!("duplicate key: {}", stored.id),
            });
        }
        stored.created_at = Some(inner.next_created_at());
        inner.rows.insert(0, stored.clone());
        inner.broadcast(ChangeEvent::insert(stored.clone()));
        Ok(stored)
    }

    async fn update(&self, id: &TaskId, fields: &TaskFields) -> Result<TaskRow, RemoteError> {
        self.begin(Call::Update).await?;

        let mut inner = self.lock();
        let Some(pos) = inner.rows.iter().position(|r| &r.id == id) else {
            return Err(RemoteError::NotFound(id.to_string()));
        };
        let old = inner.rows[pos].clone();
        let updated = TaskRow {
            id: old.id.clone(),
            text: fields.text.clone(),
            description: fields.description.clone(),
            done: fields.done,
            tags: fields.tags.clone(),
            due_date: fields.due_date,
            created_at: old.created_at,
        };
        inner.rows[pos] = updated.clone();
        inner.broadcast(ChangeEvent::update(Some(old), updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, ids: &[TaskId]) -> Result<(), RemoteError> {
        self.begin(Call::Delete).await?;

        let mut inner = self.lock();
        let (removed, kept): (Vec<TaskRow>, Vec<TaskRow>) =
            std::mem::take(&mut inner.rows)
                .into_iter()
                .partition(|r| ids.contains(&r.id));
        inner.rows = kept;
        for old in removed {
            inner.broadcast(ChangeEvent::delete(old));
        }
        Ok(())
    }

    async fn query(&self, order: QueryOrder) -> Result<Vec<TaskRow>, RemoteError> {
        self.begin(Call::Query).await?;

        let mut rows = self.rows();
        rows.sort_by(|a, b| match order {
            QueryOrder::CreatedAtDesc => b.created_at.cmp(&a.created_at),
            QueryOrder::CreatedAtAsc => a.created_at.cmp(&b.created_at),
        });
        Ok(rows)
    }

    async fn subscribe(&self) -> Result<Subscription, RemoteError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.lock();
            if inner.fail_subscribe > 0 {
                inner.fail_subscribe -= 1;
                return Err(RemoteError::Unavailable("change feed refused".to_string()));
            }
            let id = inner.next_subscriber;
            inner.next_subscriber += 1;
            inner.subscribers.insert(id, tx);
            id
        };

        let weak = Arc::downgrade(&self.inner);
        Ok(Subscription::new(rx, move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .subscribers
                    .remove(&id);
            }
        }))
    }
}
