//! Remote store abstraction
//!
//! The remote store is the authority for confirmed tasks. The sync engine
//! talks to it only through [`RemoteAdapter`]:
//!
//! - `create` / `update` / `delete` / `query` for request-response calls
//! - `subscribe` for the change feed of INSERT / UPDATE / DELETE events
//!
//! Adapters:
//! - [`MemoryRemote`]: in-process authority with failure injection
//! - [`RestRemote`]: PostgREST-style HTTP API with a polled change feed
//! - [`Unconfigured`]: stand-in when no remote is configured

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::models::{TaskFields, TaskId, TaskRow};

pub mod memory;
pub mod rest;

pub use memory::{CallCounts, MemoryRemote};
pub use rest::RestRemote;

/// Errors returned by remote adapters
///
/// The dispatcher treats all of them as transient delivery failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Task not found on remote: {0}")]
    NotFound(String),

    #[error("Invalid data from remote: {0}")]
    InvalidData(String),

    #[error("Remote store unavailable: {0}")]
    Unavailable(String),
}

/// Ordering for full queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryOrder {
    #[default]
    CreatedAtDesc,
    CreatedAtAsc,
}

/// Kind of remote change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// Anything else the feed may send; ignored
    #[serde(other)]
    Unknown,
}

/// One change-feed notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventType")]
    pub event_type: ChangeKind,
    #[serde(default, deserialize_with = "row_or_empty")]
    pub new: Option<TaskRow>,
    #[serde(default, deserialize_with = "row_or_empty")]
    pub old: Option<TaskRow>,
}

impl ChangeEvent {
    pub fn insert(row: TaskRow) -> Self {
        Self {
            event_type: ChangeKind::Insert,
            new: Some(row),
            old: None,
        }
    }

    pub fn update(old: Option<TaskRow>, new: TaskRow) -> Self {
        Self {
            event_type: ChangeKind::Update,
            new: Some(new),
            old,
        }
    }

    pub fn delete(old: TaskRow) -> Self {
        Self {
            event_type: ChangeKind::Delete,
            new: None,
            old: Some(old),
        }
    }

    /// Id of the affected task: `new.id` if present, else `old.id`
    pub fn affected_id(&self) -> Option<&TaskId> {
        self.new
            .as_ref()
            .map(|r| &r.id)
            .or_else(|| self.old.as_ref().map(|r| &r.id))
    }
}

/// Feeds send `{}` for the side of an event that has no record
fn row_or_empty<'de, D>(deserializer: D) -> Result<Option<TaskRow>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        Some(v) if v.get("id").is_some_and(|id| !id.is_null()) => serde_json::from_value(v)
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

/// A live change-feed subscription
///
/// Events arrive on an internal channel. Dropping the subscription or
/// calling [`Subscription::unsubscribe`] stops delivery.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        events: mpsc::UnboundedReceiver<ChangeEvent>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Wait for the next event, `None` once the feed has ended
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Stop receiving events
    pub fn unsubscribe(mut self) {
        self.cancel_feed();
    }

    fn cancel_feed(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_feed();
    }
}

impl Stream for Subscription {
    type Item = ChangeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

/// Authoritative remote task store
#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    /// Short identifier for logs (e.g. "memory", "rest")
    fn name(&self) -> &str;

    /// Create a task; returns the canonical stored record
    async fn create(&self, row: &TaskRow) -> Result<TaskRow, RemoteError>;

    /// Update the mutable fields of a task; returns the canonical record
    async fn update(&self, id: &TaskId, fields: &TaskFields) -> Result<TaskRow, RemoteError>;

    /// Delete tasks by id
    async fn delete(&self, ids: &[TaskId]) -> Result<(), RemoteError>;

    /// Fetch all tasks
    async fn query(&self, order: QueryOrder) -> Result<Vec<TaskRow>, RemoteError>;

    /// Subscribe to the change feed
    async fn subscribe(&self) -> Result<Subscription, RemoteError>;

    /// Cheap reachability check
    async fn ping(&self) -> Result<(), RemoteError> {
        self.query(QueryOrder::CreatedAtDesc).await.map(|_| ())
    }
}

/// Remote used when none is configured: every call is unavailable
#[derive(Debug, Clone, Default)]
pub struct Unconfigured;

#[async_trait]
impl RemoteAdapter for Unconfigured {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn create(&self, _row: &TaskRow) -> Result<TaskRow, RemoteError> {
        Err(not_configured())
    }

    async fn update(&self, _id: &TaskId, _fields: &TaskFields) -> Result<TaskRow, RemoteError> {
        Err(not_configured())
    }

    async fn delete(&self, _ids: &[TaskId]) -> Result<(), RemoteError> {
        Err(not_configured())
    }

    async fn query(&self, _order: QueryOrder) -> Result<Vec<TaskRow>, RemoteError> {
        Err(not_configured())
    }

    async fn subscribe(&self) -> Result<Subscription, RemoteError> {
        Err(not_configured())
    }
}

/// Build the remote adapter described by `config`
///
/// Without sync enabled and a remote URL this is [`Unconfigured`].
pub fn from_config(config: &Config) -> Arc<dyn RemoteAdapter> {
    match config.remote_url.as_deref() {
        Some(url) if config.sync_enabled => {
            let mut remote = RestRemote::new(url, &config.remote_table)
                .with_poll_interval(config.poll_interval());
            if let Some(ref key) = config.remote_key {
                remote = remote.with_api_key(key.clone());
            }
            Arc::new(remote)
        }
        _ => Arc::new(Unconfigured),
    }
}

fn not_configured() -> RemoteError {
    RemoteError::Unavailable("no remote store configured".to_string())
}
