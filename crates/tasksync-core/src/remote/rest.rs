//! HTTP remote store
//!
//! Talks to a PostgREST-style table endpoint (`{base}/rest/v1/{table}`):
//!
//! | Operation | Request                                               |
//! |-----------|-------------------------------------------------------|
//! | create    | `POST` body `[row]`, `Prefer: return=representation`  |
//! | update    | `PATCH ?id=eq.<id>` body fields                       |
//! | delete    | `DELETE ?id=in.(<ids>)`                               |
//! | query     | `GET ?select=*&order=created_at.desc`                 |
//!
//! The change feed is produced by polling `query` and diffing consecutive
//! snapshots into INSERT / UPDATE / DELETE events.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ChangeEvent, QueryOrder, RemoteAdapter, RemoteError, Subscription};
use crate::models::{TaskFields, TaskId, TaskRow};

/// Default change-feed polling interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// PostgREST-style remote adapter
#[derive(Clone)]
pub struct RestRemote {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    poll_interval: Duration,
}

impl RestRemote {
    /// Create an adapter for `table` under `base_url`
    pub fn new(base_url: &str, table: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: table_endpoint(base_url, table),
            api_key: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Send `apikey` and bearer authorization headers
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request(&self, method: Method) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, &self.endpoint)
            .header("Accept", "application/json");
        if let Some(ref key) = self.api_key {
            builder = builder
                .header("apikey", key)
                .header("Authorization", format!("Bearer {}", key));
        }
        builder
    }

    async fn fetch_all(&self, order: QueryOrder) -> Result<Vec<TaskRow>, RemoteError> {
        let order = match order {
            QueryOrder::CreatedAtDesc => "created_at.desc",
            QueryOrder::CreatedAtAsc => "created_at.asc",
        };
        let response = self
            .request(Method::GET)
            .query(&[("select", "*"), ("order", order)])
            .send()
            .await
            .map_err(network)?;
        read_rows(response).await
    }
}

#[async_trait]
impl RemoteAdapter for RestRemote {
    fn name(&self) -> &str {
        "rest"
    }

    async fn create(&self, row: &TaskRow) -> Result<TaskRow, RemoteError> {
        let response = self
            .request(Method::POST)
            .header("Prefer", "return=representation")
            .json(&[row])
            .send()
            .await
            .map_err(network)?;

        read_rows(response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::InvalidData("create returned no row".to_string()))
    }

    async fn update(&self, id: &TaskId, fields: &TaskFields) -> Result<TaskRow, RemoteError> {
        let response = self
            .request(Method::PATCH)
            .header("Prefer", "return=representation")
            .query(&[("id", format!("eq.{}", id))])
            .json(fields)
            .send()
            .await
            .map_err(network)?;

        read_rows(response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    async fn delete(&self, ids: &[TaskId]) -> Result<(), RemoteError> {
        if ids.is_empty() {
            return Ok(());
        }
        let response = self
            .request(Method::DELETE)
            .query(&[("id", in_filter(ids))])
            .send()
            .await
            .map_err(network)?;

        check_status(response).await.map(|_| ())
    }

    async fn query(&self, order: QueryOrder) -> Result<Vec<TaskRow>, RemoteError> {
        self.fetch_all(order).await
    }

    /// Poll the table and emit row differences as change events
    ///
    /// Each subscription diffs against a fresh baseline, so changes made
    /// while unsubscribed (for example while offline) are not emitted.
    async fn subscribe(&self) -> Result<Subscription, RemoteError> {
        let baseline = self.fetch_all(QueryOrder::CreatedAtDesc).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let remote = self.clone();

        let handle = tokio::spawn(async move {
            let mut previous = baseline;
            loop {
                tokio::time::sleep(remote.poll_interval).await;
                match remote.fetch_all(QueryOrder::CreatedAtDesc).await {
                    Ok(rows) => {
                        let events = diff_rows(&previous, &rows);
                        if !events.is_empty() {
                            debug!("Change feed poll produced {} event(s)", events.len());
                        }
                        for event in events {
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                        previous = rows;
                    }
                    Err(e) => warn!("Change feed poll failed: {}", e),
                }
                if tx.is_closed() {
                    return;
                }
            }
        });

        Ok(Subscription::new(rx, move || handle.abort()))
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let response = self
            .request(Method::GET)
            .query(&[("select", "id"), ("limit", "1")])
            .send()
            .await
            .map_err(network)?;
        check_status(response).await.map(|_| ())
    }
}

/// Diff two snapshots into change events
///
/// Rows only in `next` are inserts, rows only in `previous` are deletes,
/// rows in both with different content are updates.
pub fn diff_rows(previous: &[TaskRow], next: &[TaskRow]) -> Vec<ChangeEvent> {
    let before: HashMap<&TaskId, &TaskRow> = previous.iter().map(|r| (&r.id, r)).collect();
    let after: HashMap<&TaskId, &TaskRow> = next.iter().map(|r| (&r.id, r)).collect();

    let mut events = Vec::new();
    for row in next {
        match before.get(&row.id) {
            None => events.push(ChangeEvent::insert(row.clone())),
            Some(old) if *old != row => {
                events.push(ChangeEvent::update(Some((*old).clone()), row.clone()))
            }
            Some(_) => {}
        }
    }
    for row in previous {
        if !after.contains_key(&row.id) {
            events.push(ChangeEvent::delete(row.clone()));
        }
    }
    events
}

fn table_endpoint(base_url: &str, table: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/rest/v1") {
        format!("{}/{}", base, table)
    } else {
        format!("{}/rest/v1/{}", base, table)
    }
}

/// PostgREST `in` filter with quoted values
fn in_filter(ids: &[TaskId]) -> String {
    let quoted: Vec<String> = ids
        .iter()
        .map(|id| format!("\"{}\"", id.as_str().replace('"', "\\\"")))
        .collect();
    format!("in.({})", quoted.join(","))
}

fn network(e: reqwest::Error) -> RemoteError {
    RemoteError::Network(e.to_string())
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(RemoteError::NotFound(message));
    }
    Err(RemoteError::Rejected {
        status: status.as_u16(),
        message,
    })
}

async fn read_rows(response: Response) -> Result<Vec<TaskRow>, RemoteError> {
    let response = check_status(response).await?;
    response
        .json::<Vec<TaskRow>>()
        .await
        .map_err(|e| RemoteError::InvalidData(e.to_string()))
}
