//! Sync engine
//!
//! A single tokio task owns the [`RecordStore`] and the [`Dispatcher`]. All
//! mutation, dispatch and reconciliation happens on that task, driven by:
//!
//! - intents from [`SyncEngine`] handles (command channel)
//! - finished remote calls and retry timers (a `JoinSet` of spawned work)
//! - change-feed events (the remote subscription)
//! - connectivity transitions (a `watch` receiver)
//!
//! Reads never go through the task: handles keep a `watch` receiver of the
//! committed task list and of the engine status.
//!
//! ## Usage
//!
//! ```ignore
//! let engine = SyncEngine::start(settings, store, remote, connectivity).await?;
//! let task = engine.add_task(NewTask::new("Buy milk")).await?;
//! engine.toggle_done(&task.id).await?;
//! engine.wait_idle(Duration::from_secs(5)).await;
//! engine.shutdown().await?;
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::dispatcher::{Completion, Dispatcher, RetryKey, RetryPolicy, Ticket};
use super::reconciler::{reconcile, Reconciled};
use crate::config::Config;
use crate::connectivity::{ConnectionStatus, Connectivity};
use crate::error::{EngineError, EngineResult};
use crate::models::{NewTask, Task, TaskId, TaskRow};
use crate::remote::{ChangeEvent, QueryOrder, RemoteAdapter, RemoteError, Subscription};
use crate::store::{self, Mutation, RecordStore, Summary};

/// Engine tuning
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    /// Delay before retrying a change feed that failed or closed while online
    pub resubscribe_delay: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            resubscribe_delay: Duration::from_secs(15),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: config.retry_policy(),
            resubscribe_delay: config.probe_interval(),
        }
    }
}

/// Point-in-time view of delivery activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct EngineStatus {
    pub online: bool,
    /// Remote calls currently awaiting a response
    pub in_flight: usize,
    /// Armed retry timers
    pub scheduled_retries: usize,
    pub unsynced: usize,
    pub failed: usize,
}

impl EngineStatus {
    /// Nothing in flight and no retry armed
    pub fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.scheduled_retries == 0
    }
}

enum Command {
    Add(NewTask, oneshot::Sender<EngineResult<Task>>),
    Toggle(TaskId, oneshot::Sender<EngineResult<Task>>),
    ClearCompleted(oneshot::Sender<EngineResult<usize>>),
    Shutdown(oneshot::Sender<()>),
}

/// Results of work spawned by the engine task
enum Internal {
    Delivered {
        id: TaskId,
        ticket: Ticket,
        result: Result<TaskRow, RemoteError>,
    },
    RetryDue(RetryKey),
    Cleared {
        ids: Vec<TaskId>,
        result: Result<(), RemoteError>,
        reply: oneshot::Sender<EngineResult<usize>>,
    },
    Subscribed(Result<Subscription, RemoteError>),
    ResubscribeDue,
}

/// Handle to a running sync engine
pub struct SyncEngine {
    commands: mpsc::Sender<Command>,
    tasks: watch::Receiver<Arc<Vec<Task>>>,
    status: watch::Receiver<EngineStatus>,
    handle: JoinHandle<()>,
}

impl SyncEngine {
    /// Reconcile with the remote and start the engine task
    ///
    /// Failed tasks from a previous session are re-armed. When online, the
    /// remote set is fetched and merged: unconfirmed local tasks are kept,
    /// everything else comes from the remote. Pending tasks are dispatched
    /// as soon as the engine task runs.
    pub async fn start(
        settings: EngineSettings,
        mut store: RecordStore,
        remote: Arc<dyn RemoteAdapter>,
        connectivity: Connectivity,
    ) -> EngineResult<Self> {
        rearm_failed(&mut store);

        let mut feed = None;
        if connectivity.is_online() {
            match remote.query(QueryOrder::CreatedAtDesc).await {
                Ok(rows) => {
                    let fetched = rows.len();
                    let merged = merge_startup(store.tasks(), rows);
                    store.apply(Mutation::Reset(merged));
                    info!(
                        "Startup merge: {} remote task(s), {} local pending",
                        fetched,
                        store.pending_ids().len()
                    );
                }
                Err(e) => warn!("Startup query failed, keeping local snapshot: {}", e),
            }
            match remote.subscribe().await {
                Ok(subscription) => feed = Some(subscription),
                Err(e) => warn!("Change feed unavailable: {}", e),
            }
        } else {
            info!("Starting offline with {} task(s)", store.len());
        }

        let (commands, command_rx) = mpsc::channel(32);
        let (status_tx, status) = watch::channel(EngineStatus::default());
        let tasks = store.subscribe();

        let engine_task = EngineTask {
            store,
            dispatcher: Dispatcher::new(settings.retry),
            remote,
            connectivity,
            feed,
            work: JoinSet::new(),
            clearing: 0,
            subscribing: false,
            resubscribe_armed: false,
            resubscribe_delay: settings.resubscribe_delay,
            status_tx,
        };
        let handle = tokio::spawn(engine_task.run(command_rx));

        Ok(Self {
            commands,
            tasks,
            status,
            handle,
        })
    }

    /// Create a task optimistically and queue its insert
    ///
    /// Blank text is rejected without touching the store.
    pub async fn add_task(&self, new: NewTask) -> EngineResult<Task> {
        if !new.is_valid() {
            return Err(EngineError::EmptyText);
        }
        self.request(|reply| Command::Add(new, reply)).await?
    }

    /// Flip `done` and queue the change
    pub async fn toggle_done(&self, id: &TaskId) -> EngineResult<Task> {
        let id = id.clone();
        self.request(|reply| Command::Toggle(id, reply)).await?
    }

    /// Delete every done task on the remote, then locally
    ///
    /// Returns how many tasks were deleted. Not optimistic: on failure the
    /// store is unchanged.
    pub async fn clear_completed(&self) -> EngineResult<usize> {
        self.request(Command::ClearCompleted).await?
    }

    /// Current tasks in store order
    pub fn tasks(&self) -> Arc<Vec<Task>> {
        self.tasks.borrow().clone()
    }

    /// Tasks sorted newest first
    pub fn sorted(&self) -> Vec<Task> {
        store::sorted_by_recency(&self.tasks())
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.tasks.borrow().iter().find(|t| &t.id == id).cloned()
    }

    pub fn tags(&self) -> Vec<String> {
        store::all_tags(&self.tasks())
    }

    pub fn filtered(&self, tag: Option<&str>, query: &str) -> Vec<Task> {
        store::filtered(&self.sorted(), tag, query)
    }

    pub fn summary(&self) -> Summary {
        store::summarize(&self.tasks())
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.borrow()
    }

    /// Receive every committed task list
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Task>>> {
        self.tasks.clone()
    }

    /// Wait until nothing is in flight and no retry is armed
    ///
    /// Returns `false` if `timeout` elapsed first or the engine stopped.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut status = self.status.clone();
        let idle = matches!(
            tokio::time::timeout(timeout, status.wait_for(EngineStatus::is_idle)).await,
            Ok(Ok(_))
        );
        idle
    }

    /// Stop the engine task
    ///
    /// Undelivered tasks stay pending in the snapshot for the next session.
    pub async fn shutdown(self) -> EngineResult<()> {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(reply)).await.is_ok() {
            let _ = done.await;
        }
        self.handle.await.map_err(|_| EngineError::Stopped)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> EngineResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| EngineError::Stopped)?;
        response.await.map_err(|_| EngineError::Stopped)
    }
}

/// Merge a local snapshot with the remote set fetched at startup
///
/// Unconfirmed local tasks come first and win; the remote rows fill the
/// rest in the order they were fetched.
pub fn merge_startup(local: &[Task], remote: Vec<TaskRow>) -> Vec<Task> {
    let kept: Vec<Task> = local
        .iter()
        .filter(|t| t.sync.is_unconfirmed())
        .cloned()
        .collect();
    let kept_ids: HashSet<&TaskId> = kept.iter().map(|t| &t.id).collect();

    let fetched: Vec<Task> = remote
        .into_iter()
        .filter(|row| !kept_ids.contains(&row.id))
        .map(TaskRow::into_task)
        .collect();

    kept.into_iter().chain(fetched).collect()
}

fn rearm_failed(store: &mut RecordStore) {
    let failed: Vec<Task> = store
        .tasks()
        .iter()
        .filter(|t| t.sync.is_failed())
        .cloned()
        .collect();
    for mut task in failed {
        task.sync = task.sync.rearmed();
        debug!("Re-arming failed task {}", task.id);
        store.apply(Mutation::Replace {
            id: task.id.clone(),
            task,
        });
    }
}

struct EngineTask {
    store: RecordStore,
    dispatcher: Dispatcher,
    remote: Arc<dyn RemoteAdapter>,
    connectivity: Connectivity,
    feed: Option<Subscription>,
    work: JoinSet<Internal>,
    /// Bulk deletes awaiting a response
    clearing: usize,
    /// A subscribe call is outstanding
    subscribing: bool,
    resubscribe_armed: bool,
    resubscribe_delay: Duration,
    status_tx: watch::Sender<EngineStatus>,
}

impl EngineTask {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut connection = self.connectivity.subscribe();
        let mut was_online = *connection.borrow_and_update() == ConnectionStatus::Online;
        info!(
            "Sync engine started ({} task(s), remote: {})",
            self.store.len(),
            self.remote.name()
        );

        self.replay_pending();
        if self.feed.is_none() && self.connectivity.is_online() {
            self.resubscribe_later();
        }
        self.publish_status();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.stop();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some(joined) = self.work.join_next(), if !self.work.is_empty() => match joined {
                    Ok(internal) => self.handle_internal(internal),
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => warn!("Engine work failed: {}", e),
                },
                event = next_event(&mut self.feed) => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!("Change feed closed");
                        self.feed = None;
                        self.resubscribe_later();
                    }
                },
                Ok(()) = connection.changed() => {
                    let online = *connection.borrow_and_update() == ConnectionStatus::Online;
                    if online && !was_online {
                        self.on_reconnect();
                    }
                    was_online = online;
                }
            }
            self.publish_status();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Add(new, reply) => {
                let task = Task::from_new(new);
                let id = task.id.clone();
                self.store.apply(Mutation::Prepend(task.clone()));
                self.dispatcher.touch(&id);
                debug!("Added task {}", id);
                self.dispatch(&id);
                self.respond(reply, Ok(task));
            }
            Command::Toggle(id, reply) => {
                let Some(mut task) = self.store.get(&id).cloned() else {
                    self.respond(reply, Err(EngineError::NotFound(id)));
                    return;
                };
                task.done = !task.done;
                task.sync = task.sync.after_local_edit();
                self.store.apply(Mutation::Replace {
                    id: id.clone(),
                    task: task.clone(),
                });
                self.dispatcher.touch(&id);
                self.dispatch(&id);
                self.respond(reply, Ok(task));
            }
            Command::ClearCompleted(reply) => {
                let ids = self.store.done_ids();
                if ids.is_empty() {
                    self.respond(reply, Ok(0));
                    return;
                }
                if !self.connectivity.is_online() {
                    self.respond(reply, Err(EngineError::Offline));
                    return;
                }

                info!("Deleting {} completed task(s)", ids.len());
                let remote = self.remote.clone();
                self.clearing += 1;
                self.work.spawn(async move {
                    let result = remote.delete(&ids).await;
                    Internal::Cleared { ids, result, reply }
                });
            }
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Delivered { id, ticket, result } => {
                match self.dispatcher.complete(&mut self.store, &id, ticket, result) {
                    Completion::Superseded(current) => self.dispatch(&current),
                    Completion::Retry(key) => self.schedule_retry(key),
                    Completion::Confirmed(_) | Completion::Exhausted(_) | Completion::Ignored => {}
                }
            }
            Internal::RetryDue(key) => {
                if self.dispatcher.retry_due(&self.store, &key) {
                    self.dispatch(&key.id);
                }
            }
            Internal::Cleared { ids, result, reply } => {
                self.clearing -= 1;
                match result {
                    Ok(()) => {
                        // The feed may already have delivered some of these deletes
                        self.store.apply(Mutation::Remove(ids.clone()));
                        self.dispatcher.forget(&ids);
                        info!("Cleared {} completed task(s)", ids.len());
                        self.respond(reply, Ok(ids.len()));
                    }
                    Err(e) => {
                        warn!("Bulk delete failed: {}", e);
                        self.respond(reply, Err(e.into()));
                    }
                }
            }
            Internal::Subscribed(Ok(subscription)) => {
                debug!("Change feed subscribed");
                self.subscribing = false;
                self.feed = Some(subscription);
            }
            Internal::Subscribed(Err(e)) => {
                warn!("Change feed unavailable: {}", e);
                self.subscribing = false;
                self.resubscribe_later();
            }
            Internal::ResubscribeDue => {
                self.resubscribe_armed = false;
                self.ensure_feed();
            }
        }
    }

    fn handle_event(&mut self, event: ChangeEvent) {
        match reconcile(&mut self.store, event) {
            Reconciled::Deleted(id) => self.dispatcher.forget(&[id]),
            Reconciled::Suppressed(id) => debug!("Kept local state for {}", id),
            _ => {}
        }
    }

    fn on_reconnect(&mut self) {
        let pending = self.store.pending_ids();
        info!("Back online, replaying {} pending task(s)", pending.len());
        for id in &pending {
            self.dispatch(id);
        }

        self.ensure_feed();
    }

    /// Subscribe unless a feed is open, a subscribe is outstanding, or offline
    fn ensure_feed(&mut self) {
        if self.feed.is_some() || self.subscribing || !self.connectivity.is_online() {
            return;
        }
        self.subscribing = true;
        let remote = self.remote.clone();
        self.work
            .spawn(async move { Internal::Subscribed(remote.subscribe().await) });
    }

    fn resubscribe_later(&mut self) {
        if self.resubscribe_armed {
            return;
        }
        self.resubscribe_armed = true;
        let delay = self.resubscribe_delay;
        debug!("Resubscribing to change feed in {:?}", delay);
        self.work.spawn(async move {
            tokio::time::sleep(delay).await;
            Internal::ResubscribeDue
        });
    }

    fn replay_pending(&mut self) {
        for id in self.store.pending_ids() {
            self.dispatch(&id);
        }
    }

    fn dispatch(&mut self, id: &TaskId) {
        let online = self.connectivity.is_online();
        let Some((request, ticket)) = self.dispatcher.prepare(&self.store, id, online) else {
            return;
        };
        let remote = self.remote.clone();
        let id = id.clone();
        self.work.spawn(async move {
            let result = request.send(remote.as_ref()).await;
            Internal::Delivered { id, ticket, result }
        });
    }

    fn schedule_retry(&mut self, key: RetryKey) {
        let delay = self.dispatcher.policy().delay;
        debug!("Retrying {} in {:?}", key.id, delay);
        self.work.spawn(async move {
            tokio::time::sleep(delay).await;
            Internal::RetryDue(key)
        });
    }

    fn stop(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.unsubscribe();
        }
        self.work.abort_all();
        if let Err(e) = self.store.persist() {
            warn!("Failed to persist snapshot on shutdown: {}", e);
        }
        let summary = self.store.summary();
        info!(
            "Sync engine stopped ({} unsynced, {} failed)",
            summary.unsynced, summary.failed
        );
    }

    /// Publish status before replying so callers observe the new state
    fn respond<T>(&self, reply: oneshot::Sender<T>, value: T) {
        self.publish_status();
        let _ = reply.send(value);
    }

    fn publish_status(&self) {
        let summary = self.store.summary();
        let status = EngineStatus {
            online: self.connectivity.is_online(),
            in_flight: self.dispatcher.in_flight() + self.clearing,
            scheduled_retries: self.dispatcher.scheduled_retries(),
            unsynced: summary.unsynced,
            failed: summary.failed,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

async fn next_event(feed: &mut Option<Subscription>) -> Option<ChangeEvent> {
    match feed {
        Some(subscription) => subscription.next_event().await,
        None => std::future::pending().await,
    }
}
