//! End-to-end tests for the sync engine against the in-process remote
//!
//! Time is paused: retry timers and remote latency advance only when every
//! task is idle, so the timelines below are deterministic.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tasksync_core::models::TaskRow;
use tasksync_core::remote::{ChangeEvent, MemoryRemote};
use tasksync_core::storage::MemoryPersistence;
use tasksync_core::{
    ConnectionStatus, Connectivity, EngineError, EngineSettings, NewTask, RecordStore, SyncAction,
    SyncEngine, SyncState, Task, TaskId,
};

const SETTLE: Duration = Duration::from_secs(120);

async fn start(
    remote: &MemoryRemote,
    connectivity: &Connectivity,
    persistence: &MemoryPersistence,
) -> SyncEngine {
    let store = RecordStore::open(Box::new(persistence.clone())).unwrap();
    SyncEngine::start(
        EngineSettings::default(),
        store,
        Arc::new(remote.clone()),
        connectivity.clone(),
    )
    .await
    .unwrap()
}

/// Let the engine task drain whatever is queued, then wait for deliveries
async fn settle(engine: &SyncEngine) {
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(engine.wait_idle(SETTLE).await, "engine did not settle");
}

fn remote_row(id: &str, text: &str, secs: i64) -> TaskRow {
    TaskRow {
        id: id.into(),
        text: text.to_string(),
        description: None,
        done: false,
        tags: Vec::new(),
        due_date: None,
        created_at: Some(Utc.timestamp_opt(secs, 0).unwrap()),
    }
}

fn only(engine: &SyncEngine) -> Task {
    let tasks = engine.tasks();
    assert_eq!(tasks.len(), 1, "expected exactly one task: {:?}", tasks);
    tasks[0].clone()
}

fn assert_ids_unique(engine: &SyncEngine) {
    let tasks = engine.tasks();
    let mut ids: Vec<&TaskId> = tasks.iter().map(|t| &t.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), tasks.len(), "duplicate ids in {:?}", tasks);
}

#[tokio::test(start_paused = true)]
async fn optimistic_add_is_confirmed() {
    let remote = MemoryRemote::new();
    remote.set_latency(Some(Duration::from_millis(200)));
    let engine = start(&remote, &Connectivity::online(), &MemoryPersistence::new()).await;

    let task = engine.add_task(NewTask::new("Buy milk")).await.unwrap();
    assert_eq!(task.sync, SyncState::new_insert());

    let local = only(&engine);
    assert!(local.sync.is_pending());
    assert!(local.created_at.is_none());

    settle(&engine).await;

    let confirmed = only(&engine);
    assert_eq!(confirmed.id, task.id);
    assert_eq!(confirmed.sync, SyncState::Confirmed);
    assert!(confirmed.created_at.is_some());
    assert_eq!(remote.calls().create, 1);
    assert_eq!(remote.rows().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn blank_text_is_rejected() {
    let remote = MemoryRemote::new();
    let engine = start(&remote, &Connectivity::online(), &MemoryPersistence::new()).await;

    let result = engine.add_task(NewTask::new("   ")).await;
    assert!(matches!(result, Err(EngineError::EmptyText)));

    settle(&engine).await;
    assert!(engine.tasks().is_empty());
    assert_eq!(remote.calls().writes(), 0);
}

#[tokio::test(start_paused = true)]
async fn retries_stop_after_three_attempts() {
    let remote = MemoryRemote::new();
    remote.fail_next(100);
    let engine = start(&remote, &Connectivity::online(), &MemoryPersistence::new()).await;

    engine.add_task(NewTask::new("Buy milk")).await.unwrap();
    settle(&engine).await;

    let task = only(&engine);
    assert_eq!(
        task.sync,
        SyncState::Failed {
            action: SyncAction::Insert,
            attempts: 3
        }
    );
    assert_eq!(remote.calls().create, 3);

    // No fourth attempt without a new intent or reconnect
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(remote.calls().create, 3);
    assert_eq!(engine.summary().failed, 1);
}

#[tokio::test(start_paused = true)]
async fn retry_succeeds_after_transient_failure() {
    let remote = MemoryRemote::new();
    remote.fail_next(1);
    let engine = start(&remote, &Connectivity::online(), &MemoryPersistence::new()).await;

    let started = tokio::time::Instant::now();
    engine.add_task(NewTask::new("Buy milk")).await.unwrap();
    settle(&engine).await;

    assert_eq!(only(&engine).sync, SyncState::Confirmed);
    assert_eq!(remote.calls().create, 2);
    assert!(started.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn new_intent_rearms_failed_task() {
    let remote = MemoryRemote::new();
    remote.fail_next(3);
    let engine = start(&remote, &Connectivity::online(), &MemoryPersistence::new()).await;

    let task = engine.add_task(NewTask::new("Buy milk")).await.unwrap();
    settle(&engine).await;
    assert!(only(&engine).sync.is_failed());

    let toggled = engine.toggle_done(&task.id).await.unwrap();
    assert!(toggled.done);
    assert_eq!(toggled.sync, SyncState::new_insert());
    settle(&engine).await;

    let confirmed = only(&engine);
    assert_eq!(confirmed.sync, SyncState::Confirmed);
    assert!(remote.get(&task.id).unwrap().done);
    assert_eq!(remote.calls().create, 4);
}

#[tokio::test(start_paused = true)]
async fn offline_dispatch_waits_for_reconnect() {
    let remote = MemoryRemote::new();
    let connectivity = Connectivity::offline();
    let engine = start(&remote, &connectivity, &MemoryPersistence::new()).await;

    let task = engine.add_task(NewTask::new("Buy milk")).await.unwrap();
    settle(&engine).await;

    // Skipped while offline, and not counted as an attempt
    assert_eq!(remote.calls().writes(), 0);
    assert_eq!(only(&engine).sync.attempts(), 0);

    connectivity.set_status(ConnectionStatus::Online);
    settle(&engine).await;

    assert_eq!(only(&engine).sync, SyncState::Confirmed);
    assert!(remote.get(&task.id).is_some());
    assert_eq!(remote.calls().create, 1);
    // Feed subscribed on reconnect
    assert_eq!(remote.subscriber_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_short_circuits_retry_delay() {
    let remote = MemoryRemote::new();
    remote.fail_next(1);
    let connectivity = Connectivity::online();
    let engine = start(&remote, &connectivity, &MemoryPersistence::new()).await;

    engine.add_task(NewTask::new("Buy milk")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(engine.status().scheduled_retries, 1);

    let started = tokio::time::Instant::now();
    connectivity.set_status(ConnectionStatus::Offline);
    tokio::time::sleep(Duration::from_millis(10)).await;
    connectivity.set_status(ConnectionStatus::Online);
    settle(&engine).await;

    assert_eq!(only(&engine).sync, SyncState::Confirmed);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(remote.calls().create, 2);
}

#[tokio::test(start_paused = true)]
async fn feed_events_for_pending_tasks_are_suppressed() {
    let remote = MemoryRemote::with_rows(vec![remote_row("x", "Original", 10)]);
    let connectivity = Connectivity::online();
    let engine = start(&remote, &connectivity, &MemoryPersistence::new()).await;
    assert_eq!(only(&engine).sync, SyncState::Confirmed);

    connectivity.set_status(ConnectionStatus::Offline);
    engine.toggle_done(&TaskId::from("x")).await.unwrap();

    let mut stale = remote_row("x", "Renamed elsewhere", 10);
    stale.tags = vec!["other".to_string()];
    remote.external_update(stale);
    settle(&engine).await;

    let local = only(&engine);
    assert_eq!(local.text, "Original");
    assert!(local.done);
    assert!(local.tags.is_empty());
    assert_eq!(
        local.sync,
        SyncState::Pending {
            action: SyncAction::Update,
            attempts: 0
        }
    );
}

#[tokio::test(start_paused = true)]
async fn feed_events_apply_to_confirmed_tasks() {
    let remote = MemoryRemote::with_rows(vec![
        remote_row("y", "Y", 20),
        remote_row("z", "Z", 10),
    ]);
    let engine = start(&remote, &Connectivity::online(), &MemoryPersistence::new()).await;
    assert_eq!(engine.tasks().len(), 2);

    remote.external_delete(&TaskId::from("y"));
    remote.external_update(remote_row("z", "Z renamed", 10));
    remote.external_insert(remote_row("w", "From another client", 30));
    remote.emit(serde_json::from_str::<ChangeEvent>(r#"{"eventType":"TRUNCATE"}"#).unwrap());
    settle(&engine).await;

    let tasks = engine.tasks();
    let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["w", "z"]);
    assert_eq!(tasks[1].text, "Z renamed");
    assert!(tasks.iter().all(|t| t.sync == SyncState::Confirmed));
}

#[tokio::test(start_paused = true)]
async fn toggle_during_inflight_create_is_delivered() {
    let remote = MemoryRemote::new();
    remote.set_latency(Some(Duration::from_millis(500)));
    let engine = start(&remote, &Connectivity::online(), &MemoryPersistence::new()).await;

    let task = engine.add_task(NewTask::new("Buy milk")).await.unwrap();
    let toggled = engine.toggle_done(&task.id).await.unwrap();
    // Still an insert: the remote does not have it yet
    assert_eq!(toggled.sync, SyncState::new_insert());
    assert_eq!(engine.status().in_flight, 1);

    settle(&engine).await;

    let confirmed = only(&engine);
    assert!(confirmed.done);
    assert_eq!(confirmed.sync, SyncState::Confirmed);
    assert!(remote.get(&task.id).unwrap().done);
    assert_eq!(remote.calls().create, 1);
    assert_eq!(remote.calls().update, 1);
}

#[tokio::test(start_paused = true)]
async fn canonical_ids_replace_client_ids() {
    let remote = MemoryRemote::new();
    remote.assign_canonical_ids("srv");
    let engine = start(&remote, &Connectivity::online(), &MemoryPersistence::new()).await;

    let task = engine.add_task(NewTask::new("Buy milk")).await.unwrap();
    settle(&engine).await;

    assert_ids_unique(&engine);
    let confirmed = only(&engine);
    assert_eq!(confirmed.id.as_str(), "srv-1");
    assert!(engine.get(&task.id).is_none());

    // Later intents address the canonical id
    engine.toggle_done(&confirmed.id).await.unwrap();
    settle(&engine).await;
    assert!(remote.get(&confirmed.id).unwrap().done);
}

#[tokio::test(start_paused = true)]
async fn toggle_unknown_id_is_not_found() {
    let remote = MemoryRemote::new();
    let engine = start(&remote, &Connectivity::online(), &MemoryPersistence::new()).await;

    let result = engine.toggle_done(&TaskId::from("missing")).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn clear_completed_without_done_tasks_is_noop() {
    let remote = MemoryRemote::with_rows(vec![remote_row("a", "A", 10)]);
    let engine = start(&remote, &Connectivity::online(), &MemoryPersistence::new()).await;

    assert_eq!(engine.clear_completed().await.unwrap(), 0);
    assert_eq!(remote.calls().delete, 0);
    assert_eq!(engine.tasks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn clear_completed_applies_after_remote_success() {
    let mut done = remote_row("a", "Done", 20);
    done.done = true;
    let remote = MemoryRemote::with_rows(vec![done, remote_row("b", "Open", 10)]);
    let engine = start(&remote, &Connectivity::online(), &MemoryPersistence::new()).await;

    remote.fail_next(1);
    let result = engine.clear_completed().await;
    assert!(matches!(result, Err(EngineError::Remote(_))));
    assert_eq!(engine.tasks().len(), 2);

    assert_eq!(engine.clear_completed().await.unwrap(), 1);
    settle(&engine).await;

    let ids: Vec<String> = engine.tasks().iter().map(|t| t.id.to_string()).collect();
    assert_eq!(ids, vec!["b"]);
    assert_eq!(remote.rows().len(), 1);
    assert_eq!(remote.calls().delete, 2);
}

#[tokio::test(start_paused = true)]
async fn clear_completed_requires_connectivity() {
    let mut done = remote_row("a", "Done", 20);
    done.done = true;
    let remote = MemoryRemote::with_rows(vec![done]);
    let connectivity = Connectivity::online();
    let engine = start(&remote, &connectivity, &MemoryPersistence::new()).await;

    connectivity.set_status(ConnectionStatus::Offline);
    let result = engine.clear_completed().await;
    assert!(matches!(result, Err(EngineError::Offline)));
    assert_eq!(engine.tasks().len(), 1);
    assert_eq!(remote.calls().delete, 0);
}

#[tokio::test(start_paused = true)]
async fn startup_merge_keeps_offline_edits() {
    let persistence = MemoryPersistence::new();
    let remote = MemoryRemote::with_rows(vec![remote_row("r1", "Remote task", 10)]);

    // First session, entirely offline
    let offline = start(&remote, &Connectivity::offline(), &persistence).await;
    let edited = offline.add_task(NewTask::new("Offline edit")).await.unwrap();
    offline.shutdown().await.unwrap();

    // Second session comes up online
    let engine = start(&remote, &Connectivity::online(), &persistence).await;
    let tasks = engine.tasks();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].id, edited.id);
    assert!(tasks[0].sync.is_pending());
    assert_eq!(tasks[1].id.as_str(), "r1");

    settle(&engine).await;
    assert!(engine.tasks().iter().all(|t| t.sync == SyncState::Confirmed));
    assert_eq!(remote.rows().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_tasks_are_rearmed_next_session() {
    let persistence = MemoryPersistence::new();
    let remote = MemoryRemote::new();
    remote.fail_next(3);

    let first = start(&remote, &Connectivity::online(), &persistence).await;
    first.add_task(NewTask::new("Buy milk")).await.unwrap();
    settle(&first).await;
    assert!(only(&first).sync.is_failed());
    first.shutdown().await.unwrap();

    let second = start(&remote, &Connectivity::online(), &persistence).await;
    settle(&second).await;
    assert_eq!(only(&second).sync, SyncState::Confirmed);
    assert_eq!(remote.calls().create, 4);
}

#[tokio::test(start_paused = true)]
async fn subscribers_see_committed_states() {
    let remote = MemoryRemote::new();
    let engine = start(&remote, &Connectivity::offline(), &MemoryPersistence::new()).await;
    let mut rx = engine.subscribe();

    engine
        .add_task(NewTask::new("Write report").with_tag_input("Work, #Urgent"))
        .await
        .unwrap();
    rx.changed().await.unwrap();
    assert_eq!(rx.borrow_and_update().len(), 1);

    assert_eq!(engine.tags(), vec!["urgent", "work"]);
    assert_eq!(engine.filtered(Some("work"), "REPORT").len(), 1);
    assert!(engine.filtered(Some("home"), "").is_empty());
    assert_eq!(engine.summary().unsynced, 1);
}

#[tokio::test(start_paused = true)]
async fn wait_idle_times_out_while_retry_is_armed() {
    let remote = MemoryRemote::new();
    remote.fail_next(100);
    let engine = start(&remote, &Connectivity::online(), &MemoryPersistence::new()).await;

    engine.add_task(NewTask::new("Buy milk")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // First attempt failed; the next one is 5s away
    assert!(!engine.wait_idle(Duration::from_secs(1)).await);
    assert_eq!(engine.status().scheduled_retries, 1);

    assert!(engine.wait_idle(SETTLE).await);
    assert_eq!(remote.calls().create, 3);
}

#[tokio::test(start_paused = true)]
async fn feed_is_restored_after_failed_subscribe() {
    let remote = MemoryRemote::new();
    remote.fail_next_subscribe(2);
    let engine = start(&remote, &Connectivity::online(), &MemoryPersistence::new()).await;
    assert_eq!(remote.subscriber_count(), 0);

    // Startup attempt and the first retry both fail
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(remote.subscriber_count(), 0);
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(remote.subscriber_count(), 1);

    remote.external_insert(remote_row("w", "From another client", 30));
    settle(&engine).await;
    assert_eq!(only(&engine).id, TaskId::from("w"));
}

#[tokio::test(start_paused = true)]
async fn closed_feed_is_resubscribed() {
    let remote = MemoryRemote::new();
    let engine = start(&remote, &Connectivity::online(), &MemoryPersistence::new()).await;
    assert_eq!(remote.subscriber_count(), 1);

    remote.close_feeds();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(remote.subscriber_count(), 0);

    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(remote.subscriber_count(), 1);

    remote.external_insert(remote_row("w", "From another client", 30));
    settle(&engine).await;
    assert_eq!(engine.tasks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn offline_engine_does_not_resubscribe() {
    let remote = MemoryRemote::new();
    let connectivity = Connectivity::online();
    let engine = start(&remote, &connectivity, &MemoryPersistence::new()).await;

    connectivity.set_status(ConnectionStatus::Offline);
    remote.close_feeds();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(remote.subscriber_count(), 0);

    connectivity.set_status(ConnectionStatus::Online);
    settle(&engine).await;
    assert_eq!(remote.subscriber_count(), 1);
}
