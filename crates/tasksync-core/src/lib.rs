//! tasksync core library
//!
//! Local-first task list that stays usable offline and converges with a
//! remote authoritative store when connectivity returns.
//!
//! # Architecture
//!
//! - **Record store**: the owned task list every front-end renders from,
//!   persisted as a snapshot after each committed mutation
//! - **Sync engine**: applies intents optimistically, delivers them to the
//!   remote with bounded retries, and reconciles the remote change feed
//!   without clobbering unconfirmed local edits
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let store = RecordStore::open(storage::open_persistence(&config)?)?;
//! let engine = SyncEngine::start(
//!     EngineSettings::from_config(&config),
//!     store,
//!     remote::from_config(&config),
//!     Connectivity::online(),
//! ).await?;
//!
//! engine.add_task(NewTask::new("Buy milk").with_tag_input("home")).await?;
//! ```
//!
//! # Modules
//!
//! - `models`: task record, sync state machine, wire shapes
//! - `store`: record store, mutations and derived views
//! - `storage`: snapshot codec and persistence adapters
//! - `remote`: remote store adapters and the change feed
//! - `connectivity`: online/offline monitor
//! - `sync`: dispatcher, reconciler and the engine task
//! - `config`: application configuration

pub mod config;
pub mod connectivity;
pub mod error;
pub mod models;
pub mod remote;
pub mod storage;
pub mod store;
pub mod sync;

pub use config::{Config, StorageBackend};
pub use connectivity::{spawn_probe, ConnectionStatus, Connectivity, ProbeSettings};
pub use error::{EngineError, EngineResult};
pub use models::{parse_tags, NewTask, SyncAction, SyncState, Task, TaskId};
pub use remote::{RemoteAdapter, RemoteError};
pub use storage::{StorageError, StorageResult};
pub use store::{RecordStore, Summary};
pub use sync::{EngineSettings, EngineStatus, RetryPolicy, SyncEngine};
