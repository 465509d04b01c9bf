//! Sync engine
//!
//! Keeps the local record store usable offline and converges it with the
//! remote store when connectivity allows.
//!
//! ## Flow
//!
//! 1. An intent is applied to the store optimistically (task becomes pending)
//! 2. The dispatcher sends the matching remote call, one per task at a time
//! 3. Success replaces the task with the canonical record; failure is retried
//!    after a fixed delay until the attempt budget runs out
//! 4. Independently, change-feed events are reconciled into the store unless
//!    the affected task still has unconfirmed local state
//!
//! Going from offline to online replays every pending task.

mod dispatcher;
mod engine;
mod reconciler;

pub use dispatcher::{Completion, Dispatcher, Request, RetryKey, RetryPolicy, Ticket};
pub use engine::{merge_startup, EngineSettings, EngineStatus, SyncEngine};
pub use reconciler::{is_suppressed, reconcile, Reconciled};
