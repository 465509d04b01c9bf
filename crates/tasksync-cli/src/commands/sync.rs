//! Sync command handler

use std::time::Duration;

use anyhow::{bail, Result};

use crate::output::Output;
use crate::session::Session;

/// Deliver pending changes and wait until they settle
///
/// Failed tasks from earlier sessions were re-armed when the session
/// started, so this is also the way to retry them.
pub async fn sync(session: &Session, timeout: Duration, output: &Output) -> Result<()> {
    let config = session.config();

    if !config.is_sync_configured() {
        bail!(
            "Sync is not configured. Enable it with:\n  \
             tasksync config set remote_url https://your-project.example/rest/v1\n  \
             tasksync config set sync_enabled true"
        );
    }

    if !session.connectivity().is_online() {
        bail!("Remote store is unreachable. Pending changes were kept locally.");
    }

    let before = session.engine().summary().unsynced;
    output.message(&format!("Syncing {} pending change(s)...", before));

    let idle = session.settle(timeout).await;
    let summary = session.engine().summary();

    if !idle {
        output.warn(&format!(
            "Timed out after {}s with {} change(s) still pending",
            timeout.as_secs(),
            summary.unsynced
        ));
    } else if summary.failed > 0 {
        bail!(
            "{} task(s) could not be delivered; they will be retried next session",
            summary.failed
        );
    } else if summary.unsynced > 0 {
        output.warn(&format!("{} change(s) still pending", summary.unsynced));
    } else {
        output.success(&format!("Sync complete - {} task(s)", session.engine().tasks().len()));
    }

    Ok(())
}
