//! Status command handler

use anyhow::Result;

use crate::output::{Output, OutputFormat};
use crate::session::Session;

/// Show sync status and task counts
pub fn show(session: &Session, output: &Output) -> Result<()> {
    let config = session.config();
    let summary = session.engine().summary();
    let status = session.engine().status();
    let connection = session.connectivity().status();

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "connection": connection,
                    "sync_enabled": config.sync_enabled,
                    "remote_url": config.remote_url,
                    "storage": config.storage,
                    "data_dir": config.data_dir,
                    "counts": summary,
                    "engine": status
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", connection);
        }
        OutputFormat::Human => {
            println!("tasksync Status");
            println!("===============");
            println!();
            println!("Sync:");
            println!(
                "  Status:     {}",
                if config.sync_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            if let Some(ref url) = config.remote_url {
                println!("  Remote:     {}", url);
            }
            println!("  Connection: {}", connection);
            println!();
            println!("Storage:");
            println!("  Backend:  {:?}", config.storage);
            println!("  Location: {}", config.data_dir.display());
            println!();
            println!("Tasks:");
            println!("  Open:      {}", summary.open);
            println!("  Completed: {}", summary.completed);
            println!("  Unsynced:  {}", summary.unsynced);
            if summary.failed > 0 {
                println!("  Failed:    {}", summary.failed);
            }
        }
    }

    Ok(())
}
