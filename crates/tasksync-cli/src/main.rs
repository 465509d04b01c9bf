//! tasksync CLI
//!
//! Command-line interface for tasksync - offline-first tasks kept in sync
//! with a remote store.

use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tasksync_core::{Config, StorageError};

mod commands;
mod output;
mod session;

use output::{Output, OutputFormat};
use session::Session;

/// How long intent commands wait for deliveries before exiting
const SETTLE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "tasksync")]
#[command(about = "tasksync - Offline-first tasks synced with a remote store")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Write debug logs to the log file
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a new task
    Add {
        /// Task text
        text: String,
        /// Longer description
        #[arg(short, long)]
        description: Option<String>,
        /// Tags, comma separated ("work, #urgent")
        #[arg(short, long)]
        tags: Option<String>,
        /// Due date (YYYY-MM-DD)
        #[arg(long, value_parser = commands::task::parse_due)]
        due: Option<NaiveDate>,
    },
    /// Toggle a task between open and done
    Toggle {
        /// Task ID (full or prefix)
        id: String,
    },
    /// Delete all completed tasks
    Clear,
    /// List tasks, newest first
    #[command(alias = "ls")]
    List {
        /// Filter by tag
        #[arg(short, long)]
        tag: Option<String>,
        /// Filter by text or description
        #[arg(short = 'Q', long)]
        query: Option<String>,
    },
    /// List all tags
    Tags,
    /// Show sync status and counts
    Status,
    /// Deliver pending changes and wait for them to settle
    Sync {
        /// Seconds to wait for deliveries
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Print the task list whenever it changes
    Watch,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, remote_url, sync_enabled, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_deref();

    // Config commands don't need the store
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(config_path, &output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, config_path, &output)
            }
        };
    }

    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    init_logging(&config, cli.verbose);

    let session = match Session::open(config, &output).await {
        Ok(session) => session,
        Err(e) => {
            if let Some(hint) = e
                .downcast_ref::<StorageError>()
                .and_then(StorageError::recovery_suggestion)
            {
                output.warn(&hint);
            }
            return Err(e);
        }
    };

    let is_write = matches!(
        cli.command,
        Commands::Add { .. } | Commands::Toggle { .. } | Commands::Clear
    );

    let result = match cli.command {
        Commands::Add {
            text,
            description,
            tags,
            due,
        } => commands::task::add(&session, text, description, tags, due, &output).await,
        Commands::Toggle { id } => commands::task::toggle(&session, &id, &output).await,
        Commands::Clear => commands::task::clear(&session, &output).await,
        Commands::List { tag, query } => {
            commands::task::list(&session, tag.as_deref(), query.as_deref(), &output);
            Ok(())
        }
        Commands::Tags => {
            output.print_tags(&session.engine().tags());
            Ok(())
        }
        Commands::Status => commands::status::show(&session, &output),
        Commands::Sync { timeout } => {
            commands::sync::sync(&session, Duration::from_secs(timeout), &output).await
        }
        Commands::Watch => commands::task::watch(&session, &output).await,
        Commands::Config { .. } => unreachable!(), // Handled above
    };

    // Let writes reach the remote before exiting
    if is_write && result.is_ok() {
        let idle = session.settle(SETTLE_TIMEOUT).await;
        if !idle || session.engine().summary().unsynced > 0 {
            output.warn("Some changes are not synced yet; they will be sent next time.");
        }
    }
    session.close().await?;

    result
}

/// Initialize file logging
///
/// Only initializes if TASKSYNC_LOG is set or --verbose was given.
/// Logs to config.log_file or {data_dir}/tasksync.log.
fn init_logging(config: &Config, verbose: bool) {
    let log_level = match std::env::var("TASKSYNC_LOG") {
        Ok(level) => level,
        Err(_) if verbose => "debug".to_string(),
        Err(_) => return,
    };

    let log_path = config.log_path();
    let log_file = match File::options().create(true).append(true).open(&log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
            return;
        }
    };

    let env_filter = EnvFilter::new(format!(
        "tasksync_core={},tasksync={}",
        log_level, log_level
    ));

    // Ignore error if already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(log_file)
        .try_init();

    info!("Logging initialized to {:?}", log_path);
}
