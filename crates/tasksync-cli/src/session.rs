//! Engine session for one CLI invocation
//!
//! Opens the local snapshot, decides initial connectivity, starts the sync
//! engine and, when a remote is configured, a connectivity probe. Closing
//! the session stops both; anything undelivered stays pending on disk.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use tasksync_core::remote::{self, RemoteAdapter};
use tasksync_core::{
    spawn_probe, storage, Config, Connectivity, EngineSettings, ProbeSettings, RecordStore,
    StorageError, SyncEngine,
};

use crate::output::Output;

/// Upper bound on the initial reachability check
const PING_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Session {
    config: Config,
    engine: SyncEngine,
    connectivity: Connectivity,
    probe: Option<JoinHandle<()>>,
}

impl Session {
    pub async fn open(config: Config, output: &Output) -> Result<Self> {
        let persistence =
            storage::open_persistence(&config).context("Failed to open local storage")?;
        let store = RecordStore::open(persistence).context("Failed to load tasks")?;
        if let Some(discarded) = store.discarded_snapshot() {
            output.warn(&storage_warning(discarded));
        }
        let remote = remote::from_config(&config);

        let connectivity = if config.is_sync_configured() {
            initial_connectivity(remote.as_ref()).await
        } else {
            debug!("Sync not configured, running offline");
            Connectivity::offline()
        };

        let probe = config.is_sync_configured().then(|| {
            spawn_probe(
                connectivity.clone(),
                remote.clone(),
                ProbeSettings {
                    interval: config.probe_interval(),
                    ..ProbeSettings::default()
                },
            )
        });

        let engine = SyncEngine::start(
            EngineSettings::from_config(&config),
            store,
            remote,
            connectivity.clone(),
        )
        .await
        .context("Failed to start sync engine")?;

        Ok(Self {
            config,
            engine,
            connectivity,
            probe,
        })
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Wait for in-flight deliveries and armed retries
    ///
    /// Returns `false` if work was still outstanding after `timeout`.
    pub async fn settle(&self, timeout: Duration) -> bool {
        // Give the engine a turn to pick up anything just queued
        tokio::task::yield_now().await;
        self.engine.wait_idle(timeout).await
    }

    pub async fn close(self) -> Result<()> {
        if let Some(probe) = self.probe {
            probe.abort();
        }
        self.engine
            .shutdown()
            .await
            .context("Sync engine did not stop cleanly")?;
        info!("Session closed");
        Ok(())
    }
}

async fn initial_connectivity(remote: &dyn RemoteAdapter) -> Connectivity {
    match tokio::time::timeout(PING_TIMEOUT, remote.ping()).await {
        Ok(Ok(())) => Connectivity::online(),
        Ok(Err(e)) => {
            info!("Remote {} unreachable, starting offline: {}", remote.name(), e);
            Connectivity::offline()
        }
        Err(_) => {
            info!("Remote {} timed out, starting offline", remote.name());
            Connectivity::offline()
        }
    }
}


/// Storage error text plus what to do about it
pub fn storage_warning(err: &StorageError) -> String {
    match err.recovery_suggestion() {
        Some(hint) => format!("{}\n  {}", err, hint),
        None => err.to_string(),
    }
}
