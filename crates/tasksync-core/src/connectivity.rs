//! Connectivity monitor
//!
//! A [`Connectivity`] handle holds the current [`ConnectionStatus`] in a
//! `watch` channel. The dispatcher reads it synchronously through
//! [`Connectivity::is_online`]; the engine subscribes to it to replay
//! pending records on an offline to online transition.
//!
//! Status is set either directly (tests, embedding front-ends) or by the
//! background probe started with [`spawn_probe`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::remote::RemoteAdapter;

/// Whether the remote store is reachable
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Online,
    Offline,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Online => write!(f, "online"),
            ConnectionStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Shared connectivity state
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<ConnectionStatus>>,
}

impl Connectivity {
    pub fn new(initial: ConnectionStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn online() -> Self {
        Self::new(ConnectionStatus::Online)
    }

    pub fn offline() -> Self {
        Self::new(ConnectionStatus::Offline)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.status() == ConnectionStatus::Online
    }

    /// Publish a status; subscribers only see actual transitions
    ///
    /// Returns whether the status changed.
    pub fn set_status(&self, status: ConnectionStatus) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                info!("Connectivity changed: {} -> {}", current, status);
                *current = status;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }
}

/// Timing for the background reachability probe
#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    /// Delay between probes while online, and the backoff ceiling while offline
    pub interval: Duration,
    /// First re-probe delay after going offline
    pub initial_backoff: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            initial_backoff: Duration::from_secs(1),
        }
    }
}

/// Spawn a task that keeps `connectivity` in line with remote reachability
///
/// Pings the remote immediately, then every `interval` while online. While
/// offline the delay starts at `initial_backoff` and doubles up to
/// `interval`. Abort the returned handle to stop probing.
pub fn spawn_probe(
    connectivity: Connectivity,
    remote: Arc<dyn RemoteAdapter>,
    settings: ProbeSettings,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = settings.initial_backoff;
        loop {
            let delay = match remote.ping().await {
                Ok(()) => {
                    connectivity.set_status(ConnectionStatus::Online);
                    backoff = settings.initial_backoff;
                    settings.interval
                }
                Err(e) => {
                    debug!("Probe of {} failed: {}", remote.name(), e);
                    connectivity.set_status(ConnectionStatus::Offline);
                    let delay = backoff;
                    backoff = (backoff * 2).min(settings.interval);
                    delay
                }
            };
            tokio::time::sleep(delay).await;
        }
    })
}
