//! Online/offline signal.
//!
//! [`Connectivity`] is the injected observable the sync orchestrator
//! watches; hosts feed it from their own network APIs, or run a
//! [`ConnectivityProbe`] that polls the remote service's health endpoint.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::remote::RemoteService;

/// A shared online/offline flag with change notification.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    /// Create a signal with the given initial state.
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Publish the current state. Subscribers are only woken on a change.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(
                "Connectivity changed: {}",
                if online { "online" } else { "offline" }
            );
        }
    }

    /// Check the current state.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Derives connectivity from the remote service's health endpoint.
#[derive(Debug)]
pub struct ConnectivityProbe {
    remote: Arc<dyn RemoteService>,
    connectivity: Connectivity,
    interval: Duration,
}

impl ConnectivityProbe {
    /// Create a probe publishing to `connectivity`.
    #[must_use]
    pub fn new(
        remote: Arc<dyn RemoteService>,
        connectivity: Connectivity,
        interval: Duration,
    ) -> Self {
        Self {
            remote,
            connectivity,
            interval,
        }
    }

    /// Probe once and publish the result.
    pub async fn probe_once(&self) -> bool {
        let online = match self.remote.health().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Health check failed: {}", e);
                false
            }
        };
        self.connectivity.set_online(online);
        online
    }

    /// Probe on the configured interval until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Connectivity probe stopping");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.probe_once().await;
                }
            }
        }
    }
}
