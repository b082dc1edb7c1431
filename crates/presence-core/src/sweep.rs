//! Periodic expiry of clients that are no longer heard.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::collection_point::shutdown_requested;
use crate::config::SweepConfig;
use crate::registry::ClientRegistry;

/// Runs [`ClientRegistry::sweep`] on a fixed interval.
#[derive(Debug, Clone)]
pub struct SweepScheduler {
    registry: Arc<ClientRegistry>,
    interval: Duration,
    client_timeout_ms: u64,
}

impl SweepScheduler {
    /// Sweep `registry` every `interval`, expiring clients idle longer than
    /// `client_timeout_ms`.
    pub fn new(registry: Arc<ClientRegistry>, interval: Duration, client_timeout_ms: u64) -> Self {
        Self {
            registry,
            interval: interval.max(Duration::from_millis(1)),
            client_timeout_ms,
        }
    }

    /// Build a scheduler from configuration.
    pub fn from_config(registry: Arc<ClientRegistry>, config: &SweepConfig) -> Self {
        Self::new(
            registry,
            Duration::from_millis(config.interval_ms),
            config.client_timeout_ms,
        )
    }

    /// Run one sweep now; returns how many clients were removed.
    pub fn sweep_once(&self) -> usize {
        let removed = self.registry.sweep(self.client_timeout_ms).len();
        if removed > 0 {
            info!(removed, remaining = self.registry.len(), "Swept stale clients");
        }
        removed
    }

    /// Sweep on every tick until shutdown is requested.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so the first sweep
        // happens one interval after start.
        ticker.tick().await;

        debug!(interval_ms = self.interval.as_millis(), "Sweep scheduler started");
        loop {
            tokio::select! {
                biased;
                () = shutdown_requested(&mut shutdown) => break,
                _ = ticker.tick() => {
                    self.sweep_once();
                }
            }
        }
        debug!("Sweep scheduler stopped");
    }
}
