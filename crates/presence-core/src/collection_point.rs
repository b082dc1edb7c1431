//! Collection point runtime.
//!
//! A [`CollectionPoint`] owns the registry and event manager for one physical
//! collection point and runs the three concurrent activities:
//!
//! ```text
//! ┌──────────┐  Detection  ┌──────────┐         ┌──────────────┐
//! │ Scanner  │────queue───▶│ Consumer │────────▶│ EventManager │──▶ sink
//! └──────────┘             └──────────┘         └──────┬───────┘
//!                                                      │ lock
//! ┌──────────┐                                  ┌──────▼───────┐
//! │  Sweep   │─────────────────────────────────▶│   Registry   │
//! └──────────┘                                  └──────────────┘
//! ```
//!
//! Shutdown is cooperative: every activity watches a shared flag and exits at
//! its next await point once the flag turns `true`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::PresenceConfig;
use crate::detection::{BeaconFilter, Detection};
use crate::error::{PresenceError, Result};
use crate::events::{AuditSnapshot, CollectionPointIdentity, EventManager, EventSink};
use crate::policy;
use crate::registry::ClientRegistry;
use crate::scanner::{ScanStats, Scanner};
use crate::source::FrameSource;
use crate::sweep::SweepScheduler;

/// Resolves once `true` is observed on `shutdown`.
///
/// A dropped sender can never request shutdown, so the future then stays
/// pending.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Drain the detection queue into the event manager until it closes or
/// shutdown is requested.
///
/// # Errors
///
/// Returns the first registry contract violation; the caller is expected to
/// stop the collection point.
pub async fn run_consumer(
    manager: Arc<EventManager>,
    mut detections: mpsc::Receiver<Detection>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u64> {
    let mut processed = 0u64;

    loop {
        let detection = tokio::select! {
            biased;
            () = shutdown_requested(&mut shutdown) => break,
            detection = detections.recv() => detection,
        };
        let Some(detection) = detection else {
            break;
        };

        manager.register_detection(detection)?;
        processed += 1;
    }

    Ok(processed)
}

/// Context object for one collection point.
#[derive(Debug)]
pub struct CollectionPoint {
    config: PresenceConfig,
    registry: Arc<ClientRegistry>,
    manager: Arc<EventManager>,
}

impl CollectionPoint {
    /// Wire registry, policy and event manager from configuration.
    pub fn new(config: &PresenceConfig, sink: Arc<dyn EventSink>) -> Self {
        let registry = Arc::new(ClientRegistry::new());
        let manager = Arc::new(EventManager::new(
            CollectionPointIdentity::from(&config.collection_point),
            Arc::clone(&registry),
            sink,
            Arc::from(policy::from_config(&config.policy)),
        ));

        Self {
            config: config.clone(),
            registry,
            manager,
        }
    }

    /// The client registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// The event manager.
    #[must_use]
    pub const fn event_manager(&self) -> &Arc<EventManager> {
        &self.manager
    }

    /// Current audit counters.
    #[must_use]
    pub fn audit(&self) -> AuditSnapshot {
        self.manager.audit()
    }

    /// Run scanner, consumer and sweep until shutdown or source exhaustion.
    ///
    /// When the consumer stops for any reason, the scanner and sweep are told
    /// to stop as well and are awaited before returning.
    ///
    /// # Errors
    ///
    /// Returns the consumer's registry error, the scanner's source error, or a
    /// task failure.
    pub async fn run<S: FrameSource>(
        &self,
        source: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let delay = Duration::from_millis(self.config.collection_point.startup_delay_ms);
        if !delay.is_zero() {
            info!(
                delay_ms = self.config.collection_point.startup_delay_ms,
                "Waiting before scanning starts"
            );
            tokio::select! {
                () = shutdown_requested(&mut shutdown) => return Ok(()),
                () = tokio::time::sleep(delay) => {}
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (detection_tx, detection_rx) =
            mpsc::channel(self.config.collection_point.queue_capacity.max(1));

        let scanner: JoinHandle<Result<ScanStats>> = tokio::spawn(
            Scanner::new(source, BeaconFilter::from(&self.config.filter), detection_tx)
                .run(stop_rx.clone()),
        );
        let sweeper = tokio::spawn(
            SweepScheduler::from_config(Arc::clone(&self.registry), &self.config.sweep)
                .run(stop_rx.clone()),
        );
        let mut consumer = tokio::spawn(run_consumer(
            Arc::clone(&self.manager),
            detection_rx,
            stop_rx,
        ));

        info!(
            collection_point = %self.config.collection_point.id,
            "Collection point running"
        );

        let consumed = tokio::select! {
            joined = &mut consumer => joined,
            () = shutdown_requested(&mut shutdown) => {
                info!("Shutdown requested");
                stop_tx.send_replace(true);
                (&mut consumer).await
            }
        };
        stop_tx.send_replace(true);

        let scanned = scanner.await;
        if let Err(err) = sweeper.await {
            warn!(error = %err, "Sweep task failed");
        }

        let processed = consumed.map_err(|err| PresenceError::TaskFailed(err.to_string()))??;
        let stats = scanned.map_err(|err| PresenceError::TaskFailed(err.to_string()))?;
        match stats {
            Ok(stats) => {
                info!(processed, ?stats, audit = ?self.audit(), "Collection point stopped");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Scanner failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyKind;
    use crate::detection::RawFrame;
    use crate::events::{LifecycleMessage, Topic};
    use crate::source::MockSource;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<LifecycleMessage>>);

    impl EventSink for RecordingSink {
        fn publish(&self, message: LifecycleMessage) {
            self.0.lock().unwrap().push(message);
        }
    }

    fn beacon(sender_last: u8, major: u16) -> RawFrame {
        let mut payload = vec![0x02, 0x01, 0x06, 0x1A, 0xFF, 0x4C, 0x00, 0x02, 0x15];
        payload.extend([0xAB; 16]);
        payload.extend_from_slice(&major.to_be_bytes());
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.push(0xC5);
        RawFrame::new(payload, vec![sender_last, 0, 0, 0, 0, 0xAA], -60)
    }

    #[tokio::test]
    async fn test_run_until_source_exhausted() {
        let mut config = PresenceConfig::default();
        config.filter.major_max = 10;
        config.policy.kind = PolicyKind::Immediate;

        let sink = Arc::new(RecordingSink::default());
        let point = CollectionPoint::new(&config, sink.clone());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let source = MockSource::new([beacon(1, 1), beacon(2, 2), beacon(1, 1), beacon(3, 99)]);
        point.run(source, shutdown_rx).await.unwrap();

        assert_eq!(point.registry().device_ids(), ["AA0000000001", "AA0000000002"]);
        let messages = sink.0.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.topic == Topic::ClientIn));
        assert_eq!(point.audit().new_events, 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let config = PresenceConfig::default();
        let point = CollectionPoint::new(&config, Arc::new(RecordingSink::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let frames = std::iter::repeat_with(|| beacon(7, 1)).take(10_000);
        shutdown_tx.send(true).unwrap();
        point.run(MockSource::new(frames), shutdown_rx).await.unwrap();

        assert!(point.registry().len() <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_delay_is_interruptible() {
        let mut config = PresenceConfig::default();
        config.collection_point.startup_delay_ms = 60_000;
        let point = CollectionPoint::new(&config, Arc::new(RecordingSink::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let run = point.run(MockSource::new([beacon(1, 1)]), shutdown_rx);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            shutdown_tx.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(run, stop);

        result.unwrap();
        assert!(point.registry().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_requested_ignores_false_updates() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(false).unwrap();
        let waiter = tokio::spawn(async move { shutdown_requested(&mut rx).await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tx.send(true).unwrap();
        waiter.await.unwrap();
    }
}
