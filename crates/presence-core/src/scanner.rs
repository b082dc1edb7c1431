//! The radio-scanning activity.
//!
//! Pulls raw frames from a [`FrameSource`], decodes them, drops beacons outside
//! the configured major/minor window and queues the rest for the event
//! manager. Decoding happens here so the consumer never waits on it.

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use crate::collection_point::shutdown_requested;
use crate::detection::{BeaconFilter, Detection};
use crate::error::Result;
use crate::source::FrameSource;

/// Frame counts for one scanner run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    /// Frames received from the source.
    pub frames: u64,
    /// Frames too short to be a beacon.
    pub undecodable: u64,
    /// Beacons outside the major/minor window.
    pub filtered: u64,
    /// Detections handed to the queue.
    pub queued: u64,
}

/// Decodes frames from a source into the detection queue.
#[derive(Debug)]
pub struct Scanner<S> {
    source: S,
    filter: BeaconFilter,
    detections: mpsc::Sender<Detection>,
}

impl<S: FrameSource> Scanner<S> {
    /// Create a scanner feeding `detections`.
    pub const fn new(source: S, filter: BeaconFilter, detections: mpsc::Sender<Detection>) -> Self {
        Self {
            source,
            filter,
            detections,
        }
    }

    /// Scan until shutdown, source exhaustion, or the queue closing.
    ///
    /// # Errors
    ///
    /// Returns the source's error if it fails.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<ScanStats> {
        let mut stats = ScanStats::default();

        loop {
            let frame = tokio::select! {
                biased;
                () = shutdown_requested(&mut shutdown) => break,
                frame = self.source.next_frame() => frame?,
            };

            let Some(frame) = frame else {
                info!("Frame source exhausted");
                break;
            };
            stats.frames += 1;

            let Some(detection) = frame.decode() else {
                stats.undecodable += 1;
                continue;
            };
            if !self.filter.accepts(&detection) {
                trace!(
                    device_id = %detection.device_id,
                    major = detection.major,
                    minor = detection.minor,
                    "Beacon outside major/minor window"
                );
                stats.filtered += 1;
                continue;
            }

            let sent = tokio::select! {
                biased;
                () = shutdown_requested(&mut shutdown) => break,
                sent = self.detections.send(detection) => sent,
            };
            if sent.is_err() {
                debug!("Detection queue closed");
                break;
            }
            stats.queued += 1;
        }

        debug!(?stats, "Scanner stopped");
        Ok(stats)
    }
}
