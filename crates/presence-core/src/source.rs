//! Raw advertisement sources.
//!
//! A [`FrameSource`] yields raw frames at whatever cadence its driver scans.
//! The scanner pulls from exactly one source; `Ok(None)` means the source is
//! exhausted and scanning should stop.
//!
//! - [`ReplaySource`] replays a recorded JSON-lines capture
//! - [`MockSource`] serves frames from memory (tests, `mock-bluetooth`)
//! - `BluezSource` scans live through BlueZ (`bluetooth` feature)

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{SourceConfig, SourceKind};
use crate::detection::RawFrame;

/// Errors raised by frame sources.
#[derive(Debug, Error)]
pub enum SourceError {
    /// No Bluetooth adapter is available.
    #[error("no Bluetooth adapter found")]
    AdapterNotFound,

    /// The Bluetooth session could not be established.
    #[error("failed to initialise Bluetooth session: {message}")]
    SessionInitFailed {
        /// Driver message.
        message: String,
    },

    /// Discovery could not be started or broke down.
    #[error("Bluetooth discovery failed: {message}")]
    DiscoveryFailed {
        /// Driver message.
        message: String,
    },

    /// The replay capture could not be read.
    #[error("failed to read replay file {}: {source}", .path.display())]
    ReplayRead {
        /// Capture path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A capture line is malformed.
    #[error("replay line {line}: {message}")]
    ReplayParse {
        /// 1-based line number.
        line: usize,
        /// What is wrong with it.
        message: String,
    },

    /// The configured source is not compiled into this build.
    #[error("source '{kind}' is not available in this build")]
    Unsupported {
        /// Source name.
        kind: &'static str,
    },
}

/// Result alias for source operations.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// A stream of raw advertisements.
pub trait FrameSource: Send + 'static {
    /// Wait for the next frame; `Ok(None)` once the source is exhausted.
    ///
    /// Implementations must be cancel-safe enough that dropping the returned
    /// future loses at most the frame being assembled.
    fn next_frame(&mut self) -> impl Future<Output = SourceResult<Option<RawFrame>>> + Send;
}

// =============================================================================
// REPLAY
// =============================================================================

/// One line of a replay capture.
#[derive(Debug, Deserialize)]
struct ReplayLine {
    payload: String,
    sender: String,
    rssi: i16,
    #[serde(default)]
    delay_ms: u64,
}

#[derive(Debug, Clone)]
struct ReplayEntry {
    payload: Vec<u8>,
    sender: Vec<u8>,
    rssi: i16,
    delay: Duration,
}

/// Replays frames recorded as JSON lines.
///
/// ```text
/// {"payload": "0201061AFF4C000215...", "sender": "FFEEDDCCBBAA", "rssi": -61, "delay_ms": 250}
/// ```
///
/// `payload` and `sender` are hex; `sender` is in over-the-air (little-endian)
/// order. `delay_ms` is waited before the frame is delivered. Blank lines and
/// lines starting with `#` are ignored.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    entries: VecDeque<ReplayEntry>,
}

impl ReplaySource {
    /// Read and parse a capture file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or any line is malformed.
    pub fn open(path: &Path) -> SourceResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| SourceError::ReplayRead {
            path: path.to_path_buf(),
            source,
        })?;
        let source = Self::parse(&content)?;
        info!(path = %path.display(), frames = source.remaining(), "Loaded replay capture");
        Ok(source)
    }

    /// Parse capture content.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::ReplayParse`] naming the first malformed line.
    pub fn parse(content: &str) -> SourceResult<Self> {
        let mut entries = VecDeque::new();

        for (index, raw) in content.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let parsed: ReplayLine =
                serde_json::from_str(trimmed).map_err(|err| SourceError::ReplayParse {
                    line,
                    message: err.to_string(),
                })?;
            let decode_hex = |field: &str, value: &str| {
                hex::decode(value).map_err(|err| SourceError::ReplayParse {
                    line,
                    message: format!("{field}: {err}"),
                })
            };

            entries.push_back(ReplayEntry {
                payload: decode_hex("payload", &parsed.payload)?,
                sender: decode_hex("sender", &parsed.sender)?,
                rssi: parsed.rssi,
                delay: Duration::from_millis(parsed.delay_ms),
            });
        }

        Ok(Self { entries })
    }

    /// Frames not yet delivered.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.entries.len()
    }
}

impl FrameSource for ReplaySource {
    async fn next_frame(&mut self) -> SourceResult<Option<RawFrame>> {
        let Some(entry) = self.entries.front().cloned() else {
            debug!("Replay capture exhausted");
            return Ok(None);
        };
        if !entry.delay.is_zero() {
            tokio::time::sleep(entry.delay).await;
        }
        // Only dequeue once the delay has elapsed, so cancellation keeps the frame.
        self.entries.pop_front();
        Ok(Some(RawFrame::new(entry.payload, entry.sender, entry.rssi)))
    }
}

// =============================================================================
// MOCK
// =============================================================================

/// In-memory frame source.
#[cfg(any(test, feature = "mock-bluetooth"))]
#[derive(Debug, Clone, Default)]
pub struct MockSource {
    frames: VecDeque<RawFrame>,
}

#[cfg(any(test, feature = "mock-bluetooth"))]
impl MockSource {
    /// Serve `frames` in order, then report exhaustion.
    pub fn new(frames: impl IntoIterator<Item = RawFrame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }
}

#[cfg(any(test, feature = "mock-bluetooth"))]
impl FrameSource for MockSource {
    async fn next_frame(&mut self) -> SourceResult<Option<RawFrame>> {
        tokio::task::yield_now().await;
        Ok(self.frames.pop_front())
    }
}

// =============================================================================
// CONFIGURED SOURCE
// =============================================================================

/// The source selected by `[source]` configuration.
#[derive(Debug)]
pub enum ConfiguredSource {
    /// Replay capture.
    Replay(ReplaySource),
    /// Live BlueZ scanning.
    #[cfg(feature = "bluetooth")]
    Bluez(crate::bluetooth::BluezSource),
}

impl ConfiguredSource {
    /// Open the configured source.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be opened, or if it needs a
    /// feature this build lacks.
    pub async fn open(config: &SourceConfig) -> SourceResult<Self> {
        match config.kind {
            SourceKind::Replay => {
                let path = config
                    .replay_path
                    .as_deref()
                    .ok_or_else(|| SourceError::ReplayParse {
                        line: 0,
                        message: "no replay_path configured".into(),
                    })?;
                Ok(Self::Replay(ReplaySource::open(path)?))
            }
            #[cfg(feature = "bluetooth")]
            SourceKind::Bluez => Ok(Self::Bluez(
                crate::bluetooth::BluezSource::open(config.adapter.as_deref()).await?,
            )),
            #[cfg(not(feature = "bluetooth"))]
            SourceKind::Bluez => Err(SourceError::Unsupported { kind: "bluez" }),
        }
    }
}

impl FrameSource for ConfiguredSource {
    async fn next_frame(&mut self) -> SourceResult<Option<RawFrame>> {
        match self {
            Self::Replay(source) => source.next_frame().await,
            #[cfg(feature = "bluetooth")]
            Self::Bluez(source) => source.next_frame().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FRAME_HEX: &str = "0201061AFF4C000215E2C56DB5DFFB48D2B060D0F5A71096E000010002C5";

    #[tokio::test]
    async fn test_replay_parses_and_serves_in_order() {
        let content = format!(
            "# capture\n\
             {{\"payload\": \"{FRAME_HEX}\", \"sender\": \"FFEEDDCCBBAA\", \"rssi\": -61}}\n\
             \n\
             {{\"payload\": \"0201\", \"sender\": \"010203040506\", \"rssi\": -90, \"delay_ms\": 0}}\n"
        );
        let mut source = ReplaySource::parse(&content).unwrap();
        assert_eq!(source.remaining(), 2);

        let first = source.next_frame().await.unwrap().unwrap();
        assert_eq!(first.rssi, -61);
        let detection = first.decode().unwrap();
        assert_eq!(detection.device_id, "AABBCCDDEEFF");
        assert_eq!(detection.major, 1);
        assert_eq!(detection.minor, 2);
        assert_eq!(detection.tx_power, -59);

        let second = source.next_frame().await.unwrap().unwrap();
        assert_eq!(second.payload, [0x02, 0x01]);
        assert!(second.decode().is_none());

        assert!(source.next_frame().await.unwrap().is_none());
    }

    #[test]
    fn test_replay_reports_bad_line() {
        let content = "{\"payload\": \"00\", \"sender\": \"00\", \"rssi\": -1}\n{\"payload\": \"zz\", \"sender\": \"00\", \"rssi\": -1}";
        let err = ReplaySource::parse(content).unwrap_err();
        assert!(matches!(err, SourceError::ReplayParse { line: 2, .. }), "{err}");

        let err = ReplaySource::parse("not json").unwrap_err();
        assert!(matches!(err, SourceError::ReplayParse { line: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_honours_delay() {
        let mut source = ReplaySource::parse(&format!(
            "{{\"payload\": \"{FRAME_HEX}\", \"sender\": \"FFEEDDCCBBAA\", \"rssi\": -61, \"delay_ms\": 250}}"
        ))
        .unwrap();

        let started = tokio::time::Instant::now();
        source.next_frame().await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn test_replay_open_missing_file() {
        let err = ReplaySource::open(Path::new("/nonexistent/frames.jsonl")).unwrap_err();
        assert!(matches!(err, SourceError::ReplayRead { .. }));
    }

    #[tokio::test]
    async fn test_configured_replay_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "{{\"payload\": \"{FRAME_HEX}\", \"sender\": \"FFEEDDCCBBAA\", \"rssi\": -61}}"
        )
        .unwrap();

        let config = SourceConfig {
            kind: SourceKind::Replay,
            adapter: None,
            replay_path: Some(file.path().to_path_buf()),
        };
        let mut source = ConfiguredSource::open(&config).await.unwrap();
        assert!(source.next_frame().await.unwrap().is_some());
        assert!(source.next_frame().await.unwrap().is_none());
    }

    #[test]
    fn test_replay_without_path_is_rejected() {
        let config = SourceConfig {
            kind: SourceKind::Replay,
            adapter: None,
            replay_path: None,
        };
        let err = tokio_test::block_on(ConfiguredSource::open(&config)).unwrap_err();
        assert!(matches!(err, SourceError::ReplayParse { line: 0, .. }));
    }

    #[cfg(not(feature = "bluetooth"))]
    #[tokio::test]
    async fn test_bluez_unavailable_without_feature() {
        let err = ConfiguredSource::open(&SourceConfig::default()).await.unwrap_err();
        assert!(matches!(err, SourceError::Unsupported { kind: "bluez" }));
    }

    #[tokio::test]
    async fn test_mock_source_drains() {
        let mut source = MockSource::new([RawFrame::new(vec![0; 30], vec![1; 6], -40)]);
        assert!(source.next_frame().await.unwrap().is_some());
        assert!(source.next_frame().await.unwrap().is_none());
    }
}
