//! Beacon advertisement decoding.
//!
//! This module turns a raw advertisement buffer, the sender's radio address and
//! the received signal strength into a typed [`Detection`]. Decoding never
//! fails on a garbled payload: fields that cannot be read fall back to zero so
//! the observation still flows downstream.
//!
//! # Frame layout
//!
//! ```text
//! offset  0..9   flags + manufacturer header (02 01 06 1A FF 4C 00 02 15)
//! offset  9..25  proximity UUID (16 bytes)
//! offset 25..27  major (big-endian)
//! offset 27..29  minor (big-endian)
//! offset 29      calibrated tx power (signed)
//! ```

use std::collections::HashMap;
use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::FilterConfig;

/// Payloads of this length or shorter cannot carry a beacon frame.
pub const MIN_FRAME_LEN: usize = 15;

/// Bluetooth SIG company identifier for Apple, which owns the iBeacon format.
pub const APPLE_COMPANY_ID: u16 = 0x004C;

const UUID_RANGE: std::ops::Range<usize> = 9..25;
const MAJOR_OFFSET: usize = 25;
const MINOR_OFFSET: usize = 27;
const TX_POWER_OFFSET: usize = 29;

/// iBeacon body: type (0x02), length (0x15), 16-byte UUID, major, minor, tx power.
const IBEACON_BODY_LEN: usize = 23;
const IBEACON_PREFIX: [u8; 2] = [0x02, 0x15];

/// Advertising flags plus the manufacturer-specific AD structure header.
const ADVERTISEMENT_HEADER: [u8; 7] = [0x02, 0x01, 0x06, 0x1A, 0xFF, 0x4C, 0x00];

/// One raw advertisement as delivered by a radio driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Raw advertisement bytes.
    pub payload: Vec<u8>,

    /// Sender radio address, little-endian as it arrives over the air.
    pub sender: Vec<u8>,

    /// Received signal strength in dBm.
    pub rssi: i16,

    /// When the frame was received.
    pub received_at: DateTime<Utc>,
}

impl RawFrame {
    /// Create a frame stamped with the current time.
    pub fn new(payload: Vec<u8>, sender: Vec<u8>, rssi: i16) -> Self {
        Self {
            payload,
            sender,
            rssi,
            received_at: Utc::now(),
        }
    }

    /// Decode this frame, see [`decode_at`].
    #[must_use]
    pub fn decode(&self) -> Option<Detection> {
        decode_at(&self.payload, &self.sender, self.rssi, self.received_at)
    }
}

/// A single decoded observation of a beacon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    /// Canonical device identity: big-endian uppercase hex of the radio address.
    pub device_id: String,

    /// Proximity UUID carried in the advertisement, uppercase hex.
    pub uuid: String,

    /// Beacon major number.
    pub major: u16,

    /// Beacon minor number.
    pub minor: u16,

    /// Calibrated transmit power at one metre, in dBm.
    pub tx_power: i8,

    /// Received signal strength in dBm.
    pub rssi: i16,

    /// When the advertisement was observed.
    pub observed_at: DateTime<Utc>,
}

/// Decode an advertisement observed now.
///
/// Returns `None` when the payload is too short to be a beacon frame.
#[must_use]
pub fn decode(payload: &[u8], sender: &[u8], rssi: i16) -> Option<Detection> {
    decode_at(payload, sender, rssi, Utc::now())
}

/// Decode an advertisement observed at `observed_at`.
///
/// Returns `None` when `payload.len() <= 15`. Any field whose bytes are
/// missing from a longer payload defaults to zero.
#[must_use]
pub fn decode_at(
    payload: &[u8],
    sender: &[u8],
    rssi: i16,
    observed_at: DateTime<Utc>,
) -> Option<Detection> {
    if payload.len() <= MIN_FRAME_LEN {
        return None;
    }

    let uuid_end = payload.len().min(UUID_RANGE.end);
    let uuid = payload
        .get(UUID_RANGE.start..uuid_end)
        .map(hex::encode_upper)
        .unwrap_or_default();

    Some(Detection {
        device_id: device_id_from_address(sender),
        uuid,
        major: read_u16_be(payload, MAJOR_OFFSET),
        minor: read_u16_be(payload, MINOR_OFFSET),
        tx_power: payload
            .get(TX_POWER_OFFSET)
            .map_or(0, |&raw| i8::from_be_bytes([raw])),
        rssi,
        observed_at,
    })
}

/// Render a little-endian radio address as the canonical device id.
#[must_use]
pub fn device_id_from_address(sender: &[u8]) -> String {
    let big_endian: Vec<u8> = sender.iter().rev().copied().collect();
    hex::encode_upper(big_endian)
}

fn read_u16_be(payload: &[u8], offset: usize) -> u16 {
    match (payload.get(offset), payload.get(offset + 1)) {
        (Some(&hi), Some(&lo)) => u16::from_be_bytes([hi, lo]),
        _ => 0,
    }
}

/// Rebuild a raw iBeacon advertisement from a manufacturer-data map.
///
/// BlueZ hands out manufacturer data already split per company id, so the
/// flags and AD header are prepended again to restore the on-air layout that
/// [`decode`] expects.
#[must_use]
pub fn ibeacon_advertisement(manufacturer_data: &HashMap<u16, Vec<u8>>) -> Option<Vec<u8>> {
    let body = manufacturer_data.get(&APPLE_COMPANY_ID)?;
    if body.len() < IBEACON_BODY_LEN || !body.starts_with(&IBEACON_PREFIX) {
        return None;
    }

    let mut frame = Vec::with_capacity(ADVERTISEMENT_HEADER.len() + IBEACON_BODY_LEN);
    frame.extend_from_slice(&ADVERTISEMENT_HEADER);
    frame.extend_from_slice(&body[..IBEACON_BODY_LEN]);
    Some(frame)
}

// =============================================================================
// MAJOR / MINOR ACCEPTANCE FILTER
// =============================================================================

/// Inclusive major/minor acceptance window applied before detections are queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconFilter {
    major: RangeInclusive<u16>,
    minor: RangeInclusive<u16>,
}

impl BeaconFilter {
    /// Create a filter from inclusive ranges.
    pub const fn new(major: RangeInclusive<u16>, minor: RangeInclusive<u16>) -> Self {
        Self { major, minor }
    }

    /// A filter that accepts every beacon.
    pub const fn accept_all() -> Self {
        Self::new(0..=u16::MAX, 0..=u16::MAX)
    }

    /// Whether a detection falls inside both windows.
    #[must_use]
    pub fn accepts(&self, detection: &Detection) -> bool {
        self.major.contains(&detection.major) && self.minor.contains(&detection.minor)
    }
}

impl Default for BeaconFilter {
    fn default() -> Self {
        Self::accept_all()
    }
}

impl From<&FilterConfig> for BeaconFilter {
    fn from(config: &FilterConfig) -> Self {
        Self::new(
            config.major_min..=config.major_max,
            config.minor_min..=config.minor_max,
        )
    }
}
