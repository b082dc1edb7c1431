//! Per-device presence state.
//!
//! A [`TrackedClient`] lives in the registry for as long as its beacon keeps
//! being heard. It remembers whether an arrival (`clientIn`) or departure
//! (`clientOut`) message has already gone out for the current visibility
//! episode, so each transition is announced at most once.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::detection::Detection;

/// Registry record for one physically observed beacon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedClient {
    device_id: String,
    latest: Detection,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    in_notified: bool,
    out_notified: bool,
    detections: u64,
    rssi_window: VecDeque<i16>,
    window_len: usize,
}

impl TrackedClient {
    /// Start tracking a device from its first detection.
    ///
    /// `window_len` bounds how many recent RSSI samples are retained for the
    /// presence policy; it is clamped to at least one.
    pub fn new(detection: Detection, window_len: usize) -> Self {
        let window_len = window_len.max(1);
        let mut rssi_window = VecDeque::with_capacity(window_len);
        rssi_window.push_back(detection.rssi);

        Self {
            device_id: detection.device_id.clone(),
            first_seen_at: detection.observed_at,
            last_seen_at: detection.observed_at,
            latest: detection,
            in_notified: false,
            out_notified: false,
            detections: 1,
            rssi_window,
            window_len,
        }
    }

    /// Fold another detection of the same device into this record.
    ///
    /// Clears any departure notice, since the device is evidently still
    /// around. The arrival flag is left alone so arrival is not announced
    /// twice.
    ///
    /// A detection observed before `last_seen_at` only counts towards
    /// `detections`; `latest`, `last_seen_at` and the RSSI window always
    /// describe the newest observation.
    pub fn update_with_new_detection(&mut self, detection: Detection) {
        debug_assert_eq!(detection.device_id, self.device_id);

        self.detections = self.detections.saturating_add(1);
        self.out_notified = false;
        if detection.observed_at < self.last_seen_at {
            return;
        }

        self.last_seen_at = detection.observed_at;
        if self.rssi_window.len() == self.window_len {
            self.rssi_window.pop_front();
        }
        self.rssi_window.push_back(detection.rssi);
        self.latest = detection;
    }

    /// Record that an arrival message was sent.
    pub fn mark_client_in_sent(&mut self) {
        self.in_notified = true;
        self.out_notified = false;
    }

    /// Record that a departure message was sent.
    ///
    /// Ends the visibility episode: a later arrival may be announced again.
    pub fn mark_client_out_sent(&mut self) {
        self.out_notified = true;
        self.in_notified = false;
    }

    /// Whether removing this record should announce a departure.
    ///
    /// Only clients whose arrival was announced, and whose departure was not,
    /// get a `clientOut` when they are swept.
    #[must_use]
    pub const fn sweep_should_send_client_out(&self) -> bool {
        self.in_notified && !self.out_notified
    }

    /// Canonical device id.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Most recent detection.
    #[must_use]
    pub const fn latest(&self) -> &Detection {
        &self.latest
    }

    /// Time of the first detection in this episode.
    #[must_use]
    pub const fn first_seen_at(&self) -> DateTime<Utc> {
        self.first_seen_at
    }

    /// Time of the most recent detection.
    #[must_use]
    pub const fn last_seen_at(&self) -> DateTime<Utc> {
        self.last_seen_at
    }

    /// Whether an arrival has been announced.
    #[must_use]
    pub const fn in_notified(&self) -> bool {
        self.in_notified
    }

    /// Whether a departure has been announced.
    #[must_use]
    pub const fn out_notified(&self) -> bool {
        self.out_notified
    }

    /// Number of detections folded into this record.
    #[must_use]
    pub const fn detections(&self) -> u64 {
        self.detections
    }

    /// Recent RSSI samples, oldest first.
    #[must_use]
    pub const fn rssi_window(&self) -> &VecDeque<i16> {
        &self.rssi_window
    }

    /// Age of the record relative to `now`, in milliseconds.
    #[must_use]
    pub fn idle_millis(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_seen_at).num_milliseconds()
    }

    /// Message payload describing this client.
    #[must_use]
    pub fn event_payload(&self) -> Map<String, Value> {
        let payload = json!({
            "beaconMac": self.device_id,
            "beaconId": self.latest.uuid,
            "beaconMajor": self.latest.major,
            "beaconMinor": self.latest.minor,
            "rssi": self.latest.rssi,
            "txPower": self.latest.tx_power,
            "firstRegisteredTime": self.first_seen_at,
            "lastRegisteredTime": self.last_seen_at,
            "detections": self.detections,
        });

        match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    pub(crate) fn detection_at(device_id: &str, rssi: i16, at: DateTime<Utc>) -> Detection {
        Detection {
            device_id: device_id.to_string(),
            uuid: "E2C56DB5DFFB48D2B060D0F5A71096E0".to_string(),
            major: 1,
            minor: 1,
            tx_power: -59,
            rssi,
            observed_at: at,
        }
    }

    pub(crate) fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_new_client_starts_unnotified() {
        let client = TrackedClient::new(detection_at("AABBCCDDEEFF", -60, epoch()), 4);

        assert_eq!(client.device_id(), "AABBCCDDEEFF");
        assert!(!client.in_notified());
        assert!(!client.out_notified());
        assert_eq!(client.first_seen_at(), client.last_seen_at());
        assert_eq!(client.detections(), 1);
        assert!(!client.sweep_should_send_client_out());
    }

    #[test]
    fn test_update_refreshes_last_seen_and_clears_departure() {
        let mut client = TrackedClient::new(detection_at("AA", -60, epoch()), 4);
        client.mark_client_in_sent();
        client.out_notified = true;

        let later = epoch() + Duration::milliseconds(500);
        client.update_with_new_detection(detection_at("AA", -55, later));

        assert_eq!(client.last_seen_at(), later);
        assert_eq!(client.first_seen_at(), epoch());
        assert!(client.in_notified());
        assert!(!client.out_notified());
        assert_eq!(client.latest().rssi, -55);
        assert_eq!(client.detections(), 2);
    }

    #[test]
    fn test_out_of_order_detection_does_not_rewind_last_seen() {
        let mut client = TrackedClient::new(detection_at("AA", -60, epoch()), 4);
        client.update_with_new_detection(detection_at("AA", -60, epoch() - Duration::seconds(1)));
        assert_eq!(client.last_seen_at(), epoch());
    }

    #[test]
    fn test_out_of_order_detection_keeps_latest_consistent() {
        let mut client = TrackedClient::new(detection_at("AA", -60, epoch()), 4);
        client.mark_client_in_sent();
        client.out_notified = true;

        client.update_with_new_detection(detection_at("AA", -99, epoch() - Duration::seconds(5)));

        assert_eq!(client.last_seen_at(), epoch());
        assert_eq!(client.latest().observed_at, epoch());
        assert_eq!(client.latest().rssi, -60);
        assert_eq!(client.rssi_window().iter().copied().collect::<Vec<_>>(), [-60]);
        assert_eq!(client.detections(), 2);
        assert!(!client.out_notified());
    }

    #[test]
    fn test_rssi_window_is_bounded() {
        let mut client = TrackedClient::new(detection_at("AA", -90, epoch()), 3);
        for rssi in [-80, -70, -60, -50] {
            client.update_with_new_detection(detection_at("AA", rssi, epoch()));
        }
        assert_eq!(client.rssi_window().iter().copied().collect::<Vec<_>>(), [-70, -60, -50]);
    }

    #[test]
    fn test_notification_flags_are_exclusive() {
        let mut client = TrackedClient::new(detection_at("AA", -60, epoch()), 1);

        client.mark_client_in_sent();
        assert!(client.sweep_should_send_client_out());

        client.mark_client_out_sent();
        assert!(!client.in_notified());
        assert!(client.out_notified());
        assert!(!client.sweep_should_send_client_out());

        client.mark_client_in_sent();
        assert!(client.in_notified() && !client.out_notified());
    }

    #[test]
    fn test_event_payload_fields() {
        let client = TrackedClient::new(detection_at("AABBCCDDEEFF", -61, epoch()), 1);
        let payload = client.event_payload();

        assert_eq!(payload["beaconMac"], "AABBCCDDEEFF");
        assert_eq!(payload["beaconMajor"], 1);
        assert_eq!(payload["beaconMinor"], 1);
        assert_eq!(payload["rssi"], -61);
        assert_eq!(payload["txPower"], -59);
        assert_eq!(payload["detections"], 1);
        assert!(payload.contains_key("lastRegisteredTime"));
    }
}
