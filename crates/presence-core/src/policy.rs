//! Arrival/departure decision rules.
//!
//! The event manager asks a [`PresencePolicy`] whether a client that was just
//! created or refreshed should be announced as arrived or departed. Policies
//! only look at a client's own state; they never touch the registry.

use std::fmt::Debug;

use crate::client::TrackedClient;
use crate::config::{PolicyConfig, PolicyKind};

/// Decides when lifecycle messages fire for a tracked client.
pub trait PresencePolicy: Debug + Send + Sync {
    /// Whether an arrival should be announced now.
    fn should_send_client_in(&self, client: &TrackedClient) -> bool;

    /// Whether a departure should be announced now, while the client is still
    /// being heard.
    fn should_send_client_out(&self, client: &TrackedClient) -> bool;

    /// How many recent RSSI samples each client must retain.
    fn window_len(&self) -> usize {
        1
    }
}

/// Announce every new device once, and leave departures to the sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediatePolicy;

impl PresencePolicy for ImmediatePolicy {
    fn should_send_client_in(&self, client: &TrackedClient) -> bool {
        !client.in_notified()
    }

    fn should_send_client_out(&self, _client: &TrackedClient) -> bool {
        false
    }
}

/// Signal-strength debounce.
///
/// A client arrives once its last `arrival_samples` readings are all at or
/// above `rssi_floor`. With `departure_samples > 0`, an announced client departs
/// once its last `departure_samples` readings are all below the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RssiThresholdPolicy {
    rssi_floor: i16,
    arrival_samples: usize,
    departure_samples: usize,
}

impl RssiThresholdPolicy {
    /// Create a policy; `arrival_samples` is clamped to at least one.
    pub fn new(rssi_floor: i16, arrival_samples: usize, departure_samples: usize) -> Self {
        Self {
            rssi_floor,
            arrival_samples: arrival_samples.max(1),
            departure_samples,
        }
    }

    fn tail_matches(client: &TrackedClient, samples: usize, pred: impl Fn(i16) -> bool) -> bool {
        let window = client.rssi_window();
        window.len() >= samples && window.iter().rev().take(samples).all(|&rssi| pred(rssi))
    }
}

impl PresencePolicy for RssiThresholdPolicy {
    fn should_send_client_in(&self, client: &TrackedClient) -> bool {
        !client.in_notified()
            && Self::tail_matches(client, self.arrival_samples, |rssi| rssi >= self.rssi_floor)
    }

    fn should_send_client_out(&self, client: &TrackedClient) -> bool {
        self.departure_samples > 0
            && client.in_notified()
            && !client.out_notified()
            && Self::tail_matches(client, self.departure_samples, |rssi| rssi < self.rssi_floor)
    }

    fn window_len(&self) -> usize {
        self.arrival_samples.max(self.departure_samples)
    }
}

/// Build the policy described by configuration.
pub fn from_config(config: &PolicyConfig) -> Box<dyn PresencePolicy> {
    match config.kind {
        PolicyKind::Immediate => Box::new(ImmediatePolicy),
        PolicyKind::RssiThreshold => Box::new(RssiThresholdPolicy::new(
            config.rssi_floor,
            config.arrival_samples,
            config.departure_samples,
        )),
    }
}
