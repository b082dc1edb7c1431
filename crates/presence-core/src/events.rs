//! Lifecycle event generation.
//!
//! The [`EventManager`] is the single consumer of decoded detections. For each
//! detection it looks the device up in the registry, creates or refreshes its
//! [`TrackedClient`], asks the [`PresencePolicy`] whether a transition fired,
//! and publishes `clientIn` / `clientOut` messages to the outbound
//! [`EventSink`].
//!
//! Departures of swept clients arrive through the registry's observer hook,
//! which the manager subscribes at construction.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::TrackedClient;
use crate::config::CollectionPointConfig;
use crate::detection::Detection;
use crate::error::Result;
use crate::policy::PresencePolicy;
use crate::registry::{ClientRegistry, RegistryObserver};

/// Audit counters reset to zero once they pass this value.
pub const AUDIT_COUNTER_LIMIT: u64 = 1_000_000;

// =============================================================================
// MESSAGES
// =============================================================================

/// Lifecycle message topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// A client arrived.
    #[serde(rename = "clientIn")]
    ClientIn,
    /// A client departed.
    #[serde(rename = "clientOut")]
    ClientOut,
}

impl Topic {
    /// Wire name of the topic.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientIn => "clientIn",
            Self::ClientOut => "clientOut",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `clientIn` / `clientOut` message bound for the outbound transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleMessage {
    /// Unique, time-ordered message id.
    pub message_id: Uuid,

    /// Event topic.
    pub topic: Topic,

    /// Collection point id.
    pub sender_id: String,

    /// Collection point type.
    pub sender_type: String,

    /// Client description.
    pub payload: Map<String, Value>,

    /// Last time the client was heard.
    pub timestamp: DateTime<Utc>,
}

/// Sender metadata stamped on every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionPointIdentity {
    /// Collection point id.
    pub id: String,
    /// Collection point type.
    pub gateway_type: String,
}

impl From<&CollectionPointConfig> for CollectionPointIdentity {
    fn from(config: &CollectionPointConfig) -> Self {
        Self {
            id: config.id.clone(),
            gateway_type: config.gateway_type.clone(),
        }
    }
}

// =============================================================================
// SINKS
// =============================================================================

/// Outbound boundary for lifecycle messages.
///
/// Publishing is fire-and-forget; the sink is called with the registry lock
/// held and must not block.
pub trait EventSink: Send + Sync {
    /// Hand a message to the transport.
    fn publish(&self, message: LifecycleMessage);
}

/// Sink forwarding messages into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: UnboundedSender<LifecycleMessage>,
}

impl ChannelSink {
    /// Wrap the sending half of a channel.
    pub const fn new(sender: UnboundedSender<LifecycleMessage>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, message: LifecycleMessage) {
        if let Err(err) = self.sender.send(message) {
            warn!(
                topic = %err.0.topic,
                message_id = %err.0.message_id,
                "Outbound channel closed, dropping message"
            );
        }
    }
}

// =============================================================================
// AUDIT COUNTERS
// =============================================================================

/// Point-in-time copy of the audit counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuditSnapshot {
    /// Clients created since startup (modulo the counter limit).
    pub new_events: u64,
    /// Clients swept since startup (modulo the counter limit).
    pub remove_events: u64,
}

#[derive(Debug, Default)]
struct AuditCounters {
    new_events: AtomicU64,
    remove_events: AtomicU64,
}

impl AuditCounters {
    fn bump(counter: &AtomicU64) {
        // Closure always returns Some, so this cannot fail.
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            Some(if n > AUDIT_COUNTER_LIMIT { 0 } else { n + 1 })
        });
    }

    fn snapshot(&self) -> AuditSnapshot {
        AuditSnapshot {
            new_events: self.new_events.load(Ordering::Relaxed),
            remove_events: self.remove_events.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// EMITTER
// =============================================================================

/// Owns the sink and counters; subscribed to the registry as its observer.
struct Emitter {
    identity: CollectionPointIdentity,
    sink: Arc<dyn EventSink>,
    audit: AuditCounters,
}

impl Emitter {
    fn emit(&self, client: &mut TrackedClient, topic: Topic) {
        let message = LifecycleMessage {
            message_id: Uuid::now_v7(),
            topic,
            sender_id: self.identity.id.clone(),
            sender_type: self.identity.gateway_type.clone(),
            payload: client.event_payload(),
            timestamp: client.last_seen_at(),
        };

        match topic {
            Topic::ClientIn => client.mark_client_in_sent(),
            Topic::ClientOut => client.mark_client_out_sent(),
        }

        info!(
            device_id = client.device_id(),
            topic = %topic,
            rssi = client.latest().rssi,
            "Lifecycle event"
        );
        self.sink.publish(message);
    }
}

impl RegistryObserver for Emitter {
    fn client_added(&self, client: &TrackedClient) {
        debug!(device_id = client.device_id(), "New client registered");
        AuditCounters::bump(&self.audit.new_events);
    }

    fn client_removed(&self, client: &TrackedClient) {
        debug!(device_id = client.device_id(), "Registered client removed");
        if client.sweep_should_send_client_out() {
            // Already removed from the registry; the flag change is not persisted.
            let mut departed = client.clone();
            self.emit(&mut departed, Topic::ClientOut);
        }
        AuditCounters::bump(&self.audit.remove_events);
    }
}

// =============================================================================
// EVENT MANAGER
// =============================================================================

/// Turns detections into registry updates and lifecycle messages.
pub struct EventManager {
    registry: Arc<ClientRegistry>,
    emitter: Arc<Emitter>,
    policy: Arc<dyn PresencePolicy>,
}

impl fmt::Debug for EventManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventManager")
            .field("identity", &self.emitter.identity)
            .field("policy", &self.policy)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl EventManager {
    /// Create a manager and subscribe it to `registry` removals.
    pub fn new(
        identity: CollectionPointIdentity,
        registry: Arc<ClientRegistry>,
        sink: Arc<dyn EventSink>,
        policy: Arc<dyn PresencePolicy>,
    ) -> Self {
        let emitter = Arc::new(Emitter {
            identity,
            sink,
            audit: AuditCounters::default(),
        });
        registry.subscribe(emitter.clone());

        Self {
            registry,
            emitter,
            policy,
        }
    }

    /// Fold one detection into the registry, emitting at most one message.
    ///
    /// Returns the topic of the message emitted, if any.
    ///
    /// # Errors
    ///
    /// Returns a registry contract violation. This cannot happen while the
    /// lookup and the mutation share one registry lock, and is fatal if it does.
    pub fn register_detection(&self, detection: Detection) -> Result<Option<Topic>> {
        let mut registry = self.registry.lock();

        match registry.lookup(&detection.device_id).cloned() {
            Some(mut client) => {
                client.update_with_new_detection(detection);
                let fired = self.apply_policy(&mut client);
                registry.update(client)?;
                Ok(fired)
            }
            None => {
                let mut client = TrackedClient::new(detection, self.policy.window_len());
                let fired = self.apply_policy(&mut client);
                registry.upsert_new(client)?;
                Ok(fired)
            }
        }
    }

    /// Fold a batch of detections in order.
    ///
    /// # Errors
    ///
    /// Stops at the first registry contract violation.
    pub fn register_detections(
        &self,
        detections: impl IntoIterator<Item = Detection>,
    ) -> Result<()> {
        for detection in detections {
            self.register_detection(detection)?;
        }
        Ok(())
    }

    /// Current audit counters.
    #[must_use]
    pub fn audit(&self) -> AuditSnapshot {
        self.emitter.audit.snapshot()
    }

    /// The registry this manager drives.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    fn apply_policy(&self, client: &mut TrackedClient) -> Option<Topic> {
        let topic = if self.policy.should_send_client_in(client) {
            Topic::ClientIn
        } else if self.policy.should_send_client_out(client) {
            Topic::ClientOut
        } else {
            return None;
        };

        self.emitter.emit(client, topic);
        Some(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{detection_at, epoch};
    use crate::policy::{ImmediatePolicy, RssiThresholdPolicy};
    use chrono::Duration;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<LifecycleMessage>>,
    }

    impl RecordingSink {
        fn topics(&self) -> Vec<(Topic, String)> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .map(|m| (m.topic, m.payload["beaconMac"].as_str().unwrap().to_string()))
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn publish(&self, message: LifecycleMessage) {
            self.messages.lock().unwrap().push(message);
        }
    }

    fn identity() -> CollectionPointIdentity {
        CollectionPointIdentity {
            id: "lobby-01".into(),
            gateway_type: "btle".into(),
        }
    }

    fn manager_with(policy: Arc<dyn PresencePolicy>) -> (EventManager, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let manager = EventManager::new(
            identity(),
            Arc::new(ClientRegistry::new()),
            sink.clone(),
            policy,
        );
        (manager, sink)
    }

    fn at(ms: i64) -> chrono::DateTime<Utc> {
        epoch() + Duration::milliseconds(ms)
    }

    const DEVICE: &str = "AABBCCDDEEFF";

    #[test]
    fn test_new_client_announces_arrival() {
        let (manager, sink) = manager_with(Arc::new(ImmediatePolicy));

        let fired = manager.register_detection(detection_at(DEVICE, -60, at(0))).unwrap();

        assert_eq!(fired, Some(Topic::ClientIn));
        assert_eq!(sink.topics(), [(Topic::ClientIn, DEVICE.to_string())]);
        let client = manager.registry().lookup(DEVICE).unwrap();
        assert!(client.in_notified());
        assert!(!client.out_notified());

        let message = &sink.messages.lock().unwrap()[0];
        assert_eq!(message.sender_id, "lobby-01");
        assert_eq!(message.sender_type, "btle");
        assert_eq!(message.timestamp, at(0));
        assert_eq!(message.payload["beaconMajor"], 1);
    }

    #[test]
    fn test_repeat_detection_is_silent() {
        let (manager, sink) = manager_with(Arc::new(ImmediatePolicy));

        manager.register_detection(detection_at(DEVICE, -60, at(0))).unwrap();
        let fired = manager.register_detection(detection_at(DEVICE, -58, at(500))).unwrap();

        assert_eq!(fired, None);
        assert_eq!(sink.topics().len(), 1);
        assert_eq!(manager.registry().lookup(DEVICE).unwrap().last_seen_at(), at(500));
    }

    #[test]
    fn test_sweep_announces_departure_and_removes() {
        let (manager, sink) = manager_with(Arc::new(ImmediatePolicy));
        manager.register_detection(detection_at(DEVICE, -60, at(0))).unwrap();
        manager.register_detection(detection_at(DEVICE, -60, at(500))).unwrap();

        let removed = manager.registry().sweep_at(at(2000), 1000);

        assert_eq!(removed.len(), 1);
        assert!(manager.registry().lookup(DEVICE).is_none());
        assert_eq!(
            sink.topics(),
            [
                (Topic::ClientIn, DEVICE.to_string()),
                (Topic::ClientOut, DEVICE.to_string())
            ]
        );
        let departure = &sink.messages.lock().unwrap()[1];
        assert_eq!(departure.timestamp, at(500));
        assert_eq!(manager.audit(), AuditSnapshot { new_events: 1, remove_events: 1 });
    }

    #[test]
    fn test_unannounced_client_departs_silently() {
        let (manager, sink) = manager_with(Arc::new(RssiThresholdPolicy::new(-50, 1, 0)));
        let fired = manager.register_detection(detection_at(DEVICE, -90, at(0))).unwrap();
        assert_eq!(fired, None);

        manager.registry().sweep_at(at(5000), 1000);

        assert!(sink.topics().is_empty());
        assert_eq!(manager.audit(), AuditSnapshot { new_events: 1, remove_events: 1 });
    }

    #[test]
    fn test_interleaved_devices_are_independent() {
        let (manager, sink) = manager_with(Arc::new(ImmediatePolicy));

        manager.register_detection(detection_at("AAAAAAAAAAAA", -60, at(0))).unwrap();
        manager.register_detection(detection_at("BBBBBBBBBBBB", -70, at(10))).unwrap();
        manager.register_detection(detection_at("AAAAAAAAAAAA", -61, at(20))).unwrap();
        manager.register_detection(detection_at("BBBBBBBBBBBB", -71, at(30))).unwrap();

        assert_eq!(
            sink.topics(),
            [
                (Topic::ClientIn, "AAAAAAAAAAAA".to_string()),
                (Topic::ClientIn, "BBBBBBBBBBBB".to_string())
            ]
        );
        let a = manager.registry().lookup("AAAAAAAAAAAA").unwrap();
        let b = manager.registry().lookup("BBBBBBBBBBBB").unwrap();
        assert_eq!(a.latest().rssi, -61);
        assert_eq!(b.latest().rssi, -71);
        assert_eq!(a.detections(), 2);
        assert_eq!(b.detections(), 2);
    }

    #[test]
    fn test_rssi_policy_arrival_then_signal_departure() {
        let (manager, sink) = manager_with(Arc::new(RssiThresholdPolicy::new(-70, 2, 2)));

        let rssi_sequence = [-80, -65, -60, -75, -90, -92, -60, -60];
        let fired: Vec<Option<Topic>> = rssi_sequence
            .iter()
            .zip(0..)
            .map(|(&rssi, step)| {
                manager
                    .register_detection(detection_at(DEVICE, rssi, at(step * 100)))
                    .unwrap()
            })
            .collect();

        assert_eq!(
            fired,
            [
                None,
                None,
                Some(Topic::ClientIn),
                None,
                Some(Topic::ClientOut),
                None,
                None,
                Some(Topic::ClientIn),
            ]
        );

        // Re-arrived, so the sweep announces the final departure.
        let client = manager.registry().lookup(DEVICE).unwrap();
        assert!(client.in_notified());
        manager.registry().sweep_at(at(10_000), 1000);
        assert_eq!(sink.topics().len(), 4);
        assert_eq!(sink.topics()[3].0, Topic::ClientOut);
    }

    #[test]
    fn test_departure_never_precedes_arrival() {
        let (manager, sink) = manager_with(Arc::new(RssiThresholdPolicy::new(-70, 3, 1)));

        for (i, rssi) in [-90, -60, -95, -60, -60, -60, -99, -99, -60].into_iter().enumerate() {
            let ms = i64::try_from(i).unwrap() * 100;
            manager.register_detection(detection_at(DEVICE, rssi, at(ms))).unwrap();
        }
        manager.registry().sweep_at(at(60_000), 1000);

        let mut announced = false;
        for (topic, _) in sink.topics() {
            match topic {
                Topic::ClientIn => {
                    assert!(!announced, "arrival repeated without departure");
                    announced = true;
                }
                Topic::ClientOut => {
                    assert!(announced, "departure without arrival");
                    announced = false;
                }
            }
        }
    }

    #[test]
    fn test_reappearance_after_sweep_is_a_new_episode() {
        let (manager, sink) = manager_with(Arc::new(ImmediatePolicy));
        manager.register_detection(detection_at(DEVICE, -60, at(0))).unwrap();
        manager.registry().sweep_at(at(5000), 1000);

        manager.register_detection(detection_at(DEVICE, -60, at(6000))).unwrap();

        let client = manager.registry().lookup(DEVICE).unwrap();
        assert_eq!(client.first_seen_at(), at(6000));
        assert_eq!(client.detections(), 1);
        assert_eq!(sink.topics().len(), 3);
        assert_eq!(manager.audit().new_events, 2);
    }

    #[test]
    fn test_audit_counter_wraps_past_limit() {
        let counter = AtomicU64::new(AUDIT_COUNTER_LIMIT);
        AuditCounters::bump(&counter);
        assert_eq!(counter.load(Ordering::Relaxed), AUDIT_COUNTER_LIMIT + 1);
        AuditCounters::bump(&counter);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_topic_serializes_to_wire_name() {
        assert_eq!(serde_json::to_string(&Topic::ClientIn).unwrap(), "\"clientIn\"");
        assert_eq!(Topic::ClientOut.to_string(), "clientOut");
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_and_survives_closed_channel() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = Arc::new(ChannelSink::new(tx));
        let registry = Arc::new(ClientRegistry::new());
        let manager = EventManager::new(identity(), registry, sink, Arc::new(ImmediatePolicy));

        manager.register_detection(detection_at(DEVICE, -60, at(0))).unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, Topic::ClientIn);

        drop(rx);
        manager.register_detection(detection_at("CCCCCCCCCCCC", -60, at(0))).unwrap();
        assert_eq!(manager.registry().len(), 2);
    }
}
