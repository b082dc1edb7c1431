//! # presence-core
//!
//! Core logic for a beacon presence collection point.
//!
//! A collection point listens for iBeacon advertisements, keeps a registry of
//! the clients it currently hears and announces each client's arrival
//! (`clientIn`) and departure (`clientOut`) exactly once per presence episode.
//!
//! ## Architecture
//!
//! - [`detection`] - Frame decoding and the major/minor beacon filter
//! - [`client`] - Per-beacon tracked state and notification flags
//! - [`registry`] - Thread-safe client registry with removal notifications
//! - [`policy`] - Pluggable arrival/departure decisions
//! - [`events`] - Lifecycle messages, sinks and audit counters
//! - [`source`] - Frame sources (replay captures, BlueZ, mocks)
//! - [`scanner`] / [`sweep`] - The scanning and expiry activities
//! - [`collection_point`] - Wiring and lifecycle of the three activities
//! - [`config`] - Layered configuration loading and validation
//! - [`error`] - Unified error types for the crate

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

#[cfg(feature = "bluetooth")]
pub mod bluetooth;
pub mod client;
pub mod collection_point;
pub mod config;
pub mod detection;
pub mod error;
pub mod events;
pub mod policy;
pub mod registry;
pub mod scanner;
pub mod source;
pub mod sweep;

// Re-export primary types for convenience
#[cfg(feature = "bluetooth")]
pub use bluetooth::BluezSource;
pub use client::TrackedClient;
pub use collection_point::{run_consumer, shutdown_requested, CollectionPoint};
pub use config::{
    default_config_path, CollectionPointConfig, ConfigError, ConfigResult, FilterConfig,
    PolicyConfig, PolicyKind, PresenceConfig, SourceConfig, SourceKind, SweepConfig,
};
pub use detection::{decode, BeaconFilter, Detection, RawFrame};
pub use error::{Error, PresenceError, Result};
pub use events::{
    AuditSnapshot, ChannelSink, CollectionPointIdentity, EventManager, EventSink,
    LifecycleMessage, Topic,
};
pub use policy::{ImmediatePolicy, PresencePolicy, RssiThresholdPolicy};
pub use registry::{ClientRegistry, RegistryError, RegistryObserver};
pub use scanner::{ScanStats, Scanner};
#[cfg(any(test, feature = "mock-bluetooth"))]
pub use source::MockSource;
pub use source::{ConfiguredSource, FrameSource, ReplaySource, SourceError, SourceResult};
pub use sweep::SweepScheduler;
