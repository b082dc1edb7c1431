//! Collection point configuration.
//!
//! Configuration is layered with the `config` crate:
//!
//! 1. built-in defaults ([`PresenceConfig::default`])
//! 2. an optional TOML file
//! 3. `PRESENCE_*` environment variables, using `__` between nested keys
//!    (e.g. `PRESENCE_SWEEP__CLIENT_TIMEOUT_MS=60000`)
//!
//! The merged result is validated as a whole and every problem is reported.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::PresenceError;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "PRESENCE";

static COLLECTION_POINT_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]{0,63}$").expect("collection point id pattern is valid")
});

// =============================================================================
// ERRORS
// =============================================================================

/// Errors raised while loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("configuration file not found: {0}")]
    NotFound(String),

    /// The configuration file could not be written.
    #[error("failed to write {path}: {source}")]
    WriteError {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration source could not be parsed or merged.
    #[error("failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// The configuration could not be rendered as TOML.
    #[error("failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field holds an invalid value.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("{} configuration errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// =============================================================================
// SECTIONS
// =============================================================================

/// Identity of this collection point and queue sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionPointConfig {
    /// Sender id stamped on every lifecycle message.
    pub id: String,

    /// Sender type stamped on every lifecycle message.
    pub gateway_type: String,

    /// Delay before scanning starts, to let system services come up.
    pub startup_delay_ms: u64,

    /// Capacity of the detection queue between scanner and event manager.
    pub queue_capacity: usize,
}

impl Default for CollectionPointConfig {
    fn default() -> Self {
        Self {
            id: "collection-point".to_string(),
            gateway_type: "btle".to_string(),
            startup_delay_ms: 0,
            queue_capacity: 1024,
        }
    }
}

/// Inclusive major/minor acceptance window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Lowest accepted major.
    pub major_min: u16,
    /// Highest accepted major.
    pub major_max: u16,
    /// Lowest accepted minor.
    pub minor_min: u16,
    /// Highest accepted minor.
    pub minor_max: u16,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            major_min: 0,
            major_max: u16::MAX,
            minor_min: 0,
            minor_max: u16::MAX,
        }
    }
}

/// Staleness sweep timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// How often the sweep runs.
    pub interval_ms: u64,

    /// How long a client may go unheard before it is expired.
    pub client_timeout_ms: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            client_timeout_ms: 30_000,
        }
    }
}

/// Which presence policy drives arrivals and departures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Announce each new device once.
    #[default]
    Immediate,
    /// Debounce on signal strength.
    RssiThreshold,
}

/// Presence policy parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Policy selector.
    pub kind: PolicyKind,

    /// RSSI floor in dBm for the threshold policy.
    pub rssi_floor: i16,

    /// Consecutive samples at or above the floor needed to arrive.
    pub arrival_samples: usize,

    /// Consecutive samples below the floor needed to depart; 0 disables.
    pub departure_samples: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            kind: PolicyKind::Immediate,
            rssi_floor: -90,
            arrival_samples: 1,
            departure_samples: 0,
        }
    }
}

/// Which raw frame source feeds the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Live scanning through BlueZ.
    #[default]
    Bluez,
    /// Replay of a recorded JSON-lines capture.
    Replay,
}

/// Raw frame source selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Source selector.
    pub kind: SourceKind,

    /// Bluetooth adapter name (e.g. `hci0`); the default adapter if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,

    /// Capture file for the replay source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_path: Option<PathBuf>,
}

/// Complete collection point configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Identity and queueing.
    pub collection_point: CollectionPointConfig,
    /// Major/minor acceptance window.
    pub filter: FilterConfig,
    /// Staleness sweep.
    pub sweep: SweepConfig,
    /// Arrival/departure policy.
    pub policy: PolicyConfig,
    /// Raw frame source.
    pub source: SourceConfig,
}

impl PresenceConfig {
    /// Load configuration from `path` (if it exists) and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the merged
    /// configuration is invalid.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let defaults = config::Config::try_from(&Self::default())?;

        let merged = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = merged.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Load `path`, first writing the defaults there if no file exists.
    ///
    /// Failing to write the defaults is logged and otherwise ignored.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if loading or validation fails.
    pub fn load_or_init(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            match Self::default().save(path) {
                Ok(()) => info!(path = %path.display(), "Wrote default configuration"),
                Err(err) => {
                    let err = PresenceError::from(err);
                    warn!(
                        code = err.error_code(),
                        error = %err,
                        "Could not write default configuration"
                    );
                }
            }
        }
        Ok(Self::load(path)?)
    }

    /// Parse and validate a TOML document, without consulting the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be parsed or is invalid.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let defaults = config::Config::try_from(&Self::default())?;
        let merged = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?;

        let parsed: Self = merged.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Write this configuration to `path` as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.display().to_string(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.display().to_string(),
            source,
        })
    }

    /// Check every field and collect all problems.
    ///
    /// # Errors
    ///
    /// Returns a single [`ConfigError::ValidationError`] or, if several fields
    /// are invalid, [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if !COLLECTION_POINT_ID.is_match(&self.collection_point.id) {
            errors.push(ConfigError::invalid(
                "collection_point.id",
                format!(
                    "'{}' must be 1-64 characters of letters, digits, '_', '.', ':' or '-'",
                    self.collection_point.id
                ),
            ));
        }
        if self.collection_point.gateway_type.trim().is_empty() {
            errors.push(ConfigError::invalid(
                "collection_point.gateway_type",
                "must not be empty",
            ));
        }
        if self.collection_point.queue_capacity == 0 {
            errors.push(ConfigError::invalid(
                "collection_point.queue_capacity",
                "must be at least 1",
            ));
        }
        if self.filter.major_min > self.filter.major_max {
            errors.push(ConfigError::invalid(
                "filter.major_min",
                "must not exceed filter.major_max",
            ));
        }
        if self.filter.minor_min > self.filter.minor_max {
            errors.push(ConfigError::invalid(
                "filter.minor_min",
                "must not exceed filter.minor_max",
            ));
        }
        if self.sweep.interval_ms == 0 {
            errors.push(ConfigError::invalid("sweep.interval_ms", "must be at least 1"));
        }
        if self.sweep.client_timeout_ms == 0 {
            errors.push(ConfigError::invalid(
                "sweep.client_timeout_ms",
                "must be at least 1",
            ));
        }
        if !(-127..=20).contains(&self.policy.rssi_floor) {
            errors.push(ConfigError::invalid(
                "policy.rssi_floor",
                "must be between -127 and 20 dBm",
            ));
        }
        if self.policy.arrival_samples == 0 {
            errors.push(ConfigError::invalid(
                "policy.arrival_samples",
                "must be at least 1",
            ));
        }
        if self.source.kind == SourceKind::Replay && self.source.replay_path.is_none() {
            errors.push(ConfigError::invalid(
                "source.replay_path",
                "is required when source.kind = \"replay\"",
            ));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

/// Default configuration file location.
///
/// On Linux: `/etc/presence/config.toml`.
/// Elsewhere: the platform configuration directory.
///
/// # Errors
///
/// Returns an error if no home directory can be determined.
pub fn default_config_path() -> ConfigResult<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/presence/config.toml"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let dirs = directories::ProjectDirs::from("", "", "presence")
            .ok_or_else(|| ConfigError::NotFound("configuration directory".into()))?;
        Ok(dirs.config_dir().join("config.toml"))
    }
}
