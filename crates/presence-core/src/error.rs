//! Unified error types for the presence core library.
//!
//! Each module raises its own specific error ([`ConfigError`], [`RegistryError`],
//! [`SourceError`]); they are folded into [`PresenceError`] at module
//! boundaries so callers only handle one type.
//!
//! # Severity
//!
//! - **Fatal**: registry contract violations. The insert/update split is
//!   decided under the registry lock, so these indicate a bug and must stop
//!   the collection point rather than let state drift.
//! - **Configuration**: reported once at startup.
//! - **Source**: the radio or capture is unavailable; a restart may help.
//!
//! Malformed advertisements are not errors at all; the decoder defaults them.
//!
//! [`ConfigError`]: crate::config::ConfigError
//! [`RegistryError`]: crate::registry::RegistryError
//! [`SourceError`]: crate::source::SourceError

use std::path::PathBuf;
use thiserror::Error;

/// The unified error type for all presence operations.
#[derive(Debug, Error)]
pub enum PresenceError {
    // =========================================================================
    // REGISTRY CONTRACT VIOLATIONS
    // =========================================================================
    /// A new client was inserted for an id that is already tracked.
    #[error("Registry contract violated: client '{0}' is already registered")]
    ClientAlreadyRegistered(String),

    /// An update was issued for an id that is not tracked.
    #[error("Registry contract violated: client '{0}' is not registered")]
    ClientNotRegistered(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// A configuration source could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // FRAME SOURCE ERRORS
    // =========================================================================
    /// No Bluetooth adapter was found on this system.
    #[error(
        "No Bluetooth adapter found. Ensure Bluetooth hardware is present and bluetoothd is running."
    )]
    BluetoothAdapterNotFound,

    /// Scanning could not be started or failed while running.
    #[error("Bluetooth scan failed: {0}")]
    BluetoothScanFailed(String),

    /// A replay capture could not be read or parsed.
    #[error("Replay capture error: {0}")]
    ReplayError(String),

    /// The configured source is not compiled into this build.
    #[error("Frame source '{0}' is not available in this build. Rebuild with the matching feature.")]
    SourceUnsupported(&'static str),

    // =========================================================================
    // RUNTIME & I/O ERRORS
    // =========================================================================
    /// A background task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    TaskFailed(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for presence operations.
pub type Result<T> = std::result::Result<T, PresenceError>;

/// Short alias for [`PresenceError`].
pub type Error = PresenceError;

impl PresenceError {
    /// Returns `true` for registry contract violations, which must stop processing.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ClientAlreadyRegistered(_) | Self::ClientNotRegistered(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error came from a frame source.
    #[inline]
    #[must_use]
    pub const fn is_source_error(&self) -> bool {
        matches!(
            self,
            Self::BluetoothAdapterNotFound
                | Self::BluetoothScanFailed(_)
                | Self::ReplayError(_)
                | Self::SourceUnsupported(_)
        )
    }

    /// Returns `true` if restarting the collection point may clear the error.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BluetoothScanFailed(_) | Self::TaskFailed(_) | Self::IoError(_)
        )
    }

    /// Operator guidance for errors that usually come from setup, if any.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        match self {
            Self::SourceUnsupported(_) => Some(
                "rebuild with `--features bluetooth`, or set [source] kind = \"replay\" and a replay_path",
            ),
            Self::BluetoothAdapterNotFound => {
                Some("check that bluetoothd is running and the adapter is not blocked by rfkill")
            }
            _ if self.is_config_error() => {
                Some("check the configuration file and any PRESENCE_* environment overrides")
            }
            _ if self.is_source_error() => Some("check the [source] section of the configuration"),
            _ => None,
        }
    }

    /// Returns a machine-readable error code for logs and exit reports.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ClientAlreadyRegistered(_) => "CLIENT_ALREADY_REGISTERED",
            Self::ClientNotRegistered(_) => "CLIENT_NOT_REGISTERED",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::BluetoothAdapterNotFound => "BLUETOOTH_ADAPTER_NOT_FOUND",
            Self::BluetoothScanFailed(_) => "BLUETOOTH_SCAN_FAILED",
            Self::ReplayError(_) => "REPLAY_ERROR",
            Self::SourceUnsupported(_) => "SOURCE_UNSUPPORTED",
            Self::TaskFailed(_) => "TASK_FAILED",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::registry::RegistryError> for PresenceError {
    fn from(err: crate::registry::RegistryError) -> Self {
        use crate::registry::RegistryError;
        match err {
            RegistryError::AlreadyRegistered { device_id } => {
                Self::ClientAlreadyRegistered(device_id)
            }
            RegistryError::NotRegistered { device_id } => Self::ClientNotRegistered(device_id),
        }
    }
}

impl From<crate::config::ConfigError> for PresenceError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path.into()),
            ConfigError::WriteError { path, source } => Self::IoError(std::io::Error::new(
                source.kind(),
                format!("Failed to write {path}: {source}"),
            )),
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::source::SourceError> for PresenceError {
    fn from(err: crate::source::SourceError) -> Self {
        use crate::source::SourceError;
        match err {
            SourceError::AdapterNotFound => Self::BluetoothAdapterNotFound,
            SourceError::SessionInitFailed { message } | SourceError::DiscoveryFailed { message } => {
                Self::BluetoothScanFailed(message)
            }
            err @ (SourceError::ReplayRead { .. } | SourceError::ReplayParse { .. }) => {
                Self::ReplayError(err.to_string())
            }
            SourceError::Unsupported { kind } => Self::SourceUnsupported(kind),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::registry::RegistryError;
    use crate::source::SourceError;
    use std::io::{Error as IoErr, ErrorKind};

    #[test]
    fn test_registry_errors_are_fatal() {
        let err: PresenceError = RegistryError::NotRegistered {
            device_id: "AABBCCDDEEFF".into(),
        }
        .into();
        assert!(err.is_fatal());
        assert!(matches!(err, PresenceError::ClientNotRegistered(ref id) if id == "AABBCCDDEEFF"));

        let err: PresenceError = RegistryError::AlreadyRegistered {
            device_id: "AA".into(),
        }
        .into();
        assert_eq!(err.error_code(), "CLIENT_ALREADY_REGISTERED");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_config_error_classification() {
        assert!(PresenceError::ConfigNotFound(PathBuf::from("/test")).is_config_error());
        assert!(PresenceError::ConfigParseError("syntax error".into()).is_config_error());
        assert!(!PresenceError::BluetoothAdapterNotFound.is_config_error());
    }

    #[test]
    fn test_multiple_validation_errors_are_joined() {
        let err: PresenceError = ConfigError::MultipleValidationErrors(vec![
            ConfigError::ValidationError {
                field: "sweep.interval_ms".into(),
                message: "must be at least 1".into(),
            },
            ConfigError::ValidationError {
                field: "filter.major_min".into(),
                message: "must not exceed filter.major_max".into(),
            },
        ])
        .into();

        let PresenceError::ConfigValidationError(message) = err else {
            panic!("expected a validation error");
        };
        assert_eq!(
            message,
            "sweep.interval_ms: must be at least 1; filter.major_min: must not exceed filter.major_max"
        );
    }

    #[test]
    fn test_source_error_conversion() {
        let err: PresenceError = SourceError::ReplayParse {
            line: 3,
            message: "bad hex".into(),
        }
        .into();
        assert!(err.is_source_error());
        assert!(err.to_string().contains("line 3"));

        let err: PresenceError = SourceError::Unsupported { kind: "bluez" }.into();
        assert_eq!(err.error_code(), "SOURCE_UNSUPPORTED");

        let err: PresenceError = SourceError::DiscoveryFailed {
            message: "org.bluez.Error.NotReady".into(),
        }
        .into();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_unsupported_source_hints_at_feature() {
        let err: PresenceError = SourceError::Unsupported { kind: "bluez" }.into();
        assert!(err.hint().unwrap().contains("--features bluetooth"));

        let err: PresenceError = ConfigError::ValidationError {
            field: "sweep.interval_ms".into(),
            message: "must be at least 1".into(),
        }
        .into();
        assert!(err.hint().unwrap().contains("PRESENCE_*"));

        assert!(PresenceError::TaskFailed("panicked".into()).hint().is_none());
    }

    #[test]
    fn test_write_error_becomes_io_error() {
        let err: PresenceError = ConfigError::WriteError {
            path: "/etc/presence/config.toml".into(),
            source: IoErr::new(ErrorKind::PermissionDenied, "denied"),
        }
        .into();
        let PresenceError::IoError(ref io) = err else {
            panic!("expected an I/O error");
        };
        assert_eq!(io.kind(), ErrorKind::PermissionDenied);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_from_io_error() {
        let err: PresenceError = IoErr::new(ErrorKind::NotFound, "file not found").into();
        assert!(matches!(err, PresenceError::IoError(_)));
        assert_eq!(err.error_code(), "IO_ERROR");
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<PresenceError>();
        assert_sync::<PresenceError>();
    }
}
