//! Custom error types for the application.
//!
//! This module defines the primary error type, `RigError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur, from configuration and I/O issues to
//! controller-specific problems.
//!
//! ## Error Hierarchy
//!
//! - **`DeviceOpenError`**: a serial endpoint could not be opened (busy, missing,
//!   permission denied). Device-fatal for that endpoint only.
//! - **`ProtocolError`**: an inbound telemetry line could not be decoded, or an outbound
//!   command was rejected at the protocol boundary. Inbound decode failures are
//!   transient: the line is logged and dropped.
//! - **`RigError`**: everything else, with `#[from]` conversions so `?` works across
//!   module boundaries.

use crate::device::{DeviceId, DeviceState};
use crate::run_state::{RunCommand, RunStateKind};
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, RigError>;

/// Failure to open a serial endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceOpenError {
    /// Held by another process
    #[error("Serial port '{0}' is busy")]
    Busy(String),

    /// No such endpoint
    #[error("Serial port '{0}' not found")]
    NotFound(String),

    /// The OS refused access
    #[error("Permission denied opening serial port '{0}'")]
    PermissionDenied(String),

    /// Any other open failure
    #[error("Failed to open serial port '{port}': {reason}")]
    Other {
        /// Port name
        port: String,
        /// Driver message
        reason: String,
    },
}

impl DeviceOpenError {
    /// Port name the failure refers to.
    pub fn port(&self) -> &str {
        match self {
            Self::Busy(port) | Self::NotFound(port) | Self::PermissionDenied(port) => port,
            Self::Other { port, .. } => port,
        }
    }

    /// Classify a `serialport` failure for `port`.
    #[cfg(feature = "instrument_serial")]
    pub fn from_serialport(port: &str, err: &serialport::Error) -> Self {
        use serialport::ErrorKind;

        let port = port.to_string();
        let description = err.description.to_lowercase();
        if description.contains("busy") {
            return Self::Busy(port);
        }
        match err.kind() {
            ErrorKind::NoDevice => Self::NotFound(port),
            ErrorKind::Io(std::io::ErrorKind::NotFound) => Self::NotFound(port),
            ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => Self::PermissionDenied(port),
            _ => Self::Other {
                port,
                reason: err.description.clone(),
            },
        }
    }
}

/// Wire-level protocol errors, both directions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Not a JSON object
    #[error("Malformed telemetry line: {0}")]
    Malformed(String),

    /// A required key is absent
    #[error("Telemetry sample missing required field '{0}'")]
    MissingField(&'static str),

    /// Present but not numeric
    #[error("Telemetry field '{0}' has an invalid value")]
    InvalidField(&'static str),

    /// Not finite or outside 0-100 %
    #[error("Duty cycle {0}% is outside the 0-100% range")]
    DutyCycleOutOfRange(f64),

    /// Serialization of an outbound message failed
    #[error("Failed to encode control message: {0}")]
    Encode(String),
}

/// Application-wide error.
#[derive(Error, Debug)]
pub enum RigError {
    /// Config file or env could not be read
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Config loaded but failed validation
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Serial or file I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An endpoint could not be opened
    #[error(transparent)]
    DeviceOpen(#[from] DeviceOpenError),

    /// Wire format violation
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No open device with that id
    #[error("Unknown device '{0}'")]
    UnknownDevice(DeviceId),

    /// Closed or faulted
    #[error("Device '{device}' is unavailable ({state})")]
    DeviceUnavailable {
        /// Device addressed
        device: DeviceId,
        /// Its state at the time
        state: DeviceState,
    },

    /// Command not allowed in the current run state
    #[error("Cannot apply {command} while {from}")]
    InvalidTransition {
        /// State the command was applied in
        from: RunStateKind,
        /// Rejected command
        command: RunCommand,
    },

    /// Built without `instrument_serial`
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    /// Built without the named cargo feature
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// CSV read or write failure
    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The consumer context is gone
    #[error("Dispatch bridge has shut down")]
    BridgeClosed,

    /// A spawned task panicked or could not start
    #[error("Background task failed: {0}")]
    TaskFailed(String),

    /// Every error collected during shutdown
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<RigError>),
}

impl From<figment::Error> for RigError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RigError::UnknownDevice(DeviceId::new("ttyACM3"));
        assert_eq!(err.to_string(), "Unknown device 'ttyACM3'");
    }

    #[test]
    fn test_open_error_reports_port() {
        let err: RigError = DeviceOpenError::PermissionDenied("/dev/ttyACM0".into()).into();
        assert_eq!(
            err.to_string(),
            "Permission denied opening serial port '/dev/ttyACM0'"
        );
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = RigError::InvalidTransition {
            from: RunStateKind::Idle,
            command: RunCommand::Pause,
        };
        assert_eq!(err.to_string(), "Cannot apply pause while idle");
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = RigError::ShutdownFailed(vec![
            RigError::BridgeClosed,
            RigError::Configuration("bad".into()),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }
}
