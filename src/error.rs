//! Error types for the force stage driver.
//!
//! Every operation returns [`DriverResult`]. The variants map one-to-one onto the
//! failure classes a caller has to tell apart:
//!
//! - **`Io`**: the transport itself failed (port closed, OS error). The port should be
//!   considered unusable until it is reopened.
//! - **`Timeout`**: no line arrived within the configured read window. Recoverable; the
//!   next exchange drains the input buffer first.
//! - **`DeviceFault`**: the instrument answered with an `[ERROR]` line. The text is kept
//!   verbatim.
//! - **`Decode`**: a non-fault line did not have the shape the command expects. Never
//!   coerced to a default value.
//! - **`OutOfRange`**: a requested position violates the configured motion limits. Raised
//!   before any byte is written.
//! - **`Busy`**: another exchange or streaming session currently owns the port.
//!
//! A failed streaming session is reported as [`DriverError::StreamInterrupted`], which
//! carries the cause together with the samples decoded before the failure.

use crate::reading::Reading;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Coarse classification of a [`DriverError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Transport failure
    Io,
    /// No line within the read timeout
    Timeout,
    /// `[ERROR]` reply from the device
    DeviceFault,
    /// Reply did not have the expected shape
    Decode,
    /// Position outside the travel limits
    OutOfRange,
    /// Another exchange holds the port
    Busy,
    /// Argument rejected before sending
    InvalidArgument,
    /// Calibration procedure failed
    Calibration,
    /// Bad configuration or logging setup
    Configuration,
    /// Command not in the selected protocol revision
    Unsupported,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Io => "io",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::DeviceFault => "device_fault",
            DriverErrorKind::Decode => "decode",
            DriverErrorKind::OutOfRange => "out_of_range",
            DriverErrorKind::Busy => "busy",
            DriverErrorKind::InvalidArgument => "invalid_argument",
            DriverErrorKind::Calibration => "calibration",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Unsupported => "unsupported",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for the force stage driver.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Transport-level failure.
    ///
    /// **Recovery Strategy**: close and reopen the port; the driver does not retry.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No response line within the configured read timeout.
    ///
    /// **Recovery Strategy**: the input buffer is drained automatically before the next
    /// exchange. Whether the link is still usable is the caller's decision.
    #[error("No response within {waited:?}")]
    Timeout {
        /// Read window that elapsed.
        waited: Duration,
    },

    /// The device answered with an `[ERROR]` line.
    #[error("Device fault: {0}")]
    DeviceFault(String),

    /// A response was present but did not have the expected shape.
    #[error("Cannot decode {command} response '{line}': {reason}")]
    Decode {
        /// Mnemonic of the command whose response failed to decode.
        command: String,
        /// The offending line, trimmed.
        line: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Requested stage position is outside the configured motion limits.
    #[error("Position {position} mm outside travel limits [{min}, {max}] mm")]
    OutOfRange {
        /// Requested position.
        position: i64,
        /// Lower travel limit.
        min: i64,
        /// Upper travel limit.
        max: i64,
    },

    /// The port is owned by another exchange or a streaming session.
    #[error("Port busy: another exchange is in flight")]
    Busy,

    /// A frame argument cannot be rendered on the wire.
    #[error("Invalid command argument: {0}")]
    InvalidArgument(String),

    /// A calibration procedure or setter produced an unusable value.
    #[error("Calibration error: {0}")]
    Calibration(String),

    /// Configuration values parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration sources could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The mnemonic is not part of the selected protocol revision.
    #[error("Command '{command}' is not supported by the {revision} protocol revision")]
    Unsupported {
        /// Requested mnemonic.
        command: String,
        /// Name of the active revision.
        revision: &'static str,
    },

    /// A streaming session ended early.
    ///
    /// `partial` holds every sample decoded before `source` occurred, in arrival order.
    #[error("Streaming session interrupted after {} samples: {source}", .partial.len())]
    StreamInterrupted {
        /// What ended the session.
        source: Box<DriverError>,
        /// Samples received before the failure.
        partial: Vec<Reading>,
    },
}

impl From<figment::Error> for DriverError {
    fn from(err: figment::Error) -> Self {
        DriverError::Config(Box::new(err))
    }
}

impl DriverError {
    /// Build a [`DriverError::Decode`] for `command`.
    pub fn decode(command: &str, line: &str, reason: impl Into<String>) -> Self {
        DriverError::Decode {
            command: command.to_string(),
            line: line.to_string(),
            reason: reason.into(),
        }
    }

    /// Classify the error. A streaming interruption reports the kind of its cause.
    pub fn kind(&self) -> DriverErrorKind {
        match self {
            DriverError::Io(_) => DriverErrorKind::Io,
            DriverError::Timeout { .. } => DriverErrorKind::Timeout,
            DriverError::DeviceFault(_) => DriverErrorKind::DeviceFault,
            DriverError::Decode { .. } => DriverErrorKind::Decode,
            DriverError::OutOfRange { .. } => DriverErrorKind::OutOfRange,
            DriverError::Busy => DriverErrorKind::Busy,
            DriverError::InvalidArgument(_) => DriverErrorKind::InvalidArgument,
            DriverError::Calibration(_) => DriverErrorKind::Calibration,
            DriverError::Configuration(_) | DriverError::Config(_) => {
                DriverErrorKind::Configuration
            }
            DriverError::Unsupported { .. } => DriverErrorKind::Unsupported,
            DriverError::StreamInterrupted { source, .. } => source.kind(),
        }
    }

    /// True for read timeouts, including a timed-out streaming session.
    pub fn is_timeout(&self) -> bool {
        self.kind() == DriverErrorKind::Timeout
    }

    /// Samples salvaged from an interrupted streaming session, if any.
    pub fn partial_readings(&self) -> Option<&[Reading]> {
        match self {
            DriverError::StreamInterrupted { partial, .. } => Some(partial),
            _ => None,
        }
    }

    /// Consume the error and take the salvaged samples.
    pub fn into_partial_readings(self) -> Option<Vec<Reading>> {
        match self {
            DriverError::StreamInterrupted { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_interruption_reports_cause_kind() {
        let err = DriverError::StreamInterrupted {
            source: Box::new(DriverError::Timeout {
                waited: Duration::from_millis(50),
            }),
            partial: vec![Reading::new(0, 1.0)],
        };
        assert!(err.is_timeout());
        assert_eq!(err.kind(), DriverErrorKind::Timeout);
        assert_eq!(err.partial_readings().map(|p| p.len()), Some(1));
        assert!(err.to_string().contains("after 1 samples"));
    }

    #[test]
    fn plain_errors_have_no_partial_data() {
        let err = DriverError::DeviceFault("[ERROR]: stage fault".into());
        assert_eq!(err.kind(), DriverErrorKind::DeviceFault);
        assert!(err.partial_readings().is_none());
        assert!(!err.is_timeout());
    }

    #[test]
    fn out_of_range_message_names_limits() {
        let err = DriverError::OutOfRange {
            position: 50,
            min: 1,
            max: 46,
        };
        assert_eq!(
            err.to_string(),
            "Position 50 mm outside travel limits [1, 46] mm"
        );
    }
}
