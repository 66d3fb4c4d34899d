//! Driver error types

use protocol::{FirmwareVersion, ProtocolError};
use thiserror::Error;

/// Failure reported by a control channel or bulk endpoint
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Operation timed out")]
    Timeout,

    #[error("Endpoint stalled")]
    Pipe,

    #[error("Device disconnected")]
    NoDevice,

    #[error("Device or entity not found")]
    NotFound,

    #[error("Resource busy")]
    Busy,

    #[error("Buffer overflow")]
    Overflow,

    #[error("I/O error")]
    Io,

    #[error("Access denied")]
    Access,

    #[error("Submission rejected")]
    Rejected,

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

/// Errors returned by the driver
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Firmware mismatch: device runs {actual}, expected {expected}")]
    FirmwareMismatch {
        expected: FirmwareVersion,
        actual: FirmwareVersion,
    },

    #[error("Device session is closed")]
    SessionClosed,

    #[error("Streaming already active")]
    AlreadyStreaming,

    #[error("Streaming not active")]
    NotStreaming,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Ring buffer has {available} free slots, {needed} transfers requested")]
    InsufficientCapacity { needed: usize, available: usize },

    #[error("Streaming worker panicked")]
    WorkerPanicked,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for driver results
pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatch_display() {
        let err = DriverError::FirmwareMismatch {
            expected: FirmwareVersion::new(2, 1),
            actual: FirmwareVersion::new(1, 9),
        };
        assert_eq!(
            err.to_string(),
            "Firmware mismatch: device runs 1.9, expected 2.1"
        );
    }

    #[test]
    fn test_transport_conversion() {
        let err: DriverError = TransportError::Pipe.into();
        assert!(matches!(err, DriverError::Transport(TransportError::Pipe)));
    }
}
