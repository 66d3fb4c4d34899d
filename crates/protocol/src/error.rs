//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Command code not part of the firmware vocabulary
    #[error("Unknown command code: {0:#04x}")]
    UnknownCommand(u8),

    /// Payload length other than 1, 4 or 8 bytes
    #[error("Invalid payload length: {0} (expected 1, 4 or 8)")]
    InvalidPayloadLength(usize),

    /// Firmware version differs from the one the host was built for
    #[error(
        "Incompatible firmware version: {major}.{minor} (expected {expected_major}.{expected_minor})"
    )]
    IncompatibleFirmware {
        major: u8,
        minor: u8,
        expected_major: u8,
        expected_minor: u8,
    },

    /// Buffer too small for operation
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// I/O error while encoding or decoding
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
