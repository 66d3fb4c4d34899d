//! Control request types
//!
//! These types describe a single vendor control request: the command code,
//! the two 16-bit addressing fields (`wValue`/`wIndex`) and the payload.

use crate::command::Command;
use crate::version::FirmwareVersion;
use serde::{Deserialize, Serialize};

/// `bmRequestType` for vendor requests, host to device
pub const VENDOR_OUT: u8 = 0x40;

/// `bmRequestType` for vendor requests, device to host
pub const VENDOR_IN: u8 = 0xC0;

/// Size of the hardware information block returned by [`Command::Test`]
pub const HARDWARE_INFO_LEN: usize = 4;

/// The `wValue`/`wIndex` pair of a control request
///
/// The firmware uses these fields for sub-addressing: argument id and value
/// for `SetArgument`, bus and register address for the I2C proxy, trace
/// stream selector for `ReadDebugInfo`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Addressing {
    pub value: u16,
    pub index: u16,
}

impl Addressing {
    /// Addressing with both fields cleared
    pub const ZERO: Addressing = Addressing { value: 0, index: 0 };

    pub fn new(value: u16, index: u16) -> Self {
        Self { value, index }
    }
}

/// Setup stage of one control request as handed to the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub command: Command,
    pub addressing: Addressing,
}

impl ControlSetup {
    pub fn new(command: Command, addressing: Addressing) -> Self {
        Self {
            command,
            addressing,
        }
    }

    /// `bmRequestType` matching the command direction
    pub fn request_type(&self) -> u8 {
        if self.command.is_device_to_host() {
            VENDOR_IN
        } else {
            VENDOR_OUT
        }
    }
}

/// Payload of a firmware command
///
/// Commands carry exactly one native integer, serialized little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    U8(u8),
    U32(u32),
    U64(u64),
}

impl Payload {
    /// Encoded length in bytes (1, 4 or 8)
    pub fn len(&self) -> usize {
        match self {
            Payload::U8(_) => 1,
            Payload::U32(_) => 4,
            Payload::U64(_) => 8,
        }
    }

    /// Payloads are never empty
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl From<u8> for Payload {
    fn from(v: u8) -> Self {
        Payload::U8(v)
    }
}

impl From<u32> for Payload {
    fn from(v: u32) -> Self {
        Payload::U32(v)
    }
}

impl From<u64> for Payload {
    fn from(v: u64) -> Self {
        Payload::U64(v)
    }
}

/// Hardware information block: `[reserved, major, minor, reserved]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareInfo {
    /// Byte 0, hardware model on current firmware
    pub model: u8,
    pub firmware: FirmwareVersion,
    /// Byte 3, reserved
    pub reserved: u8,
}
