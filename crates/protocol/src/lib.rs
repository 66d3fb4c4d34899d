//! Control protocol for the FX3 streamer firmware
//!
//! This crate defines the vocabulary spoken on the device's control endpoint:
//! vendor command codes, the `wValue`/`wIndex` addressing fields, the 1/4/8
//! byte little-endian payloads and the 4-byte hardware information block used
//! for the firmware version handshake.
//!
//! # Example
//!
//! ```
//! use protocol::{Payload, decode_hardware_info, encode_payload, EXPECTED_FIRMWARE};
//!
//! // A 4-byte argument, as sent with the StartAdc command
//! let bytes = encode_payload(Payload::U32(64_000_000));
//! assert_eq!(bytes.len(), 4);
//!
//! // The hardware info block returned by the Test command
//! let info = decode_hardware_info(&[0x04, EXPECTED_FIRMWARE.major, EXPECTED_FIRMWARE.minor, 0]).unwrap();
//! assert!(info.firmware.is_compatible_with(&EXPECTED_FIRMWARE));
//! ```

pub mod codec;
pub mod command;
pub mod error;
pub mod types;
pub mod version;

pub use codec::{
    decode_hardware_info, decode_payload, encode_hardware_info, encode_payload, validate_firmware,
};
pub use command::Command;
pub use error::{ProtocolError, Result};
pub use types::{
    Addressing, ControlSetup, HARDWARE_INFO_LEN, HardwareInfo, Payload, VENDOR_IN, VENDOR_OUT,
};
pub use version::{EXPECTED_FIRMWARE, FirmwareVersion};

/// Cypress vendor id
pub const VENDOR_ID: u16 = 0x04B4;

/// Product id while the streamer firmware is running
pub const STREAMER_PRODUCT_ID: u16 = 0x00F1;

/// Product id while only the FX3 bootloader is running
pub const BOOTLOADER_PRODUCT_ID: u16 = 0x00F3;
