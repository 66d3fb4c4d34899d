//! Payload and hardware-info encoding
//!
//! Control payloads are raw native integers in little-endian byte order.
//! The hardware information block is four bytes,
//! `[model, major, minor, reserved]`.

use crate::error::{ProtocolError, Result};
use crate::types::{HARDWARE_INFO_LEN, HardwareInfo, Payload};
use crate::version::FirmwareVersion;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Encode a command payload to its wire representation
pub fn encode_payload(payload: Payload) -> Vec<u8> {
    match payload {
        Payload::U8(v) => vec![v],
        Payload::U32(v) => v.to_le_bytes().to_vec(),
        Payload::U64(v) => v.to_le_bytes().to_vec(),
    }
}

/// Decode a command payload from its wire representation
///
/// The width is taken from the slice length.
pub fn decode_payload(bytes: &[u8]) -> Result<Payload> {
    let mut cursor = Cursor::new(bytes);
    let payload = match bytes.len() {
        1 => Payload::U8(cursor.read_u8()?),
        4 => Payload::U32(cursor.read_u32::<LittleEndian>()?),
        8 => Payload::U64(cursor.read_u64::<LittleEndian>()?),
        other => return Err(ProtocolError::InvalidPayloadLength(other)),
    };
    Ok(payload)
}

/// Decode the response to [`crate::Command::Test`]
pub fn decode_hardware_info(bytes: &[u8]) -> Result<HardwareInfo> {
    if bytes.len() < HARDWARE_INFO_LEN {
        return Err(ProtocolError::BufferTooSmall {
            needed: HARDWARE_INFO_LEN,
            available: bytes.len(),
        });
    }

    Ok(HardwareInfo {
        model: bytes[0],
        firmware: FirmwareVersion::new(bytes[1], bytes[2]),
        reserved: bytes[3],
    })
}

/// Encode a hardware information block, as the firmware would send it
pub fn encode_hardware_info(info: &HardwareInfo) -> [u8; HARDWARE_INFO_LEN] {
    [
        info.model,
        info.firmware.major,
        info.firmware.minor,
        info.reserved,
    ]
}

/// Check that a device's firmware matches the expected version exactly
pub fn validate_firmware(info: &HardwareInfo, expected: &FirmwareVersion) -> Result<()> {
    if !info.firmware.is_compatible_with(expected) {
        return Err(ProtocolError::IncompatibleFirmware {
            major: info.firmware.major,
            minor: info.firmware.minor,
            expected_major: expected.major,
            expected_minor: expected.minor,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_is_little_endian() {
        assert_eq!(encode_payload(Payload::U8(0x5a)), vec![0x5a]);
        assert_eq!(
            encode_payload(Payload::U32(0x1234_5678)),
            vec![0x78, 0x56, 0x34, 0x12]
        );
        assert_eq!(
            encode_payload(Payload::U64(0x0102_0304_0506_0708)),
            vec![0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn test_decode_payload_rejects_odd_widths() {
        assert!(matches!(
            decode_payload(&[0, 0, 0]),
            Err(ProtocolError::InvalidPayloadLength(3))
        ));
        assert!(matches!(
            decode_payload(&[]),
            Err(ProtocolError::InvalidPayloadLength(0))
        ));
        assert_eq!(
            decode_payload(&[0x00, 0x80, 0x00, 0x00]).unwrap(),
            Payload::U32(0x8000)
        );
    }

    #[test]
    fn test_decode_hardware_info() {
        let info = decode_hardware_info(&[0x04, 2, 1, 0xff]).unwrap();
        assert_eq!(info.model, 0x04);
        assert_eq!(info.firmware, FirmwareVersion::new(2, 1));
        assert_eq!(info.reserved, 0xff);
    }

    #[test]
    fn test_decode_hardware_info_short() {
        let err = decode_hardware_info(&[0x04, 2]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::BufferTooSmall {
                needed: 4,
                available: 2
            }
        ));
    }

    #[test]
    fn test_validate_firmware() {
        let info = HardwareInfo {
            model: 0,
            firmware: FirmwareVersion::new(1, 2),
            reserved: 0,
        };
        assert!(validate_firmware(&info, &FirmwareVersion::new(1, 2)).is_ok());
        assert!(matches!(
            validate_firmware(&info, &FirmwareVersion::new(1, 3)),
            Err(ProtocolError::IncompatibleFirmware {
                major: 1,
                minor: 2,
                expected_major: 1,
                expected_minor: 3
            })
        ));
    }
}
