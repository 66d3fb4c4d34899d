//! Firmware version management

use serde::{Deserialize, Serialize};

/// Firmware version reported in the hardware information block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
}

/// Firmware version this driver is built against
pub const EXPECTED_FIRMWARE: FirmwareVersion = FirmwareVersion { major: 2, minor: 1 };

impl FirmwareVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Check if a device running `self` may be driven by a host expecting `expected`
    ///
    /// The command set changes between minor releases, so only an exact
    /// match is accepted.
    pub fn is_compatible_with(&self, expected: &FirmwareVersion) -> bool {
        self == expected
    }
}

impl Default for FirmwareVersion {
    fn default() -> Self {
        EXPECTED_FIRMWARE
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        let v1_2 = FirmwareVersion::new(1, 2);
        let v1_3 = FirmwareVersion::new(1, 3);
        let v2_3 = FirmwareVersion::new(2, 3);

        assert!(v1_3.is_compatible_with(&v1_3));
        assert!(!v1_2.is_compatible_with(&v1_3));
        assert!(!v1_3.is_compatible_with(&v1_2));
        assert!(!v2_3.is_compatible_with(&v1_3));
    }

    #[test]
    fn test_display() {
        assert_eq!(FirmwareVersion::new(2, 1).to_string(), "2.1");
    }
}
