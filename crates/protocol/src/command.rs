//! Firmware command vocabulary
//!
//! Every control request sent to the streamer firmware carries one of these
//! codes in the `bRequest` field of the setup packet.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Vendor command understood by the streamer firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Command {
    /// Start the bulk data stream
    Start = 0xAA,
    /// Stop the bulk data stream
    Stop = 0xAB,
    /// Read the 4-byte hardware information block
    Test = 0xAC,
    /// Drive the GPIO register (4-byte payload)
    Gpio = 0xAD,
    /// Write bytes on the proxied I2C bus
    I2cWrite = 0xAE,
    /// Read bytes from the proxied I2C bus
    I2cRead = 0xAF,
    /// Reset the FX3 back into the bootloader
    Reset = 0xB1,
    /// Start the ADC sampling clock (frequency in Hz, 4-byte payload)
    StartAdc = 0xB2,
    /// Read firmware statistics
    GetStats = 0xB3,
    /// Initialise the tuner (reference frequency, 4-byte payload)
    TunerInit = 0xB4,
    /// Tune the tuner (frequency in Hz, 8-byte payload)
    TunerTune = 0xB5,
    /// Set a configuration argument through the addressing fields
    SetArgument = 0xB6,
    /// Put the tuner into standby
    TunerStandby = 0xB8,
    /// Read a firmware debug trace stream
    ReadDebugInfo = 0xBA,
}

impl Command {
    /// Raw request code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether the command transfers data from the device to the host
    pub fn is_device_to_host(self) -> bool {
        matches!(
            self,
            Command::Test | Command::I2cRead | Command::GetStats | Command::ReadDebugInfo
        )
    }
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        let command = match code {
            0xAA => Command::Start,
            0xAB => Command::Stop,
            0xAC => Command::Test,
            0xAD => Command::Gpio,
            0xAE => Command::I2cWrite,
            0xAF => Command::I2cRead,
            0xB1 => Command::Reset,
            0xB2 => Command::StartAdc,
            0xB3 => Command::GetStats,
            0xB4 => Command::TunerInit,
            0xB5 => Command::TunerTune,
            0xB6 => Command::SetArgument,
            0xB8 => Command::TunerStandby,
            0xBA => Command::ReadDebugInfo,
            other => return Err(ProtocolError::UnknownCommand(other)),
        };
        Ok(command)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({:#04x})", self, self.code())
    }
}
