//! Device control protocol
//!
//! [`DeviceControl`] encodes firmware commands onto a [`ControlChannel`] and
//! interprets the hardware-info handshake. The `wValue`/`wIndex` addressing
//! fields are explicit state: every request stamps them before it goes out,
//! and I2C reads restore the previous values afterwards.
//!
//! Every method takes `&mut self`, so two requests can never interleave on
//! the same channel. A transport failure closes the session; afterwards every
//! call returns [`DriverError::SessionClosed`].

use crate::error::{DriverError, Result};
use crate::transport::ControlChannel;
use protocol::{
    Addressing, Command, ControlSetup, FirmwareVersion, HARDWARE_INFO_LEN, HardwareInfo, Payload,
    decode_hardware_info, encode_payload, validate_firmware,
};
use std::ops::{Deref, DerefMut};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause before each I2C write so the firmware's bus proxy can settle
pub const I2C_WRITE_DELAY: Duration = Duration::from_millis(10);

/// Control-plane session with one device
pub struct DeviceControl<C> {
    channel: Option<C>,
    addressing: Addressing,
    debug_trace: bool,
}

impl<C: ControlChannel> DeviceControl<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel: Some(channel),
            addressing: Addressing::ZERO,
            debug_trace: false,
        }
    }

    /// Ask the firmware to enable its debug trace when reading hardware info
    pub fn with_debug_trace(mut self, enabled: bool) -> Self {
        self.debug_trace = enabled;
        self
    }

    /// Addressing fields used by the most recent request
    pub fn addressing(&self) -> Addressing {
        self.addressing
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// Drop the channel; later requests fail with [`DriverError::SessionClosed`]
    pub fn close(&mut self) {
        if self.channel.take().is_some() {
            info!("Control session closed");
        }
    }

    /// Send `command` with a 1, 4 or 8 byte payload and cleared addressing
    pub fn send_command(&mut self, command: Command, payload: impl Into<Payload>) -> Result<()> {
        let payload = payload.into();
        self.addressing = Addressing::ZERO;
        self.write(command, &encode_payload(payload))
    }

    /// Set firmware argument `index` to `value`
    ///
    /// The argument travels in the addressing fields; the payload is a single
    /// zero byte.
    pub fn set_argument(&mut self, index: u16, value: u16) -> Result<()> {
        self.addressing = Addressing::new(value, index);
        self.write(Command::SetArgument, &encode_payload(Payload::U8(0)))
    }

    /// Read the `[model, major, minor, reserved]` hardware info block
    pub fn read_hardware_info(&mut self) -> Result<HardwareInfo> {
        self.addressing = Addressing::new(u16::from(self.debug_trace), 0);
        let mut buffer = [0u8; HARDWARE_INFO_LEN];
        let received = self.read(Command::Test, &mut buffer)?;
        Ok(decode_hardware_info(&buffer[..received])?)
    }

    /// Verify the firmware version before any streaming happens
    ///
    /// On a mismatch the device is sent one reset request, the session is
    /// closed and [`DriverError::FirmwareMismatch`] is returned.
    pub fn handshake(&mut self, expected: &FirmwareVersion) -> Result<HardwareInfo> {
        let info = self.read_hardware_info()?;

        if let Err(e) = validate_firmware(&info, expected) {
            warn!("Handshake failed: {}", e);
            if let Err(e) = self.send_command(Command::Reset, 0u8) {
                debug!("Reset after firmware mismatch failed: {}", e);
            }
            self.close();
            return Err(DriverError::FirmwareMismatch {
                expected: *expected,
                actual: info.firmware,
            });
        }

        info!(
            "Firmware {} accepted (model {:#04x})",
            info.firmware, info.model
        );
        Ok(info)
    }

    /// Read a firmware debug trace stream
    ///
    /// `buffer[0]` selects the stream on input and is overwritten with trace
    /// data. Returns the number of bytes received.
    pub fn read_debug_trace(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let selector = buffer.first().copied().unwrap_or(0);
        self.addressing.value = u16::from(selector);
        self.read(Command::ReadDebugInfo, buffer)
    }

    /// Write `data` to `register` of the I2C device at `bus`
    pub fn i2c_write(&mut self, bus: u8, register: u16, data: &[u8]) -> Result<()> {
        self.addressing = Addressing::new(u16::from(bus), register);
        thread::sleep(I2C_WRITE_DELAY);
        self.write(Command::I2cWrite, data)
    }

    /// Read `data.len()` bytes from `register` of the I2C device at `bus`
    ///
    /// The addressing in effect before the call is restored afterwards,
    /// whether or not the read succeeds.
    pub fn i2c_read(&mut self, bus: u8, register: u16, data: &mut [u8]) -> Result<usize> {
        let mut scoped = self.scoped_addressing(Addressing::new(u16::from(bus), register));
        scoped.read(Command::I2cRead, data)
    }

    /// Read the firmware's statistics block into `buffer`
    ///
    /// Returns the number of bytes received; the layout is firmware defined.
    pub fn get_stats(&mut self, buffer: &mut [u8]) -> Result<usize> {
        self.addressing = Addressing::ZERO;
        self.read(Command::GetStats, buffer)
    }

    pub fn start_stream(&mut self) -> Result<()> {
        self.send_command(Command::Start, 0u32)
    }

    pub fn stop_stream(&mut self) -> Result<()> {
        self.send_command(Command::Stop, 0u32)
    }

    pub fn set_gpio(&mut self, bits: u32) -> Result<()> {
        self.send_command(Command::Gpio, bits)
    }

    /// Start the ADC sampling clock at `frequency` Hz
    pub fn start_adc(&mut self, frequency: u32) -> Result<()> {
        self.send_command(Command::StartAdc, frequency)
    }

    /// Initialise the tuner with its reference frequency in Hz
    pub fn tuner_init(&mut self, reference: u32) -> Result<()> {
        self.send_command(Command::TunerInit, reference)
    }

    pub fn tuner_tune(&mut self, frequency: u64) -> Result<()> {
        self.send_command(Command::TunerTune, frequency)
    }

    pub fn tuner_standby(&mut self) -> Result<()> {
        self.send_command(Command::TunerStandby, 0u32)
    }

    /// Reboot the FX3 into its bootloader
    pub fn reset_device(&mut self) -> Result<()> {
        self.send_command(Command::Reset, 0u8)
    }

    fn scoped_addressing(&mut self, addressing: Addressing) -> ScopedAddressing<'_, C> {
        let saved = self.addressing;
        self.addressing = addressing;
        ScopedAddressing {
            control: self,
            saved,
        }
    }

    fn write(&mut self, command: Command, data: &[u8]) -> Result<()> {
        let setup = ControlSetup::new(command, self.addressing);
        debug!(
            "Control write {} value={:#06x} index={:#06x} len={}",
            command,
            setup.addressing.value,
            setup.addressing.index,
            data.len()
        );

        let channel = self.channel.as_mut().ok_or(DriverError::SessionClosed)?;
        let result = channel.write(setup, data);
        self.check(command, result)
    }

    fn read(&mut self, command: Command, buffer: &mut [u8]) -> Result<usize> {
        let setup = ControlSetup::new(command, self.addressing);
        debug!(
            "Control read {} value={:#06x} index={:#06x} len={}",
            command,
            setup.addressing.value,
            setup.addressing.index,
            buffer.len()
        );

        let channel = self.channel.as_mut().ok_or(DriverError::SessionClosed)?;
        let result = channel.read(setup, buffer);
        self.check(command, result)
    }

    fn check<T>(
        &mut self,
        command: Command,
        result: std::result::Result<T, crate::TransportError>,
    ) -> Result<T> {
        result.map_err(|e| {
            warn!("Control request {} failed: {}", command, e);
            self.close();
            DriverError::Transport(e)
        })
    }
}

/// Restores the saved addressing when dropped
struct ScopedAddressing<'a, C: ControlChannel> {
    control: &'a mut DeviceControl<C>,
    saved: Addressing,
}

impl<C: ControlChannel> Deref for ScopedAddressing<'_, C> {
    type Target = DeviceControl<C>;

    fn deref(&self) -> &Self::Target {
        self.control
    }
}

impl<C: ControlChannel> DerefMut for ScopedAddressing<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.control
    }
}

impl<C: ControlChannel> Drop for ScopedAddressing<'_, C> {
    fn drop(&mut self) {
        self.control.addressing = self.saved;
    }
}
