//! FX3 device session
//!
//! [`Fx3Device`] ties the control protocol and the streaming pipeline to one
//! opened device. A session only exists after a successful firmware
//! handshake, so streaming can never start against unknown firmware.

use crate::control::DeviceControl;
use crate::error::{DriverError, Result};
use crate::pipeline::{PipelineConfig, SessionState, StreamExit, StreamingPipeline};
use crate::transport::{BulkEndpoint, ControlChannel, DeviceLifecycle};
use common::{RingBuffer, StreamMetrics};
use protocol::{EXPECTED_FIRMWARE, FirmwareVersion, HardwareInfo};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

/// Time the FX3 needs to re-enumerate after a firmware download
pub const DEFAULT_REENUMERATE_DELAY: Duration = Duration::from_millis(800);

/// Session options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceOptions {
    /// Firmware version the handshake accepts
    pub expected_firmware: FirmwareVersion,
    /// Request firmware debug tracing in the hardware-info exchange
    pub debug_trace: bool,
    /// Wait after a firmware download before reopening the device
    pub reenumerate_delay: Duration,
    pub pipeline: PipelineConfig,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            expected_firmware: EXPECTED_FIRMWARE,
            debug_trace: cfg!(debug_assertions),
            reenumerate_delay: DEFAULT_REENUMERATE_DELAY,
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Handshaken session with one FX3 device
///
/// Dropping the session stops any active stream.
pub struct Fx3Device<C: ControlChannel, B: BulkEndpoint> {
    control: DeviceControl<C>,
    pipeline: StreamingPipeline<B>,
    info: HardwareInfo,
}

impl<C: ControlChannel, B: BulkEndpoint> Fx3Device<C, B> {
    /// Open device `index` through `lifecycle`
    ///
    /// A device still running the bootloader gets `firmware` downloaded
    /// first; the session then waits for it to re-enumerate.
    pub fn open<L>(
        lifecycle: &mut L,
        index: usize,
        firmware: &[u8],
        options: DeviceOptions,
    ) -> Result<Self>
    where
        L: DeviceLifecycle<Control = C, Bulk = B>,
    {
        if lifecycle.is_bootloader(index)? {
            info!(
                "Device {} runs the bootloader, loading {} byte firmware image",
                index,
                firmware.len()
            );
            lifecycle.load_firmware(index, firmware)?;
            thread::sleep(options.reenumerate_delay);
        }

        let (control, bulk) = lifecycle.open(index)?;
        Self::from_channels(control, bulk, options)
    }

    /// Handshake over an already opened channel pair
    pub fn from_channels(control: C, bulk: B, options: DeviceOptions) -> Result<Self> {
        let mut control = DeviceControl::new(control).with_debug_trace(options.debug_trace);
        let info = control.handshake(&options.expected_firmware)?;

        Ok(Self {
            control,
            pipeline: StreamingPipeline::new(bulk, options.pipeline),
            info,
        })
    }

    /// Register, argument and I2C access
    pub fn control(&mut self) -> &mut DeviceControl<C> {
        &mut self.control
    }

    pub fn hardware_info(&self) -> HardwareInfo {
        self.info
    }

    pub fn firmware(&self) -> FirmwareVersion {
        self.info.firmware
    }

    /// Start streaming `transfer_size`-byte blocks into `buffer`
    pub fn start_streaming(
        &mut self,
        buffer: Arc<RingBuffer<u8>>,
        transfer_size: usize,
    ) -> Result<()> {
        if !self.control.is_open() {
            return Err(DriverError::SessionClosed);
        }
        self.pipeline.start(buffer, transfer_size)
    }

    pub fn stop_streaming(&mut self) -> Result<StreamExit> {
        self.pipeline.stop()
    }

    pub fn stream_state(&self) -> SessionState {
        self.pipeline.state()
    }

    pub fn is_streaming(&self) -> bool {
        self.pipeline.is_streaming()
    }

    pub fn metrics(&self) -> Arc<StreamMetrics> {
        self.pipeline.metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedBulk, SimulatedControl, SimulatedLifecycle};

    fn fast_options() -> DeviceOptions {
        DeviceOptions {
            reenumerate_delay: Duration::from_millis(1),
            debug_trace: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_open_loads_firmware_in_bootloader_mode() {
        let mut lifecycle = SimulatedLifecycle::bootloader(EXPECTED_FIRMWARE);
        let device = Fx3Device::open(&mut lifecycle, 0, &[0xde, 0xad], fast_options()).unwrap();

        assert_eq!(lifecycle.firmware_loads(), 1);
        assert_eq!(device.firmware(), EXPECTED_FIRMWARE);
    }

    #[test]
    fn test_open_skips_download_when_running() {
        let mut lifecycle = SimulatedLifecycle::new(EXPECTED_FIRMWARE);
        Fx3Device::open(&mut lifecycle, 0, &[], fast_options()).unwrap();
        assert_eq!(lifecycle.firmware_loads(), 0);
    }

    #[test]
    fn test_open_missing_device() {
        let mut lifecycle = SimulatedLifecycle::new(EXPECTED_FIRMWARE);
        assert!(matches!(
            Fx3Device::open(&mut lifecycle, 3, &[], fast_options()),
            Err(DriverError::Transport(crate::TransportError::NotFound))
        ));
    }

    #[test]
    fn test_streaming_refused_after_control_failure() {
        let control = SimulatedControl::new(EXPECTED_FIRMWARE);
        let log = control.log();
        let mut device =
            Fx3Device::from_channels(control, SimulatedBulk::new(), fast_options()).unwrap();

        log.fail_next(crate::TransportError::NoDevice);
        assert!(device.control().start_adc(32_000_000).is_err());

        let buffer = Arc::new(RingBuffer::new(8).unwrap());
        assert!(matches!(
            device.start_streaming(buffer, 512),
            Err(DriverError::SessionClosed)
        ));
    }
}
