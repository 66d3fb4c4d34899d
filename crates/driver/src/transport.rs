//! Collaborator boundaries
//!
//! The driver core never talks to an OS USB stack directly. It drives three
//! traits instead: a [`ControlChannel`] for vendor requests, a
//! [`BulkEndpoint`] for the asynchronous sample transfers and a
//! [`DeviceLifecycle`] that knows how to find, boot and open a device.
//!
//! [`crate::usb`] implements them on top of `nusb`, [`crate::sim`] implements
//! them in memory.

use crate::error::TransportError;
use common::Block;
use protocol::ControlSetup;
use std::time::Duration;

/// Synchronous vendor request channel (endpoint 0)
pub trait ControlChannel: Send {
    /// Host-to-device request carrying `data`
    fn write(&mut self, setup: ControlSetup, data: &[u8]) -> Result<(), TransportError>;

    /// Device-to-host request, returns the number of bytes received
    fn read(&mut self, setup: ControlSetup, buffer: &mut [u8]) -> Result<usize, TransportError>;
}

/// Outcome of waiting on a submitted transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The transfer completed; call [`BulkEndpoint::finish`]
    Ready,
    /// The timeout elapsed with the transfer still pending
    TimedOut,
}

/// Asynchronous bulk IN endpoint
///
/// A transfer goes through `begin`, `wait` and `finish` on the same context.
/// Contexts hold whatever OS resources one outstanding transfer needs and
/// release them when dropped. A context is reused for many transfers.
pub trait BulkEndpoint: Send + 'static {
    /// Per-transfer OS state
    type Context: Send;

    fn create_context(&mut self) -> Result<Self::Context, TransportError>;

    /// Submit a read of `len` bytes into `target`
    fn begin(
        &mut self,
        context: &mut Self::Context,
        target: Block<u8>,
        len: usize,
    ) -> Result<(), TransportError>;

    /// Block until the transfer completes or `timeout` elapses
    fn wait(
        &mut self,
        context: &mut Self::Context,
        timeout: Duration,
    ) -> Result<WaitStatus, TransportError>;

    /// Collect a completed transfer, returning the number of bytes received
    fn finish(&mut self, context: &mut Self::Context) -> Result<usize, TransportError>;

    /// Cancel the transfer in flight on `context`, if any
    fn abort(&mut self, context: &mut Self::Context);
}

/// Device discovery, firmware download and opening
///
/// Closing a device is dropping the channel pair returned by `open`.
pub trait DeviceLifecycle {
    type Control: ControlChannel;
    type Bulk: BulkEndpoint;

    /// Whether device `index` runs only the FX3 bootloader
    fn is_bootloader(&mut self, index: usize) -> Result<bool, TransportError>;

    /// Download a firmware image into device `index`
    ///
    /// The device re-enumerates afterwards; callers wait before opening it.
    fn load_firmware(&mut self, index: usize, image: &[u8]) -> Result<(), TransportError>;

    /// Open device `index` and claim its control channel and bulk endpoint
    fn open(&mut self, index: usize) -> Result<(Self::Control, Self::Bulk), TransportError>;
}
