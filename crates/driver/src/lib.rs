//! Host driver core for the FX3 streamer
//!
//! This crate streams fixed-size sample blocks from an FX3-based acquisition
//! device into a [`common::RingBuffer`] while register, argument and I2C
//! traffic runs over the control channel of the same device.
//!
//! - [`control::DeviceControl`] speaks the firmware's vendor command set and
//!   performs the version handshake.
//! - [`pipeline::StreamingPipeline`] keeps `K` bulk transfers in flight on a
//!   dedicated thread and commits blocks in submission order.
//! - [`device::Fx3Device`] ties both to one opened, handshaken device.
//!
//! The OS side is reached through the traits in [`transport`]; [`usb`]
//! implements them with nusb and [`sim`] in memory.
//!
//! # Example
//!
//! ```
//! use common::RingBuffer;
//! use driver::sim::SimulatedLifecycle;
//! use driver::{DeviceOptions, Fx3Device};
//! use protocol::EXPECTED_FIRMWARE;
//! use std::sync::Arc;
//!
//! let mut lifecycle = SimulatedLifecycle::new(EXPECTED_FIRMWARE);
//! let mut device = Fx3Device::open(&mut lifecycle, 0, &[], DeviceOptions::default()).unwrap();
//!
//! let buffer = Arc::new(RingBuffer::new(16).unwrap());
//! device.start_streaming(Arc::clone(&buffer), 4096).unwrap();
//! let block = buffer.acquire_read_slot();
//! assert_eq!(block.len(), 4096);
//! buffer.commit_read();
//! device.stop_streaming().unwrap();
//! ```

pub mod control;
pub mod device;
pub mod error;
pub mod pipeline;
pub mod sim;
pub mod transport;
pub mod usb;

pub use control::DeviceControl;
pub use device::{DEFAULT_REENUMERATE_DELAY, DeviceOptions, Fx3Device};
pub use error::{DriverError, Result, TransportError};
pub use pipeline::{
    PipelineConfig, SessionState, SlotStatus, StreamExit, StreamingPipeline, TransferFailure,
    TransferSlot,
};
pub use transport::{BulkEndpoint, ControlChannel, DeviceLifecycle, WaitStatus};
