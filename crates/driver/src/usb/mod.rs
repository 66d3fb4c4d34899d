//! USB backend
//!
//! Implements the collaborator traits on real hardware through nusb:
//! - Device enumeration and bootloader detection
//! - Interface claiming, detaching any kernel driver
//! - Vendor control requests and queued bulk IN transfers

pub mod device;
pub mod transfers;

pub use device::{STREAM_ENDPOINT, UsbIds, UsbLifecycle};
pub use transfers::{UsbBulk, UsbControl, UsbTransfer, map_transfer_error, map_usb_error};
