//! FX3 discovery and opening
//!
//! [`UsbLifecycle`] enumerates devices matching the configured vendor and
//! product ids, tells bootloader-mode devices apart from ones running the
//! streamer firmware, and opens a device by claiming its streaming interface.

use super::transfers::{UsbBulk, UsbControl, map_usb_error};
use crate::error::TransportError;
use crate::transport::DeviceLifecycle;
use nusb::transfer::{Bulk, In};
use nusb::{DeviceInfo, MaybeFuture};
use protocol::{BOOTLOADER_PRODUCT_ID, STREAMER_PRODUCT_ID, VENDOR_ID};
use tracing::{debug, info, warn};

/// Interface carrying the control and bulk endpoints
const STREAM_INTERFACE: u8 = 0;

/// Bulk IN endpoint of the streamer firmware
pub const STREAM_ENDPOINT: u8 = 0x81;

/// USB ids used to recognise an FX3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbIds {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bootloader_product_id: u16,
    pub bulk_endpoint: u8,
}

impl Default for UsbIds {
    fn default() -> Self {
        Self {
            vendor_id: VENDOR_ID,
            product_id: STREAMER_PRODUCT_ID,
            bootloader_product_id: BOOTLOADER_PRODUCT_ID,
            bulk_endpoint: STREAM_ENDPOINT,
        }
    }
}

impl UsbIds {
    /// Whether the ids belong to an FX3 in either mode
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        vendor_id == self.vendor_id
            && (product_id == self.product_id || product_id == self.bootloader_product_id)
    }
}

/// Device lifecycle on top of nusb
pub struct UsbLifecycle {
    ids: UsbIds,
}

impl UsbLifecycle {
    pub fn new(ids: UsbIds) -> Self {
        Self { ids }
    }

    pub fn ids(&self) -> &UsbIds {
        &self.ids
    }

    /// FX3 devices in either mode, in enumeration order
    pub fn devices(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        let found: Vec<DeviceInfo> = nusb::list_devices()
            .wait()
            .map_err(map_usb_error)?
            .filter(|info| self.ids.matches(info.vendor_id(), info.product_id()))
            .collect();

        debug!("Found {} FX3 devices", found.len());
        Ok(found)
    }

    fn device(&self, index: usize) -> Result<DeviceInfo, TransportError> {
        self.devices()?
            .into_iter()
            .nth(index)
            .ok_or(TransportError::NotFound)
    }
}

impl DeviceLifecycle for UsbLifecycle {
    type Control = UsbControl;
    type Bulk = UsbBulk;

    fn is_bootloader(&mut self, index: usize) -> Result<bool, TransportError> {
        let info = self.device(index)?;
        Ok(info.product_id() == self.ids.bootloader_product_id)
    }

    fn load_firmware(&mut self, index: usize, image: &[u8]) -> Result<(), TransportError> {
        warn!(
            "Device {} needs a {} byte firmware download, which this backend cannot perform",
            index,
            image.len()
        );
        Err(TransportError::Unsupported(
            "firmware download into the FX3 bootloader".to_string(),
        ))
    }

    fn open(&mut self, index: usize) -> Result<(Self::Control, Self::Bulk), TransportError> {
        let info = self.device(index)?;
        let device = info.open().wait().map_err(|e| {
            warn!("Failed to open device {}: {}", index, e);
            map_usb_error(e)
        })?;

        // Detaches a kernel driver bound to the interface, if any
        let interface = device
            .detach_and_claim_interface(STREAM_INTERFACE)
            .wait()
            .map_err(map_usb_error)?;

        let address = self.ids.bulk_endpoint;
        let endpoint = interface
            .endpoint::<Bulk, In>(address)
            .map_err(map_usb_error)?;

        info!(
            "Opened device {} at address {}, bulk endpoint {:#04x}",
            index,
            info.device_address(),
            address
        );

        Ok((UsbControl::new(interface), UsbBulk::new(endpoint, address)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ids() {
        let ids = UsbIds::default();
        assert_eq!(ids.vendor_id, 0x04B4);
        assert_eq!(ids.product_id, 0x00F1);
        assert_eq!(ids.bootloader_product_id, 0x00F3);
        assert_eq!(ids.bulk_endpoint, 0x81);
    }

    #[test]
    fn test_ids_match_both_modes() {
        let ids = UsbIds::default();
        assert!(ids.matches(0x04B4, 0x00F1));
        assert!(ids.matches(0x04B4, 0x00F3));
        assert!(!ids.matches(0x04B4, 0x00F0));
        assert!(!ids.matches(0x1d50, 0x00F1));
    }

    #[test]
    fn test_missing_index_is_not_found() {
        let mut lifecycle = UsbLifecycle::new(UsbIds::default());

        // Without USB access enumeration itself fails, which is also fine
        if let Ok(devices) = lifecycle.devices() {
            let past_end = devices.len();
            assert_eq!(
                lifecycle.is_bootloader(past_end),
                Err(TransportError::NotFound)
            );
            assert!(matches!(
                lifecycle.open(past_end),
                Err(TransportError::NotFound)
            ));
        }
    }
}
