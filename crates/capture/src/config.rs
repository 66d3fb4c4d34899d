//! Capture configuration management

use anyhow::{Context, Result, anyhow};
use driver::usb::{STREAM_ENDPOINT, UsbIds};
use driver::{DeviceOptions, PipelineConfig};
use protocol::{BOOTLOADER_PRODUCT_ID, EXPECTED_FIRMWARE, FirmwareVersion, STREAMER_PRODUCT_ID, VENDOR_ID};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// USB 3 bulk packets are 1024 bytes, USB 2 packets 512
const PACKET_ALIGN: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub capture: CaptureSettings,
    pub device: DeviceSettings,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    pub log_level: String,
    /// Stop after this many seconds; run until Ctrl+C when unset
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub device_index: usize,
    /// Seconds between throughput reports
    pub report_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bootloader_product_id: u16,
    /// Bulk IN endpoint carrying the sample stream
    #[serde(default = "default_bulk_endpoint")]
    pub bulk_endpoint: u8,
    /// Firmware image loaded into devices found in bootloader mode
    /// Supports `~` expansion
    #[serde(default)]
    pub firmware_path: Option<String>,
    /// Firmware version accepted by the handshake
    #[serde(default)]
    pub firmware: FirmwareVersion,
    pub reenumerate_delay_ms: u64,
    #[serde(default)]
    pub debug_trace: bool,
}

fn default_bulk_endpoint() -> u8 {
    STREAM_ENDPOINT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Bytes per bulk transfer and per ring buffer block
    pub transfer_size: usize,
    /// Bulk transfers kept in flight
    pub concurrent_transfers: usize,
    pub transfer_timeout_ms: u64,
    /// Ring buffer slots (one is always kept free)
    pub ring_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capture: CaptureSettings {
                log_level: "info".to_string(),
                duration_secs: None,
                device_index: 0,
                report_interval_secs: 1,
            },
            device: DeviceSettings {
                vendor_id: VENDOR_ID,
                product_id: STREAMER_PRODUCT_ID,
                bootloader_product_id: BOOTLOADER_PRODUCT_ID,
                bulk_endpoint: STREAM_ENDPOINT,
                firmware_path: None,
                firmware: EXPECTED_FIRMWARE,
                reenumerate_delay_ms: driver::DEFAULT_REENUMERATE_DELAY.as_millis() as u64,
                debug_trace: false,
            },
            stream: StreamSettings {
                transfer_size: 128 * 1024,
                concurrent_transfers: driver::pipeline::DEFAULT_CONCURRENCY,
                transfer_timeout_ms: driver::pipeline::DEFAULT_TRANSFER_TIMEOUT.as_millis() as u64,
                ring_capacity: common::DEFAULT_CAPACITY,
            },
        }
    }
}

impl CaptureConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => {
                let default = Self::default_path();
                if !default.exists() {
                    return Err(anyhow!("No configuration file found, using defaults"));
                }
                default
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: CaptureConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                // Print to stderr since logging might not be initialized yet
                eprintln!("Config: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("fx3-capture").join("capture.toml")
        } else {
            PathBuf::from(".config/fx3-capture/capture.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.capture.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.capture.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.capture.report_interval_secs == 0 {
            return Err(anyhow!("report_interval_secs must be at least 1"));
        }

        let stream = &self.stream;
        if stream.concurrent_transfers < 2 {
            return Err(anyhow!(
                "concurrent_transfers must be at least 2, got {}",
                stream.concurrent_transfers
            ));
        }
        if stream.ring_capacity <= stream.concurrent_transfers {
            return Err(anyhow!(
                "ring_capacity ({}) must exceed concurrent_transfers ({})",
                stream.ring_capacity,
                stream.concurrent_transfers
            ));
        }
        if stream.transfer_size == 0 || stream.transfer_size % PACKET_ALIGN != 0 {
            return Err(anyhow!(
                "transfer_size must be a non-zero multiple of {}, got {}",
                PACKET_ALIGN,
                stream.transfer_size
            ));
        }
        if stream.transfer_timeout_ms == 0 {
            return Err(anyhow!("transfer_timeout_ms must be non-zero"));
        }

        Ok(())
    }

    /// Firmware image path with `~` expanded
    pub fn firmware_path(&self) -> Option<PathBuf> {
        self.device
            .firmware_path
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
    }

    /// Read the firmware image, or an empty image when none is configured
    pub fn load_firmware(&self) -> Result<Vec<u8>> {
        match self.firmware_path() {
            Some(path) => fs::read(&path)
                .with_context(|| format!("Failed to read firmware image: {}", path.display())),
            None => Ok(Vec::new()),
        }
    }

    pub fn usb_ids(&self) -> UsbIds {
        UsbIds {
            vendor_id: self.device.vendor_id,
            product_id: self.device.product_id,
            bootloader_product_id: self.device.bootloader_product_id,
            bulk_endpoint: self.device.bulk_endpoint,
        }
    }

    pub fn device_options(&self) -> DeviceOptions {
        DeviceOptions {
            expected_firmware: self.device.firmware,
            debug_trace: self.device.debug_trace,
            reenumerate_delay: Duration::from_millis(self.device.reenumerate_delay_ms),
            pipeline: PipelineConfig {
                concurrency: self.stream.concurrent_transfers,
                transfer_timeout: Duration::from_millis(self.stream.transfer_timeout_ms),
            },
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        self.capture.duration_secs.map(Duration::from_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.capture.report_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const FULL_CONFIG: &str = r#"
[capture]
log_level = "debug"
duration_secs = 10
device_index = 1
report_interval_secs = 2

[device]
vendor_id = 0x04b4
product_id = 0x00f1
bootloader_product_id = 0x00f3
bulk_endpoint = 0x82
firmware_path = "~/fx3/SDDC_FX3.img"
firmware = { major = 2, minor = 1 }
reenumerate_delay_ms = 1000
debug_trace = true

[stream]
transfer_size = 131072
concurrent_transfers = 6
transfer_timeout_ms = 100
ring_capacity = 32
"#;

    #[test]
    fn test_default_config_is_valid() {
        let config = CaptureConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capture.log_level, "info");
        assert_eq!(config.stream.concurrent_transfers, 4);
        assert_eq!(config.stream.transfer_timeout_ms, 80);
        assert_eq!(config.device.reenumerate_delay_ms, 800);
        assert_eq!(config.device.firmware, EXPECTED_FIRMWARE);
    }

    #[test]
    fn test_parse_full_config() {
        let config: CaptureConfig = toml::from_str(FULL_CONFIG).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.duration(), Some(Duration::from_secs(10)));
        assert_eq!(config.capture.device_index, 1);
        assert!(config.device.debug_trace);
        assert_eq!(config.usb_ids().bulk_endpoint, 0x82);

        let options = config.device_options();
        assert_eq!(options.pipeline.concurrency, 6);
        assert_eq!(options.pipeline.transfer_timeout, Duration::from_millis(100));
        assert_eq!(options.reenumerate_delay, Duration::from_millis(1000));
        assert_eq!(options.expected_firmware, FirmwareVersion::new(2, 1));
    }

    #[test]
    fn test_firmware_path_expands_tilde() {
        let config: CaptureConfig = toml::from_str(FULL_CONFIG).unwrap();
        let path = config.firmware_path().unwrap();
        assert!(!path.to_string_lossy().starts_with('~'));
        assert!(path.ends_with("fx3/SDDC_FX3.img"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = CaptureConfig::default();
        config.capture.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = CaptureConfig::default();
        config.stream.concurrent_transfers = 1;
        assert!(config.validate().is_err());

        let mut config = CaptureConfig::default();
        config.stream.ring_capacity = config.stream.concurrent_transfers;
        assert!(config.validate().is_err());

        let mut config = CaptureConfig::default();
        config.stream.transfer_size = 1000;
        assert!(config.validate().is_err());

        let mut config = CaptureConfig::default();
        config.stream.transfer_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("capture.toml");

        let mut config = CaptureConfig::default();
        config.capture.duration_secs = Some(5);
        config.stream.ring_capacity = 16;
        config.save(&path).unwrap();

        let loaded = CaptureConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.capture.duration_secs, Some(5));
        assert_eq!(loaded.stream.ring_capacity, 16);
        assert!(loaded.device.firmware_path.is_none());
        assert_eq!(loaded.usb_ids(), UsbIds::default());
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("capture.toml");
        fs::write(&path, FULL_CONFIG.replace("concurrent_transfers = 6", "concurrent_transfers = 1"))
            .unwrap();

        assert!(CaptureConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_load_firmware_image() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("fw.img");
        fs::write(&image, [0x43, 0x59, 0x1c, 0xb0]).unwrap();

        let mut config = CaptureConfig::default();
        assert!(config.load_firmware().unwrap().is_empty());

        config.device.firmware_path = Some(image.to_string_lossy().into_owned());
        assert_eq!(config.load_firmware().unwrap(), vec![0x43, 0x59, 0x1c, 0xb0]);
    }
}
