//! Capture configuration.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::registry::DeviceId;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_DRIVER_NAME: &str = "keyboard_logger";

pub const DEFAULT_VENDOR_ID: u16 = 0x0416;
pub const DEFAULT_PRODUCT_ID: u16 = 0xA0F8;

/// HID, boot interface subclass, keyboard protocol.
pub const DEFAULT_INTERFACE_CLASS: u8 = 0x03;
pub const DEFAULT_INTERFACE_SUBCLASS: u8 = 0x01;
pub const DEFAULT_INTERFACE_PROTOCOL: u8 = 0x01;

pub const DEFAULT_HOTPLUG_POLL_MS: u64 = 100;
pub const DEFAULT_COMPLETION_WAIT_MS: u64 = 50;

/// Configuration for the capture driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Name the driver registers under.
    pub driver_name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    /// How often the host loop looks for arrival/removal, in ms.
    pub hotplug_poll_ms: u64,
    /// Longest a completion worker blocks before checking for
    /// cancellation, in ms.
    pub completion_wait_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: DEFAULT_PRODUCT_ID,
            interface_class: DEFAULT_INTERFACE_CLASS,
            interface_subclass: DEFAULT_INTERFACE_SUBCLASS,
            interface_protocol: DEFAULT_INTERFACE_PROTOCOL,
            hotplug_poll_ms: DEFAULT_HOTPLUG_POLL_MS,
            completion_wait_ms: DEFAULT_COMPLETION_WAIT_MS,
        }
    }
}

impl CaptureConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CaptureConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// The single id-table entry this configuration describes.
    pub fn device_id(&self) -> DeviceId {
        DeviceId::device_and_interface_info(
            self.vendor_id,
            self.product_id,
            self.interface_class,
            self.interface_subclass,
            self.interface_protocol,
        )
    }

    pub fn hotplug_poll(&self) -> Duration {
        Duration::from_millis(self.hotplug_poll_ms.max(1))
    }

    pub fn completion_wait(&self) -> Duration {
        Duration::from_millis(self.completion_wait_ms.max(1))
    }
}
