pub mod ids;

use ids::DeviceId;
use serde::{Deserialize, Serialize};

/// USB interface class code for HID.
pub const USB_CLASS_HID: u8 = 0x03;

/// A HID-capable device as seen at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub vendor_id: u16,
    pub product_id: u16,
    pub product_name: Option<String>,
    pub interface_class: u8,
}

impl DeviceDescriptor {
    pub fn display_name(&self) -> &str {
        self.product_name.as_deref().unwrap_or("Unknown")
    }
}

/// Lifecycle of the single active session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Closed,
    Opening,
    Open,
    Closing,
}
