//! Raw USB facility the HID session core runs on.
//!
//! Downstream crates only see the [`UsbBackend`] / [`UsbConnection`] traits and
//! the plain-data device descriptions below; `rusb` stays an implementation
//! detail of [`RusbBackend`].

mod error;
mod rusb_backend;

#[cfg(feature = "fake")]
pub mod fake;

use std::sync::Arc;
use std::time::Duration;

use app_core::ids::DeviceId;
use app_core::USB_CLASS_HID;

pub use error::TransportError;
pub use rusb_backend::{HotplugWatch, RusbBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
}

impl EndpointInfo {
    pub fn is_interrupt(&self, direction: Direction) -> bool {
        self.transfer_type == TransferType::Interrupt && self.direction == direction
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    pub class_code: u8,
    pub endpoints: Vec<EndpointInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    pub name: DeviceId,
    pub vendor_id: u16,
    pub product_id: u16,
    pub product_string: Option<String>,
    pub interfaces: Vec<InterfaceInfo>,
}

impl UsbDeviceInfo {
    /// First interface advertising the HID class, if any.
    pub fn hid_interface(&self) -> Option<&InterfaceInfo> {
        self.interfaces
            .iter()
            .find(|i| i.class_code == USB_CLASS_HID)
    }

    pub fn is_hid(&self) -> bool {
        self.hid_interface().is_some()
    }
}

/// Setup packet fields for a host-to-device control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Notifications the USB subsystem delivers on its own schedule.
#[derive(Debug, Clone)]
pub enum OsEvent {
    PermissionResult { device: DeviceId, granted: bool },
    Attached(UsbDeviceInfo),
    Detached(DeviceId),
}

/// Enumeration, permission and open facility.
///
/// Permission answers are not returned from `request_permission`; they arrive
/// later as [`OsEvent::PermissionResult`] on the backend's event stream.
pub trait UsbBackend: Send + Sync {
    fn is_available(&self) -> bool;

    fn devices(&self) -> Result<Vec<UsbDeviceInfo>, TransportError>;

    fn has_permission(&self, device: &UsbDeviceInfo) -> bool;

    fn request_permission(&self, device: &UsbDeviceInfo) -> Result<(), TransportError>;

    fn open(&self, device: &UsbDeviceInfo) -> Result<Arc<dyn UsbConnection>, TransportError>;
}

/// An open device handle. Shared between the session and its input pump.
pub trait UsbConnection: Send + Sync {
    /// Claim `number` exclusively; `force` allows detaching a kernel driver.
    fn claim_interface(&self, number: u8, force: bool) -> Result<(), TransportError>;

    fn release_interface(&self, number: u8) -> Result<(), TransportError>;

    /// Returns `Ok(0)` when the timeout expired without data.
    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn write_interrupt(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn write_control(
        &self,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Drop the underlying handle. Later calls fail with `Disconnected`.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(number: u8, class_code: u8) -> InterfaceInfo {
        InterfaceInfo {
            number,
            class_code,
            endpoints: vec![],
        }
    }

    #[test]
    fn hid_interface_picks_first_hid_class() {
        let info = UsbDeviceInfo {
            name: DeviceId::from("/dev/bus/usb/001/002"),
            vendor_id: 0x0801,
            product_id: 0x0003,
            product_string: None,
            interfaces: vec![iface(0, 0x08), iface(1, USB_CLASS_HID), iface(2, USB_CLASS_HID)],
        };
        assert_eq!(info.hid_interface().map(|i| i.number), Some(1));
        assert!(info.is_hid());
    }

    #[test]
    fn device_without_hid_interface_is_not_hid() {
        let info = UsbDeviceInfo {
            name: DeviceId::from("/dev/bus/usb/001/003"),
            vendor_id: 0x0781,
            product_id: 0x5567,
            product_string: Some("Mass Storage".into()),
            interfaces: vec![iface(0, 0x08)],
        };
        assert!(!info.is_hid());
    }

    #[test]
    fn interrupt_direction_matching() {
        let ep = EndpointInfo {
            address: 0x81,
            direction: Direction::In,
            transfer_type: TransferType::Interrupt,
            max_packet_size: 64,
        };
        assert!(ep.is_interrupt(Direction::In));
        assert!(!ep.is_interrupt(Direction::Out));
    }
}
