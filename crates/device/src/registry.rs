use std::collections::HashMap;
use std::sync::Arc;

use app_core::ids::DeviceId;
use app_core::DeviceDescriptor;
use parking_lot::Mutex;
use tracing::{debug, warn};
use transport_usb::{UsbBackend, UsbDeviceInfo};

/// HID devices the caller has seen, keyed by device name.
///
/// Enumeration failures are swallowed here (empty list); surfacing an
/// unavailable subsystem is the facade's job.
pub struct DeviceRegistry {
    backend: Arc<dyn UsbBackend>,
    seen: Mutex<HashMap<DeviceId, UsbDeviceInfo>>,
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn UsbBackend>) -> Self {
        Self {
            backend,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn attached_hid(&self) -> Vec<UsbDeviceInfo> {
        match self.backend.devices() {
            Ok(all) => all.into_iter().filter(UsbDeviceInfo::is_hid).collect(),
            Err(err) => {
                warn!(?err, "usb enumeration failed");
                vec![]
            }
        }
    }

    /// Every attached HID device, in enumeration order. Each one is remembered.
    pub fn list_hid_devices(&self) -> Vec<DeviceDescriptor> {
        let found = self.attached_hid();
        debug!(count = found.len(), "enumerated hid devices");
        found.into_iter().map(|info| self.remember(info)).collect()
    }

    pub fn find_by_vendor(&self, vendor_id: u16) -> Option<DeviceDescriptor> {
        self.find_info_by_vendor(vendor_id).map(|i| describe(&i))
    }

    pub(crate) fn find_info_by_vendor(&self, vendor_id: u16) -> Option<UsbDeviceInfo> {
        self.attached_hid()
            .into_iter()
            .find(|d| d.vendor_id == vendor_id)
    }

    /// Insert or supersede the entry for `info.name`.
    pub fn remember(&self, info: UsbDeviceInfo) -> DeviceDescriptor {
        let descriptor = describe(&info);
        self.seen.lock().insert(info.name.clone(), info);
        descriptor
    }

    pub fn forget(&self, id: &DeviceId) -> Option<UsbDeviceInfo> {
        self.seen.lock().remove(id)
    }

    pub fn resolve(&self, id: &DeviceId) -> Option<UsbDeviceInfo> {
        self.seen.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn describe(info: &UsbDeviceInfo) -> DeviceDescriptor {
    let interface_class = info
        .hid_interface()
        .or_else(|| info.interfaces.first())
        .map(|i| i.class_code)
        .unwrap_or_default();
    DeviceDescriptor {
        id: info.name.clone(),
        vendor_id: info.vendor_id,
        product_id: info.product_id,
        product_name: info.product_string.clone(),
        interface_class,
    }
}

#[cfg(test)]
mod tests {
    use app_core::USB_CLASS_HID;
    use transport_usb::fake::{hid_device, storage_device, FakeUsb, PermissionPolicy};

    use super::*;

    fn registry_with(devices: Vec<UsbDeviceInfo>) -> (Arc<FakeUsb>, DeviceRegistry) {
        let usb = Arc::new(FakeUsb::new(PermissionPolicy::AlwaysGranted));
        for d in devices {
            usb.attach(d);
        }
        let reg = DeviceRegistry::new(usb.clone());
        (usb, reg)
    }

    #[test]
    fn lists_only_hid_devices_in_enumeration_order() {
        let (_usb, reg) = registry_with(vec![
            hid_device("/dev/bus/usb/001/002", 0x0801, 0x0001),
            storage_device("/dev/bus/usb/001/003", 0x0781, 0x5567),
            hid_device("/dev/bus/usb/001/004", 0x046d, 0xc52b),
        ]);

        let ids: Vec<_> = reg
            .list_hid_devices()
            .into_iter()
            .map(|d| d.id.to_string())
            .collect();
        assert_eq!(ids, ["/dev/bus/usb/001/002", "/dev/bus/usb/001/004"]);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn find_by_vendor_returns_first_match_or_none() {
        let (_usb, reg) = registry_with(vec![
            storage_device("/dev/bus/usb/001/001", 0x0801, 0x9999),
            hid_device("/dev/bus/usb/001/002", 0x0801, 0x0001),
            hid_device("/dev/bus/usb/001/003", 0x0801, 0x0002),
        ]);

        let found = reg.find_by_vendor(0x0801).unwrap();
        assert_eq!(found.id.as_str(), "/dev/bus/usb/001/002");
        assert_eq!(found.interface_class, USB_CLASS_HID);
        assert!(reg.find_by_vendor(0x1234).is_none());
    }

    #[test]
    fn unavailable_subsystem_yields_empty_list() {
        let (usb, reg) = registry_with(vec![hid_device("/dev/bus/usb/001/002", 1, 1)]);
        usb.set_available(false);
        assert!(reg.list_hid_devices().is_empty());
    }

    #[test]
    fn re_enumeration_supersedes_entries() {
        let (usb, reg) = registry_with(vec![hid_device("/dev/bus/usb/001/002", 0x0801, 0x0001)]);
        reg.list_hid_devices();

        let mut replaced = hid_device("/dev/bus/usb/001/002", 0x0801, 0x0042);
        replaced.product_string = Some("Replacement".into());
        usb.attach(replaced);
        reg.list_hid_devices();

        let entry = reg.resolve(&DeviceId::from("/dev/bus/usb/001/002")).unwrap();
        assert_eq!(entry.product_id, 0x0042);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn forget_removes_entry() {
        let (_usb, reg) = registry_with(vec![]);
        let id = DeviceId::from("/dev/bus/usb/002/007");
        reg.remember(hid_device(id.as_str(), 1, 2));
        assert!(reg.resolve(&id).is_some());
        assert!(reg.forget(&id).is_some());
        assert!(reg.resolve(&id).is_none());
        assert!(reg.forget(&id).is_none());
    }
}
