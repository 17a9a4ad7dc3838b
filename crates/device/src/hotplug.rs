use std::sync::Arc;

use app_core::ids::DeviceId;
use tracing::{debug, info};
use transport_usb::UsbDeviceInfo;

use crate::events::{EventSink, HidEvent};
use crate::registry::{describe, DeviceRegistry};
use crate::session::DeviceSession;

/// Applies attach/detach notifications to the registry and the active session.
pub struct HotplugObserver {
    registry: Arc<DeviceRegistry>,
    session: Arc<DeviceSession>,
    events: EventSink,
}

impl HotplugObserver {
    pub(crate) fn new(
        registry: Arc<DeviceRegistry>,
        session: Arc<DeviceSession>,
        events: EventSink,
    ) -> Self {
        Self {
            registry,
            session,
            events,
        }
    }

    /// Never connects on its own; the caller decides whether to `open`.
    pub fn device_attached(&self, info: UsbDeviceInfo) {
        if !info.is_hid() {
            debug!(device = %info.name, "ignoring non-hid attach");
            return;
        }

        let descriptor = self.registry.remember(info);
        if self.session.is_active(&descriptor.id) {
            debug!(device = %descriptor.id, "active device re-announced");
            return;
        }

        info!(device = %descriptor.id, vendor_id = descriptor.vendor_id, product_id = descriptor.product_id, "hid device attached");
        self.events.emit(HidEvent::DeviceConnected(descriptor));
    }

    /// Closes the session first when `id` is the open device, then reports the
    /// disconnect.
    pub async fn device_detached(&self, id: &DeviceId) {
        let known = self.registry.forget(id).map(|info| describe(&info));
        let active = self.session.active_device().filter(|d| &d.id == id);

        let closed = if active.is_some() {
            self.session.close_device(id).await
        } else {
            false
        };

        match active.or(known) {
            Some(descriptor) => {
                info!(device = %id, closed, "hid device detached");
                self.events.emit(HidEvent::DeviceDisconnected(descriptor));
            }
            None => debug!(device = %id, "unknown device detached"),
        }
    }
}
