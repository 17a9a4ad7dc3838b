//! USB HID session core: discovery, permission, a single open session with a
//! background input pump, and hotplug handling.

mod error;
mod events;
mod hotplug;
mod permission;
mod pump;
mod registry;
pub mod report;
mod session;

use std::sync::Arc;

use app_core::ids::DeviceId;
use app_core::{DeviceDescriptor, SessionState};
use settings::BridgeSettings;
use tokio::sync::mpsc;
use tracing::{debug, info};
use transport_usb::{OsEvent, UsbBackend};

pub use error::HidError;
pub use events::{EventStream, HidEvent};
pub use hotplug::HotplugObserver;
pub use permission::{AccessOutcome, PermissionGate};
pub use pump::{PumpConfig, PumpExit};
pub use registry::{describe, DeviceRegistry};
pub use session::DeviceSession;

use events::EventSink;

/// Caller-facing surface. Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct HidBridge {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn UsbBackend>,
    settings: BridgeSettings,
    registry: Arc<DeviceRegistry>,
    gate: Arc<PermissionGate>,
    session: Arc<DeviceSession>,
    hotplug: HotplugObserver,
}

impl HidBridge {
    /// Build the bridge and the single stream its notifications arrive on.
    pub fn new(backend: Arc<dyn UsbBackend>, settings: BridgeSettings) -> (Self, EventStream) {
        let (events, stream) = EventSink::channel();
        let registry = Arc::new(DeviceRegistry::new(backend.clone()));
        let gate = Arc::new(PermissionGate::new(backend.clone()));
        let session = Arc::new(DeviceSession::new(
            backend.clone(),
            gate.clone(),
            events.clone(),
            settings.clone(),
        ));
        let hotplug = HotplugObserver::new(registry.clone(), session.clone(), events);

        let bridge = Self {
            inner: Arc::new(Inner {
                backend,
                settings,
                registry,
                gate,
                session,
                hotplug,
            }),
        };
        (bridge, stream)
    }

    fn ensure_available(&self) -> Result<(), HidError> {
        if self.inner.backend.is_available() {
            Ok(())
        } else {
            Err(HidError::SubsystemUnavailable)
        }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    pub fn list_hid_devices(&self) -> Result<Vec<DeviceDescriptor>, HidError> {
        self.ensure_available()?;
        Ok(self.inner.registry.list_hid_devices())
    }

    pub fn find_by_vendor(&self, vendor_id: u16) -> Result<Option<DeviceDescriptor>, HidError> {
        self.ensure_available()?;
        Ok(self.inner.registry.find_by_vendor(vendor_id))
    }

    /// Pick the first HID device of `vendor_id` (or the configured default
    /// vendor) and obtain permission for it, remembering it on success.
    pub async fn request_device(&self, vendor_id: Option<u16>) -> Result<DeviceDescriptor, HidError> {
        self.ensure_available()?;
        let vendor_id = vendor_id.unwrap_or(self.inner.settings.default_vendor_id);
        let info = self
            .inner
            .registry
            .find_info_by_vendor(vendor_id)
            .ok_or_else(|| HidError::DeviceNotFound(format!("no HID device with vendor {vendor_id:04x}")))?;

        let id = info.name.clone();
        match self
            .inner
            .gate
            .request_access(&info, self.inner.settings.permission_timeout())
            .await
        {
            AccessOutcome::Granted => Ok(self.inner.registry.remember(info)),
            AccessOutcome::Denied => Err(HidError::PermissionDenied(id)),
            AccessOutcome::TimedOut => Err(HidError::PermissionTimedOut(id)),
        }
    }

    /// Open a device previously listed, requested or announced by hotplug.
    pub async fn open(&self, id: &DeviceId) -> Result<DeviceDescriptor, HidError> {
        self.ensure_available()?;
        let info = self
            .inner
            .registry
            .resolve(id)
            .ok_or_else(|| HidError::DeviceNotFound(id.to_string()))?;
        self.inner.session.open(info).await
    }

    pub async fn send_output_report(&self, report_id: u8, payload: &[u8]) -> Result<usize, HidError> {
        self.inner.session.send_output_report(report_id, payload).await
    }

    /// Idempotent. Returns whether a device was actually closed.
    pub async fn close(&self) -> bool {
        self.inner.session.close().await
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.state()
    }

    pub fn active_device(&self) -> Option<DeviceDescriptor> {
        self.inner.session.active_device()
    }

    pub async fn handle_os_event(&self, event: OsEvent) {
        match event {
            OsEvent::PermissionResult { device, granted } => {
                let woken = self.inner.gate.notify_result(&device, granted);
                debug!(%device, granted, woken, "permission result");
            }
            OsEvent::Attached(info) => self.inner.hotplug.device_attached(info),
            OsEvent::Detached(id) => self.inner.hotplug.device_detached(&id).await,
        }
    }

    /// Consume OS notifications until the sending side goes away.
    pub async fn run(self, mut os_events: mpsc::UnboundedReceiver<OsEvent>) {
        while let Some(event) = os_events.recv().await {
            self.handle_os_event(event).await;
        }
        info!("os event stream ended");
    }
}
