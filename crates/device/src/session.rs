use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use app_core::ids::DeviceId;
use app_core::{DeviceDescriptor, SessionState};
use settings::{BridgeSettings, OutputTransfer};
use tracing::{debug, info, warn};
use transport_usb::{
    Direction, EndpointInfo, InterfaceInfo, TransportError, UsbBackend, UsbConnection,
    UsbDeviceInfo,
};

use crate::error::HidError;
use crate::events::{EventSink, HidEvent};
use crate::permission::{AccessOutcome, PermissionGate};
use crate::pump::{InputReportPump, PumpConfig};
use crate::registry::describe;
use crate::report;

/// Everything bound to one open device. Lives only inside the session slot.
struct Session {
    descriptor: DeviceDescriptor,
    connection: Arc<dyn UsbConnection>,
    interface: u8,
    output: EndpointInfo,
    is_open: Arc<AtomicBool>,
    pump: InputReportPump,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.is_open.store(false, Ordering::SeqCst);
        if let Err(err) = self.connection.release_interface(self.interface) {
            debug!(?err, interface = self.interface, "release interface failed");
        }
        self.connection.close();
    }
}

/// Clears the active device and reports the close.
struct MarkClosed<'a> {
    session: &'a DeviceSession,
    descriptor: DeviceDescriptor,
}

impl Drop for MarkClosed<'_> {
    fn drop(&mut self) {
        *self.session.active.lock() = None;
        self.session.set_state(SessionState::Closed);
        info!(device = %self.descriptor.id, "device closed");
        self.session
            .events
            .emit(HidEvent::DeviceClosed(self.descriptor.clone()));
    }
}

/// Puts the state back when an open fails or its future is dropped early.
struct OpeningGuard<'a> {
    session: &'a DeviceSession,
    committed: bool,
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let restored = if self.session.active.lock().is_some() {
            SessionState::Open
        } else {
            SessionState::Closed
        };
        let mut state = self.session.state.lock();
        if *state == SessionState::Opening {
            *state = restored;
        }
    }
}

/// Owner of the single active device session.
///
/// `open` and `close` are serialized through the slot lock; `close` keeps it
/// while draining the pump, so a following `open` cannot start a second pump
/// early.
pub struct DeviceSession {
    backend: Arc<dyn UsbBackend>,
    gate: Arc<PermissionGate>,
    events: EventSink,
    settings: BridgeSettings,
    slot: tokio::sync::Mutex<Option<Session>>,
    state: parking_lot::Mutex<SessionState>,
    active: parking_lot::Mutex<Option<DeviceDescriptor>>,
    // Bumped by `close`; an open that waited on permission across a close is dropped.
    epoch: AtomicU64,
}

impl DeviceSession {
    pub(crate) fn new(
        backend: Arc<dyn UsbBackend>,
        gate: Arc<PermissionGate>,
        events: EventSink,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            backend,
            gate,
            events,
            settings,
            slot: tokio::sync::Mutex::new(None),
            state: parking_lot::Mutex::new(SessionState::Closed),
            active: parking_lot::Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn active_device(&self) -> Option<DeviceDescriptor> {
        self.active.lock().clone()
    }

    pub fn is_active(&self, id: &DeviceId) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|d| &d.id == id)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    pub async fn open(&self, info: UsbDeviceInfo) -> Result<DeviceDescriptor, HidError> {
        let id = info.name.clone();
        let epoch = self.epoch.load(Ordering::SeqCst);
        let mut guard = OpeningGuard {
            session: self,
            committed: false,
        };
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                *state = SessionState::Opening;
            }
        }

        match self
            .gate
            .request_access(&info, self.settings.permission_timeout())
            .await
        {
            AccessOutcome::Granted => {}
            AccessOutcome::Denied => return Err(HidError::PermissionDenied(id)),
            AccessOutcome::TimedOut => return Err(HidError::PermissionTimedOut(id)),
        }

        let mut slot = self.slot.lock().await;

        if self.epoch.load(Ordering::SeqCst) != epoch {
            info!(device = %id, "session closed while waiting for permission, discarding open");
            return Err(HidError::Cancelled(id));
        }

        if let Some(current) = slot.as_ref() {
            if current.descriptor.id == id {
                debug!(device = %id, "device already open");
                return Ok(current.descriptor.clone());
            }
        }
        if let Some(previous) = slot.take() {
            info!(previous = %previous.descriptor.id, next = %id, "switching active device");
            self.teardown(previous).await;
        }

        self.set_state(SessionState::Opening);

        let backend = self.backend.clone();
        let events = self.events.clone();
        let settings = self.settings.clone();
        let result = tokio::task::spawn_blocking(move || {
            establish(backend.as_ref(), &info, events, &settings)
        })
        .await
        .unwrap_or_else(|err| {
            Err(HidError::ConnectionFailed {
                device: id.clone(),
                source: TransportError::Io(err.to_string()),
            })
        });

        match result {
            Ok(session) => {
                let descriptor = session.descriptor.clone();
                *self.active.lock() = Some(descriptor.clone());
                *slot = Some(session);
                self.set_state(SessionState::Open);
                guard.committed = true;
                info!(device = %descriptor.id, "device opened");
                self.events.emit(HidEvent::DeviceOpened(descriptor.clone()));
                Ok(descriptor)
            }
            Err(err) => {
                warn!(device = %id, %err, "open failed");
                Err(err)
            }
        }
    }

    /// Close whatever is open. Returns `false` (and emits nothing) when idle.
    pub async fn close(&self) -> bool {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let mut slot = self.slot.lock().await;
        match slot.take() {
            Some(session) => {
                self.teardown(session).await;
                true
            }
            None => {
                debug!("close requested with no open device");
                false
            }
        }
    }

    /// Close only if `id` is the open device.
    pub async fn close_device(&self, id: &DeviceId) -> bool {
        let mut slot = self.slot.lock().await;
        match slot.take() {
            Some(session) if &session.descriptor.id == id => {
                self.teardown(session).await;
                true
            }
            other => {
                *slot = other;
                false
            }
        }
    }

    async fn teardown(&self, mut session: Session) {
        self.set_state(SessionState::Closing);
        // Runs even if this future is dropped while the pump drains.
        let closed = MarkClosed {
            session: self,
            descriptor: session.descriptor.clone(),
        };

        session.is_open.store(false, Ordering::SeqCst);
        if let Some(exit) = session.pump.stop(self.settings.close_grace()).await {
            debug!(device = %closed.descriptor.id, ?exit, "input pump joined");
        }
        // Releases the interface and closes the connection.
        drop(session);
        drop(closed);
    }

    /// Send one output report. The transfer runs on the blocking pool.
    pub async fn send_output_report(&self, report_id: u8, payload: &[u8]) -> Result<usize, HidError> {
        let target = {
            let slot = self.slot.lock().await;
            let session = slot.as_ref().ok_or(HidError::NotOpen)?;
            if !session.is_open.load(Ordering::SeqCst) {
                return Err(HidError::NotOpen);
            }
            OutputTarget {
                connection: session.connection.clone(),
                interface: session.interface,
                endpoint: session.output.address,
            }
        };

        let wire = report::output_report(report_id, payload);
        let mode = self.settings.output_transfer;
        let timeout = self.settings.output_timeout();

        tokio::task::spawn_blocking(move || target.write(report_id, &wire, mode, timeout))
            .await
            .map_err(|err| HidError::TransferFailed(TransportError::Io(err.to_string())))?
    }
}

struct OutputTarget {
    connection: Arc<dyn UsbConnection>,
    interface: u8,
    endpoint: u8,
}

impl OutputTarget {
    fn write(
        &self,
        report_id: u8,
        wire: &[u8],
        mode: OutputTransfer,
        timeout: Duration,
    ) -> Result<usize, HidError> {
        let sent = match mode {
            OutputTransfer::SetReport => self.connection.write_control(
                report::set_report_setup(report_id, self.interface),
                wire,
                timeout,
            ),
            OutputTransfer::Interrupt => {
                self.connection.write_interrupt(self.endpoint, wire, timeout)
            }
        };
        match sent {
            Ok(n) => {
                debug!(report_id, len = n, ?mode, "output report sent");
                Ok(n)
            }
            Err(err) => {
                warn!(report_id, ?err, "output report failed");
                Err(HidError::TransferFailed(err))
            }
        }
    }
}

/// Undoes a partially completed open unless disarmed.
struct Rollback {
    connection: Arc<dyn UsbConnection>,
    claimed: Option<u8>,
    armed: bool,
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(n) = self.claimed {
            let _ = self.connection.release_interface(n);
        }
        self.connection.close();
    }
}

fn interrupt_pair(iface: &InterfaceInfo) -> Option<(EndpointInfo, EndpointInfo)> {
    let input = iface
        .endpoints
        .iter()
        .find(|e| e.is_interrupt(Direction::In))?;
    let output = iface
        .endpoints
        .iter()
        .find(|e| e.is_interrupt(Direction::Out))?;
    Some((input.clone(), output.clone()))
}

fn establish(
    backend: &dyn UsbBackend,
    info: &UsbDeviceInfo,
    events: EventSink,
    settings: &BridgeSettings,
) -> Result<Session, HidError> {
    let id = info.name.clone();

    let connection = backend
        .open(info)
        .map_err(|source| HidError::ConnectionFailed {
            device: id.clone(),
            source,
        })?;
    let mut rollback = Rollback {
        connection: connection.clone(),
        claimed: None,
        armed: true,
    };

    let iface = info
        .hid_interface()
        .ok_or_else(|| HidError::NoHidInterface(id.clone()))?;

    connection
        .claim_interface(iface.number, settings.detach_kernel_driver)
        .map_err(|source| HidError::ClaimFailed {
            device: id.clone(),
            interface: iface.number,
            source,
        })?;
    rollback.claimed = Some(iface.number);

    let (input, output) =
        interrupt_pair(iface).ok_or_else(|| HidError::EndpointsNotFound(id.clone()))?;
    debug!(device = %id, interface = iface.number, input = input.address, output = output.address, "endpoints resolved");

    let is_open = Arc::new(AtomicBool::new(true));
    let pump = InputReportPump::start(
        id.clone(),
        connection.clone(),
        &input,
        is_open.clone(),
        events,
        PumpConfig::from(settings),
    )
    .map_err(|err| HidError::ConnectionFailed {
        device: id.clone(),
        source: TransportError::Io(err.to_string()),
    })?;

    rollback.armed = false;
    Ok(Session {
        descriptor: describe(info),
        connection,
        interface: iface.number,
        output,
        is_open,
        pump,
    })
}
