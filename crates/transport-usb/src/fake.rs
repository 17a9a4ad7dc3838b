//! In-memory USB backend for exercising the session core without hardware.
//!
//! Reads are scripted per device with [`ReadStep`]s; when a script runs dry
//! reads behave like an idle device (short sleep, then `Ok(0)`).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use app_core::ids::DeviceId;
use app_core::USB_CLASS_HID;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    ControlSetup, Direction, EndpointInfo, InterfaceInfo, OsEvent, TransferType, TransportError,
    UsbBackend, UsbConnection, UsbDeviceInfo,
};

const IDLE_READ: Duration = Duration::from_millis(2);

#[derive(Debug, Clone)]
pub enum ReadStep {
    Data(Vec<u8>),
    Empty,
    Error,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Written {
    Control { setup: ControlSetup, data: Vec<u8> },
    Interrupt { endpoint: u8, data: Vec<u8> },
}

/// How the fake answers permission requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionPolicy {
    /// Every device is already permitted.
    AlwaysGranted,
    /// Requests are recorded; an answer must be injected by the test.
    Prompt,
    /// Requests are answered right away on the event stream.
    AutoReply(bool),
}

#[derive(Default)]
struct Faults {
    fail_open: bool,
    fail_claim: bool,
    fail_writes: bool,
    open_delay: Option<Duration>,
}

struct State {
    available: bool,
    devices: Vec<UsbDeviceInfo>,
    policy: PermissionPolicy,
    granted: HashSet<DeviceId>,
    permission_requests: Vec<DeviceId>,
    scripts: HashMap<DeviceId, Vec<ReadStep>>,
    faults: Faults,
    connections: Vec<Arc<FakeConnection>>,
}

pub struct FakeUsb {
    state: Mutex<State>,
    events: Option<mpsc::UnboundedSender<OsEvent>>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

impl FakeUsb {
    pub fn new(policy: PermissionPolicy) -> Self {
        Self::build(policy, None)
    }

    /// Backend that answers `AutoReply` requests on `events`.
    pub fn with_events(policy: PermissionPolicy, events: mpsc::UnboundedSender<OsEvent>) -> Self {
        Self::build(policy, Some(events))
    }

    fn build(policy: PermissionPolicy, events: Option<mpsc::UnboundedSender<OsEvent>>) -> Self {
        Self {
            state: Mutex::new(State {
                available: true,
                devices: vec![],
                policy,
                granted: HashSet::new(),
                permission_requests: vec![],
                scripts: HashMap::new(),
                faults: Faults::default(),
                connections: vec![],
            }),
            events,
            live: Arc::new(AtomicUsize::new(0)),
            max_live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    pub fn attach(&self, info: UsbDeviceInfo) {
        let mut st = self.state.lock();
        st.devices.retain(|d| d.name != info.name);
        st.devices.push(info);
    }

    pub fn detach(&self, name: &DeviceId) {
        let mut st = self.state.lock();
        st.devices.retain(|d| &d.name != name);
        for c in st.connections.iter().filter(|c| &c.device == name) {
            c.unplug();
        }
    }

    pub fn grant(&self, name: &DeviceId) {
        self.state.lock().granted.insert(name.clone());
    }

    pub fn script_reads(&self, name: &DeviceId, steps: Vec<ReadStep>) {
        self.state.lock().scripts.insert(name.clone(), steps);
    }

    pub fn fail_open(&self, fail: bool) {
        self.state.lock().faults.fail_open = fail;
    }

    pub fn fail_claim(&self, fail: bool) {
        self.state.lock().faults.fail_claim = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().faults.fail_writes = fail;
    }

    /// Make `open` block this long before it succeeds or fails.
    pub fn delay_open(&self, delay: Option<Duration>) {
        self.state.lock().faults.open_delay = delay;
    }

    pub fn permission_requests(&self) -> Vec<DeviceId> {
        self.state.lock().permission_requests.clone()
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.state.lock().connections.clone()
    }

    pub fn last_connection(&self) -> Option<Arc<FakeConnection>> {
        self.state.lock().connections.last().cloned()
    }

    /// Highest number of simultaneously open connections seen so far.
    pub fn max_live_connections(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl UsbBackend for FakeUsb {
    fn is_available(&self) -> bool {
        self.state.lock().available
    }

    fn devices(&self) -> Result<Vec<UsbDeviceInfo>, TransportError> {
        let st = self.state.lock();
        if !st.available {
            return Err(TransportError::Unavailable);
        }
        Ok(st.devices.clone())
    }

    fn has_permission(&self, device: &UsbDeviceInfo) -> bool {
        let st = self.state.lock();
        st.policy == PermissionPolicy::AlwaysGranted || st.granted.contains(&device.name)
    }

    fn request_permission(&self, device: &UsbDeviceInfo) -> Result<(), TransportError> {
        let policy = {
            let mut st = self.state.lock();
            st.permission_requests.push(device.name.clone());
            st.policy
        };
        if let PermissionPolicy::AutoReply(granted) = policy {
            if let Some(tx) = &self.events {
                let _ = tx.send(OsEvent::PermissionResult {
                    device: device.name.clone(),
                    granted,
                });
            }
        }
        Ok(())
    }

    fn open(&self, device: &UsbDeviceInfo) -> Result<Arc<dyn UsbConnection>, TransportError> {
        let delay = self.state.lock().faults.open_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        let mut st = self.state.lock();
        if st.faults.fail_open {
            return Err(TransportError::Access);
        }
        if !st.devices.iter().any(|d| d.name == device.name) {
            return Err(TransportError::NotFound(device.name.to_string()));
        }
        let script = st.scripts.remove(&device.name).unwrap_or_default();
        let conn = Arc::new(FakeConnection {
            device: device.name.clone(),
            reads: Mutex::new(script.into()),
            writes: Mutex::new(vec![]),
            claimed: Mutex::new(vec![]),
            released: Mutex::new(vec![]),
            read_attempts: AtomicUsize::new(0),
            closed: Mutex::new(false),
            unplugged: Mutex::new(false),
            fail_claim: st.faults.fail_claim,
            fail_writes: st.faults.fail_writes,
            live: self.live.clone(),
        });
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(now, Ordering::SeqCst);
        st.connections.push(conn.clone());
        Ok(conn as Arc<dyn UsbConnection>)
    }
}

pub struct FakeConnection {
    device: DeviceId,
    reads: Mutex<VecDeque<ReadStep>>,
    writes: Mutex<Vec<Written>>,
    claimed: Mutex<Vec<u8>>,
    released: Mutex<Vec<u8>>,
    read_attempts: AtomicUsize,
    closed: Mutex<bool>,
    unplugged: Mutex<bool>,
    fail_claim: bool,
    fail_writes: bool,
    live: Arc<AtomicUsize>,
}

impl FakeConnection {
    /// A standalone connection not tracked by any backend.
    pub fn scripted(steps: Vec<ReadStep>) -> Self {
        Self {
            device: DeviceId::from("fake"),
            reads: Mutex::new(steps.into()),
            writes: Mutex::new(vec![]),
            claimed: Mutex::new(vec![]),
            released: Mutex::new(vec![]),
            read_attempts: AtomicUsize::new(0),
            closed: Mutex::new(false),
            unplugged: Mutex::new(false),
            fail_claim: false,
            fail_writes: false,
            live: Arc::new(AtomicUsize::new(1)),
        }
    }

    pub fn push_reads(&self, steps: impl IntoIterator<Item = ReadStep>) {
        self.reads.lock().extend(steps);
    }

    pub fn writes(&self) -> Vec<Written> {
        self.writes.lock().clone()
    }

    pub fn claimed(&self) -> Vec<u8> {
        self.claimed.lock().clone()
    }

    pub fn released(&self) -> Vec<u8> {
        self.released.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    pub fn read_attempts(&self) -> usize {
        self.read_attempts.load(Ordering::SeqCst)
    }

    fn unplug(&self) {
        *self.unplugged.lock() = true;
    }

    fn gone(&self) -> bool {
        *self.closed.lock() || *self.unplugged.lock()
    }
}

impl UsbConnection for FakeConnection {
    fn claim_interface(&self, number: u8, _force: bool) -> Result<(), TransportError> {
        if self.fail_claim {
            return Err(TransportError::Io("interface busy".into()));
        }
        self.claimed.lock().push(number);
        Ok(())
    }

    fn release_interface(&self, number: u8) -> Result<(), TransportError> {
        self.released.lock().push(number);
        Ok(())
    }

    fn read_interrupt(
        &self,
        _endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.read_attempts.fetch_add(1, Ordering::SeqCst);
        if self.gone() {
            return Err(TransportError::Disconnected);
        }
        let step = self.reads.lock().pop_front();
        match step {
            Some(ReadStep::Data(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Some(ReadStep::Empty) => Ok(0),
            Some(ReadStep::Error) => Err(TransportError::Io("scripted read failure".into())),
            Some(ReadStep::Disconnect) => Err(TransportError::Disconnected),
            None => {
                thread::sleep(timeout.min(IDLE_READ));
                Ok(0)
            }
        }
    }

    fn write_interrupt(
        &self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        if self.gone() {
            return Err(TransportError::Disconnected);
        }
        if self.fail_writes {
            return Err(TransportError::Io("scripted write failure".into()));
        }
        self.writes.lock().push(Written::Interrupt {
            endpoint,
            data: data.to_vec(),
        });
        Ok(data.len())
    }

    fn write_control(
        &self,
        setup: ControlSetup,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        if self.gone() {
            return Err(TransportError::Disconnected);
        }
        if self.fail_writes {
            return Err(TransportError::Io("scripted write failure".into()));
        }
        self.writes.lock().push(Written::Control {
            setup,
            data: data.to_vec(),
        });
        Ok(data.len())
    }

    fn close(&self) {
        let mut closed = self.closed.lock();
        if !*closed {
            *closed = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A HID device with one interface carrying interrupt IN 0x81 / OUT 0x01.
pub fn hid_device(name: &str, vendor_id: u16, product_id: u16) -> UsbDeviceInfo {
    UsbDeviceInfo {
        name: DeviceId::from(name),
        vendor_id,
        product_id,
        product_string: Some(format!("HID {vendor_id:04x}:{product_id:04x}")),
        interfaces: vec![InterfaceInfo {
            number: 0,
            class_code: USB_CLASS_HID,
            endpoints: vec![
                EndpointInfo {
                    address: 0x81,
                    direction: Direction::In,
                    transfer_type: TransferType::Interrupt,
                    max_packet_size: 64,
                },
                EndpointInfo {
                    address: 0x01,
                    direction: Direction::Out,
                    transfer_type: TransferType::Interrupt,
                    max_packet_size: 64,
                },
            ],
        }],
    }
}

/// A mass-storage style device with no HID interface.
pub fn storage_device(name: &str, vendor_id: u16, product_id: u16) -> UsbDeviceInfo {
    UsbDeviceInfo {
        name: DeviceId::from(name),
        vendor_id,
        product_id,
        product_string: Some("Mass Storage".into()),
        interfaces: vec![InterfaceInfo {
            number: 0,
            class_code: 0x08,
            endpoints: vec![
                EndpointInfo {
                    address: 0x82,
                    direction: Direction::In,
                    transfer_type: TransferType::Bulk,
                    max_packet_size: 512,
                },
                EndpointInfo {
                    address: 0x02,
                    direction: Direction::Out,
                    transfer_type: TransferType::Bulk,
                    max_packet_size: 512,
                },
            ],
        }],
    }
}
