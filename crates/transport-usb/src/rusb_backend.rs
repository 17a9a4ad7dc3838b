use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use std::time::Duration;

use app_core::ids::DeviceId;
use parking_lot::RwLock;
use rusb::{Context, Device, DeviceHandle, Hotplug, HotplugBuilder, UsbContext};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    ControlSetup, Direction, EndpointInfo, InterfaceInfo, OsEvent, TransferType, TransportError,
    UsbBackend, UsbConnection, UsbDeviceInfo,
};

const HOTPLUG_POLL: Duration = Duration::from_millis(200);

/// libusb-backed implementation of [`UsbBackend`].
///
/// Desktop platforms have no permission dialog: a device is "permitted" when its
/// node can be opened, and permission requests are answered immediately on the
/// event stream.
pub struct RusbBackend {
    ctx: Option<Context>,
    events: mpsc::UnboundedSender<OsEvent>,
}

impl RusbBackend {
    pub fn new(events: mpsc::UnboundedSender<OsEvent>) -> Self {
        let ctx = match Context::new() {
            Ok(ctx) => Some(ctx),
            Err(err) => {
                warn!(?err, "libusb context unavailable");
                None
            }
        };
        Self { ctx, events }
    }

    fn context(&self) -> Result<&Context, TransportError> {
        self.ctx.as_ref().ok_or(TransportError::Unavailable)
    }

    fn find(&self, name: &DeviceId) -> Result<Device<Context>, TransportError> {
        self.context()?
            .devices()?
            .iter()
            .find(|d| device_name(d) == *name)
            .ok_or_else(|| TransportError::NotFound(name.to_string()))
    }

    /// Start delivering attach/detach events on the backend's event stream.
    ///
    /// Events stop when the returned watch is dropped.
    pub fn start_hotplug(&self) -> Result<HotplugWatch, TransportError> {
        if !rusb::has_hotplug() {
            return Err(TransportError::NotSupported("libusb built without hotplug"));
        }
        let ctx = self.context()?.clone();
        let events = self.events.clone();
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std_mpsc::channel();

        let flag = running.clone();
        let thread = thread::Builder::new()
            .name("usb-hotplug".into())
            .spawn(move || run_hotplug_thread(ctx, events, flag, ready_tx))
            .map_err(|e| TransportError::Io(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(HotplugWatch {
                running,
                thread: Some(thread),
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => Err(TransportError::Io("hotplug thread exited early".into())),
        }
    }
}

impl UsbBackend for RusbBackend {
    fn is_available(&self) -> bool {
        self.ctx.is_some()
    }

    fn devices(&self) -> Result<Vec<UsbDeviceInfo>, TransportError> {
        let list = self.context()?.devices()?;
        Ok(list
            .iter()
            .filter_map(|d| describe(&d, true))
            .collect())
    }

    fn has_permission(&self, device: &UsbDeviceInfo) -> bool {
        self.find(&device.name)
            .and_then(|d| d.open().map_err(TransportError::from))
            .is_ok()
    }

    fn request_permission(&self, device: &UsbDeviceInfo) -> Result<(), TransportError> {
        let granted = self.has_permission(device);
        debug!(device = %device.name, granted, "answering permission request");
        self.events
            .send(OsEvent::PermissionResult {
                device: device.name.clone(),
                granted,
            })
            .map_err(|_| TransportError::Io("event stream closed".into()))
    }

    fn open(&self, device: &UsbDeviceInfo) -> Result<Arc<dyn UsbConnection>, TransportError> {
        let handle = self.find(&device.name)?.open()?;
        Ok(Arc::new(RusbConnection {
            handle: RwLock::new(Some(handle)),
        }))
    }
}

/// Reads and writes share the handle; claim/release/close need it exclusively.
struct RusbConnection {
    handle: RwLock<Option<DeviceHandle<Context>>>,
}

impl UsbConnection for RusbConnection {
    fn claim_interface(&self, number: u8, force: bool) -> Result<(), TransportError> {
        let mut guard = self.handle.write();
        let handle = guard.as_mut().ok_or(TransportError::Disconnected)?;
        if force {
            // Not available on every platform; claiming may still succeed.
            if let Err(err) = handle.set_auto_detach_kernel_driver(true) {
                debug!(?err, "kernel driver auto-detach unavailable");
            }
        }
        handle.claim_interface(number)?;
        Ok(())
    }

    fn release_interface(&self, number: u8) -> Result<(), TransportError> {
        let mut guard = self.handle.write();
        let handle = guard.as_mut().ok_or(TransportError::Disconnected)?;
        handle.release_interface(number)?;
        Ok(())
    }

    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let guard = self.handle.read();
        let handle = guard.as_ref().ok_or(TransportError::Disconnected)?;
        match handle.read_interrupt(endpoint, buf, timeout) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_interrupt(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let guard = self.handle.read();
        let handle = guard.as_ref().ok_or(TransportError::Disconnected)?;
        Ok(handle.write_interrupt(endpoint, data, timeout)?)
    }

    fn write_control(
        &self,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let guard = self.handle.read();
        let handle = guard.as_ref().ok_or(TransportError::Disconnected)?;
        Ok(handle.write_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            data,
            timeout,
        )?)
    }

    fn close(&self) {
        // Dropping the handle closes it.
        self.handle.write().take();
    }
}

/// Keeps the hotplug thread alive; stops and joins it on drop.
pub struct HotplugWatch {
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Drop for HotplugWatch {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

struct HotplugForwarder {
    events: mpsc::UnboundedSender<OsEvent>,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        // No synchronous I/O is allowed inside libusb callbacks, so no strings here.
        if let Some(info) = describe(&device, false) {
            debug!(device = %info.name, "usb device arrived");
            let _ = self.events.send(OsEvent::Attached(info));
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        let name = device_name(&device);
        debug!(device = %name, "usb device left");
        let _ = self.events.send(OsEvent::Detached(name));
    }
}

fn run_hotplug_thread(
    ctx: Context,
    events: mpsc::UnboundedSender<OsEvent>,
    running: Arc<AtomicBool>,
    ready: std_mpsc::Sender<Result<(), TransportError>>,
) {
    let registration = HotplugBuilder::new()
        .enumerate(false)
        .register(&ctx, Box::new(HotplugForwarder { events }));
    let _registration = match registration {
        Ok(r) => {
            let _ = ready.send(Ok(()));
            r
        }
        Err(err) => {
            let _ = ready.send(Err(err.into()));
            return;
        }
    };

    info!("usb hotplug watch started");
    while running.load(Ordering::SeqCst) {
        if let Err(err) = ctx.handle_events(Some(HOTPLUG_POLL)) {
            warn!(?err, "libusb event handling failed");
            thread::sleep(HOTPLUG_POLL);
        }
    }
    info!("usb hotplug watch stopped");
}

fn device_name<T: UsbContext>(device: &Device<T>) -> DeviceId {
    DeviceId(format!(
        "/dev/bus/usb/{:03}/{:03}",
        device.bus_number(),
        device.address()
    ))
}

fn describe<T: UsbContext>(device: &Device<T>, read_strings: bool) -> Option<UsbDeviceInfo> {
    let desc = device.device_descriptor().ok()?;
    let interfaces = match device.active_config_descriptor() {
        Ok(config) => config
            .interfaces()
            .filter_map(|iface| {
                // Alternate setting 0 is the one in effect after claiming.
                let alt = iface.descriptors().next()?;
                Some(InterfaceInfo {
                    number: alt.interface_number(),
                    class_code: alt.class_code(),
                    endpoints: alt
                        .endpoint_descriptors()
                        .map(|ep| EndpointInfo {
                            address: ep.address(),
                            direction: match ep.direction() {
                                rusb::Direction::In => Direction::In,
                                rusb::Direction::Out => Direction::Out,
                            },
                            transfer_type: match ep.transfer_type() {
                                rusb::TransferType::Control => TransferType::Control,
                                rusb::TransferType::Isochronous => TransferType::Isochronous,
                                rusb::TransferType::Bulk => TransferType::Bulk,
                                rusb::TransferType::Interrupt => TransferType::Interrupt,
                            },
                            max_packet_size: ep.max_packet_size(),
                        })
                        .collect(),
                })
            })
            .collect(),
        Err(err) => {
            debug!(?err, "no active configuration");
            vec![]
        }
    };

    let product_string = if read_strings && desc.product_string_index().is_some() {
        device
            .open()
            .and_then(|h| h.read_product_string_ascii(&desc))
            .ok()
    } else {
        None
    };

    Some(UsbDeviceInfo {
        name: device_name(device),
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        product_string,
        interfaces,
    })
}
