use app_core::ids::DeviceId;
use app_core::DeviceDescriptor;
use tokio::sync::mpsc;
use tracing::trace;

/// Notifications for the adaptation layer, all delivered on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HidEvent {
    DeviceOpened(DeviceDescriptor),
    DeviceClosed(DeviceDescriptor),
    /// A HID device was plugged in that is not the open one.
    DeviceConnected(DeviceDescriptor),
    DeviceDisconnected(DeviceDescriptor),
    InputReport { device: DeviceId, data: Vec<u8> },
    /// The input pump gave up after too many consecutive read failures.
    PumpFailed { device: DeviceId, consecutive_errors: u32 },
    /// The input pump stopped because the transport lost the device. The
    /// session stays bound until `close` or a detach notification.
    PumpDisconnected { device: DeviceId },
}

pub type EventStream = mpsc::UnboundedReceiver<HidEvent>;

#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<HidEvent>,
}

impl EventSink {
    pub(crate) fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn emit(&self, event: HidEvent) {
        if self.tx.send(event).is_err() {
            trace!("event receiver dropped");
        }
    }
}
