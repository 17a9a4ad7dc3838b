use app_core::ids::DeviceId;
use thiserror::Error;
use transport_usb::TransportError;

#[derive(Error, Debug)]
pub enum HidError {
    #[error("USB subsystem not available")]
    SubsystemUnavailable,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("permission denied for {0}")]
    PermissionDenied(DeviceId),

    #[error("permission request for {0} timed out")]
    PermissionTimedOut(DeviceId),

    #[error("failed to open connection to {device}: {source}")]
    ConnectionFailed {
        device: DeviceId,
        #[source]
        source: TransportError,
    },

    #[error("no HID interface on {0}")]
    NoHidInterface(DeviceId),

    #[error("failed to claim interface {interface} on {device}: {source}")]
    ClaimFailed {
        device: DeviceId,
        interface: u8,
        #[source]
        source: TransportError,
    },

    #[error("no interrupt IN/OUT endpoint pair on {0}")]
    EndpointsNotFound(DeviceId),

    #[error("output transfer failed: {0}")]
    TransferFailed(#[source] TransportError),

    #[error("no device open")]
    NotOpen,

    #[error("open of {0} was cancelled by close")]
    Cancelled(DeviceId),
}
