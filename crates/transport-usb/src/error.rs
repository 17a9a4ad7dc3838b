use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("USB subsystem not available")]
    Unavailable,

    #[error("device not found: {0}")]
    NotFound(String),

    #[error("device disconnected")]
    Disconnected,

    #[error("access denied")]
    Access,

    #[error("transfer timed out")]
    Timeout,

    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("USB I/O error: {0}")]
    Io(String),
}

impl From<rusb::Error> for TransportError {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::NoDevice => TransportError::Disconnected,
            rusb::Error::Access => TransportError::Access,
            rusb::Error::Timeout => TransportError::Timeout,
            rusb::Error::NotFound => TransportError::NotFound(e.to_string()),
            rusb::Error::NotSupported => TransportError::NotSupported("operation not supported by platform"),
            other => TransportError::Io(other.to_string()),
        }
    }
}
