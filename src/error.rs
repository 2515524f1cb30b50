//! Error types for the candle driver
//!
//! [`CandleError`] is returned by every device and channel operation.
//! [`TransportError`] describes USB-level failures reported by a
//! [`crate::transport::UsbHandle`] and is carried inside
//! [`CandleError::Transport`].

use thiserror::Error;

use crate::constants::request_name;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, CandleError>;

/// USB-level failure reported by a transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Transfer did not complete in time
    #[error("transfer timed out")]
    Timeout,

    /// Endpoint halted
    #[error("endpoint stalled")]
    Stall,

    /// Device was unplugged
    #[error("device disconnected")]
    Disconnected,

    /// Resource (usually the interface) is held by someone else
    #[error("resource busy")]
    Busy,

    /// Insufficient permissions
    #[error("access denied")]
    Access,

    /// Device or endpoint does not exist
    #[error("not found")]
    NotFound,

    /// Transfer was cancelled before completing
    #[error("transfer cancelled")]
    Cancelled,

    /// Device sent more data than the buffer holds
    #[error("transfer overflow")]
    Overflow,

    /// Any other failure
    #[error("{0}")]
    Other(String),
}

impl From<rusb::Error> for TransportError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => TransportError::Timeout,
            rusb::Error::Pipe => TransportError::Stall,
            rusb::Error::NoDevice => TransportError::Disconnected,
            rusb::Error::Busy => TransportError::Busy,
            rusb::Error::Access => TransportError::Access,
            rusb::Error::NotFound => TransportError::NotFound,
            rusb::Error::Interrupted => TransportError::Cancelled,
            rusb::Error::Overflow => TransportError::Overflow,
            other => TransportError::Other(other.to_string()),
        }
    }
}

/// Error types for device and channel operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CandleError {
    /// USB transfer failed
    #[error("USB transport error: {0}")]
    Transport(#[from] TransportError),

    /// Response did not have the expected shape
    #[error("protocol error on {}: expected {expected} bytes, got {actual}", request_name(*request))]
    Protocol {
        request: u8,
        expected: usize,
        actual: usize,
    },

    /// Interface is claimed elsewhere
    #[error("device is busy (interface already claimed)")]
    DeviceBusy,

    /// Device disappeared after enumeration
    #[error("device is gone")]
    DeviceGone,

    /// Device has been closed
    #[error("device is closed")]
    DeviceClosed,

    /// Operation not allowed in the current channel state
    #[error("cannot {operation} while channel is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// Value outside the range accepted by the device
    #[error("invalid {name} = {value}: {reason}")]
    InvalidParameter {
        name: &'static str,
        value: u64,
        reason: String,
    },

    /// All transmit slots are in flight
    #[error("transmit queue full")]
    QueueFull,

    /// Host frame could not be decoded
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// Device does not advertise the requested feature
    #[error("device does not support feature: {0}")]
    FeatureNotSupported(&'static str),

    /// Channel index out of range
    #[error("invalid channel number: {channel} (device has {count} channels)")]
    InvalidChannel { channel: u8, count: u8 },
}

impl CandleError {
    pub(crate) fn invalid_parameter(
        name: &'static str,
        value: impl Into<u64>,
        reason: impl Into<String>,
    ) -> Self {
        CandleError::InvalidParameter {
            name,
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, CandleError::Transport(TransportError::Timeout))
    }

    /// Check if this error originated in the USB transport
    pub fn is_transport_error(&self) -> bool {
        matches!(self, CandleError::Transport(_))
    }

    /// Check if retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, CandleError::QueueFull) || self.is_timeout()
    }

    /// Map transport failures seen while opening a device
    pub(crate) fn from_open(err: TransportError) -> Self {
        match err {
            TransportError::Busy | TransportError::Access => CandleError::DeviceBusy,
            TransportError::NotFound | TransportError::Disconnected => CandleError::DeviceGone,
            other => CandleError::Transport(other),
        }
    }
}
