//! Device links
//!
//! A [`DeviceLink`] owns the TCP session to one counter module and is driven
//! by exactly one task, so every operation takes `&mut self` and there is at
//! most one request in flight per device.

pub mod device_link;
pub mod health;
pub mod reconnect;
pub mod transport;

use std::time::Duration;

use errors::CounterError;
use thiserror::Error;

use crate::protocol::CodecError;

pub use device_link::DeviceLink;
pub use health::{DeviceHealth, LinkState};
pub use reconnect::{ReconnectGate, ReconnectPolicy, ReconnectStats};

#[derive(Debug, Error)]
pub enum LinkError {
    /// Refused locally; no network I/O happened
    #[error("Reconnect throttled, next attempt allowed in {retry_in:?}")]
    Throttled { retry_in: Duration },

    #[error("Connection to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Not connected")]
    NotConnected,
}

impl LinkError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }

    /// Modbus exception: the device answered, the session is fine
    pub fn is_exception(&self) -> bool {
        matches!(self, Self::Codec(CodecError::Exception { .. }))
    }

    /// Whether the TCP session can no longer be trusted after this error
    pub fn breaks_session(&self) -> bool {
        match self {
            Self::Throttled { .. } => false,
            Self::Codec(CodecError::Exception { .. }) => false,
            // Local request validation, nothing was sent
            Self::Codec(CodecError::InvalidQuantity(_) | CodecError::AddressOverflow { .. }) => false,
            _ => true,
        }
    }
}

impl From<LinkError> for CounterError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Connect { endpoint, reason } => {
                CounterError::ConnectionFailed { endpoint, reason }
            },
            LinkError::Timeout(after) => CounterError::Timeout(format!("device after {:?}", after)),
            LinkError::Io(e) => CounterError::Io(e),
            other => CounterError::Modbus(other.to_string()),
        }
    }
}
