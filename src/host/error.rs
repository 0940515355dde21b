//! Channel-level error types.
//!
//! Transport faults are kept separate from session-level errors so the state
//! machine can decide how each one maps onto its own taxonomy.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by a host channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The device is not present on the host.
    #[error("device not present: {0}")]
    NotFound(String),

    /// An I/O error occurred on the open channel.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel rejected the requested configuration.
    #[error("configuration rejected: {0}")]
    Config(String),

    /// A bounded read or write ran out of time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// A serialport-specific error occurred.
    #[error("serial transport error: {0}")]
    Serial(#[from] serialport::Error),
}

impl ChannelError {
    /// Create a NotFound error from a bus path.
    pub fn not_found(bus_path: impl Into<String>) -> Self {
        Self::NotFound(bus_path.into())
    }

    /// Create a Config error from a message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a Timeout error from a duration.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout(duration)
    }

    /// True when the error only means "nothing arrived in time".
    ///
    /// The read loop treats these as an empty read, not a failure.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}
