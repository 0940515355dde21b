//! Crate-level error taxonomy.
//!
//! `SessionError` is what `open`/`write`/`close` return synchronously to the
//! caller. Faults inside the read-loop worker have no caller to return to and
//! surface through the event channel instead.

use std::time::Duration;
use thiserror::Error;

use crate::host::ChannelError;

/// Errors returned by session-level operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Enumeration did not yield the requested device at open time.
    #[error("no matching USB serial device found")]
    NoDeviceFound,

    /// The host (or the user behind it) refused access to the device.
    #[error("permission to access the device was denied")]
    PermissionDenied,

    /// The host refused to hand out a channel handle.
    #[error("failed to open device channel: {0}")]
    ConnectionOpenFailed(String),

    /// Invalid serial parameters, or the channel rejected them.
    #[error("invalid or rejected serial parameters: {0}")]
    ConfigurationFailed(String),

    /// A read or write failed while streaming.
    #[error("I/O error: {0}")]
    Io(#[source] ChannelError),

    /// A bounded write did not complete in time. Distinct from an I/O failure.
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// A session already holds the device slot.
    #[error("a session is already connected")]
    AlreadyConnected,

    /// The operation requires a streaming session.
    #[error("session is not connected")]
    NotConnected,
}
