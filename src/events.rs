//! Consumer-facing event model and delivery channel.
//!
//! The four-method listener interface a host UI would traditionally implement
//! is modeled as one tagged event stream instead: new event kinds extend a
//! closed enum rather than forcing every implementer to grow a method.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use crate::registry::DeviceDescriptor;

/// One chunk of inbound bytes, in arrival order.
#[derive(Debug, Clone)]
pub struct DataFrame {
    /// Arrival sequence number, starting at 1 for each streaming run.
    pub sequence: u64,
    /// The raw bytes as read from the transport.
    pub bytes: Vec<u8>,
    /// Best-effort text decode for display, whitespace-trimmed. None when the
    /// bytes are not valid UTF-8; the raw bytes are always preserved.
    pub text: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl DataFrame {
    pub fn new(sequence: u64, bytes: &[u8]) -> Self {
        let text = match std::str::from_utf8(bytes) {
            Ok(s) => Some(s.trim().to_string()),
            Err(_) => {
                debug!(sequence, "frame is not valid UTF-8, skipping text decode");
                None
            }
        };
        Self {
            sequence,
            bytes: bytes.to_vec(),
            text,
            received_at: Utc::now(),
        }
    }
}

/// Why a streaming session ended without an explicit close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The transport failed mid-stream.
    Io,
    /// The device was physically unplugged.
    DeviceDetached,
}

/// Device and session lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Attached(DeviceDescriptor),
    Detached(DeviceDescriptor),
    PermissionGranted(DeviceDescriptor),
    PermissionDenied(DeviceDescriptor),
    /// Always the last event of a streaming run that ends abnormally.
    Disconnected {
        device: DeviceDescriptor,
        reason: DisconnectReason,
    },
}

/// Error category mirrored onto the event stream for faults that have no
/// caller to return to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NoDeviceFound,
    PermissionDenied,
    ConnectionOpenFailed,
    ConfigurationFailed,
    Io,
    WriteTimeout,
    AlreadyConnected,
    NotConnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
}

/// Everything a consumer can observe about a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Data(DataFrame),
    Lifecycle(LifecycleEvent),
    Error(ErrorEvent),
}

/// Producer half of the event channel. Cheap to clone; held by the read-loop
/// worker and the broker/hotplug forwarding paths.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    /// Deliver one event. A consumer that has gone away is not an error.
    pub fn send(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            debug!("event dropped, consumer is gone");
        }
    }

    pub fn lifecycle(&self, event: LifecycleEvent) {
        self.send(SessionEvent::Lifecycle(event));
    }

    pub fn error(&self, kind: ErrorKind, message: impl Into<String>) {
        self.send(SessionEvent::Error(ErrorEvent {
            kind,
            message: message.into(),
        }));
    }
}

/// Consumer half: an ordered, drainable queue decoupling the worker's thread
/// of execution from the consumer's.
///
/// Delivery preserves each producer's own ordering; interleaving across
/// producers is unspecified. The queue is unbounded (backpressure is out of
/// scope here).
#[derive(Debug)]
pub struct EventChannel {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventChannel {
    pub fn new() -> (EventSink, EventChannel) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink { tx }, EventChannel { rx })
    }

    /// Next event, waiting until one arrives. None when every producer is
    /// gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Take everything currently queued.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }

    /// Discard everything currently queued.
    pub fn clear(&mut self) {
        while self.try_recv().is_some() {}
    }
}
