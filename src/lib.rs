//! USB-serial session lifecycle.
//!
//! Manages one USB-serial communication session end to end: discovering
//! attached serial-capable devices, negotiating OS-level access permission,
//! opening and configuring the byte-stream channel, streaming inbound bytes
//! to a consumer while staying cancellable, and tearing the session down
//! cleanly on request or failure, abrupt unplug included.
//!
//! # Modules
//!
//! - `registry`: device discovery
//! - `permission`: asynchronous permission negotiation with the host
//! - `hotplug`: attach/detach notifications with scoped host registration
//! - `session`: the connection state machine and its read-loop worker
//! - `events`: the consumer-facing event model and delivery channel
//! - `host`: the host USB subsystem boundary (system and mock backends)
//! - `params`: serial line parameters
//! - `config`: recognized configuration options
//! - `error`: the session error taxonomy
//!
//! # Example
//!
//! ```no_run
//! use usblink::{
//!     ConnectionSession, DeviceRegistry, EventChannel, HotplugEventBus, PermissionBroker,
//!     SerialParameters, SystemUsbHost, UsbHost,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let host: Arc<dyn UsbHost> = SystemUsbHost::new();
//! let registry = DeviceRegistry::new(Arc::clone(&host));
//! let broker = PermissionBroker::new(Arc::clone(&host));
//! let hotplug = HotplugEventBus::new(Arc::clone(&host));
//! let (sink, mut events) = EventChannel::new();
//!
//! let session = ConnectionSession::new(host, broker, hotplug, sink);
//! let device = registry.enumerate().into_iter().next().ok_or("no device")?;
//! session.open(&device, SerialParameters::default()).await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! session.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod hotplug;
pub mod params;
pub mod permission;
pub mod registry;
pub mod session;

// Re-export commonly used types for convenience
pub use config::{ConfigError, SessionConfig};
pub use error::SessionError;
pub use events::{
    DataFrame, DisconnectReason, ErrorEvent, ErrorKind, EventChannel, EventSink, LifecycleEvent,
    SessionEvent,
};
pub use host::{
    ChannelError, HostEvent, MockChannel, MockUsbHost, SerialChannel, SystemUsbHost, UsbHost,
};
pub use hotplug::{HotplugEventBus, HotplugSubscription};
pub use params::{DataBits, Parity, SerialParameters, StopBits};
pub use permission::{PermissionBroker, PermissionDecision, PermissionState};
pub use registry::{DeviceDescriptor, DeviceRegistry};
pub use session::{ConnectionSession, FailureReason, SessionState};
