//! Host USB subsystem boundary.
//!
//! Everything the crate needs from the host is expressed by the [`UsbHost`]
//! and [`SerialChannel`] traits, so the real `serialport`-backed host and the
//! mock used in tests are interchangeable.

pub mod error;
pub mod mock;
pub mod system;

pub use error::ChannelError;
pub use mock::{MockChannel, MockUsbHost};
pub use system::{SystemChannel, SystemUsbHost};

use std::time::Duration;
use tokio::sync::broadcast;

use crate::params::SerialParameters;
use crate::registry::DeviceDescriptor;

/// Notification delivered by the host subsystem.
///
/// Attach/detach events flow only while monitoring is registered; permission
/// decisions flow whenever the host produces them.
#[derive(Debug, Clone)]
pub enum HostEvent {
    Attached(DeviceDescriptor),
    Detached(DeviceDescriptor),
    PermissionDecision {
        device: DeviceDescriptor,
        granted: bool,
    },
}

/// An exclusively-owned byte-stream channel to one device.
///
/// The handle is released by dropping it. Reads and writes are bounded by the
/// caller-supplied timeout so a blocked worker stays cancellable.
pub trait SerialChannel: Send + std::fmt::Debug {
    /// Apply line parameters to the open channel.
    fn configure(&mut self, params: &SerialParameters) -> Result<(), ChannelError>;

    /// Read into `buf`, waiting at most `timeout`.
    ///
    /// A timeout surfaces as an error for which [`ChannelError::is_timeout`]
    /// is true; it is not a fault.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError>;

    /// Write `data`, waiting at most `timeout`. Returns the bytes written.
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, ChannelError>;

    /// The bus path of the device this channel belongs to.
    fn bus_path(&self) -> &str;
}

/// The host USB subsystem.
pub trait UsbHost: Send + Sync + std::fmt::Debug {
    /// All currently attached USB serial devices, in discovery order.
    fn enumerate(&self) -> Vec<DeviceDescriptor>;

    /// Whether the host already records access permission for `device`.
    fn has_permission(&self, device: &DeviceDescriptor) -> bool;

    /// Ask the host to prompt for permission. The outcome arrives later as a
    /// [`HostEvent::PermissionDecision`] correlated by device identity.
    fn request_permission(&self, device: &DeviceDescriptor);

    /// Open the device's exclusive channel handle.
    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn SerialChannel>, ChannelError>;

    /// Subscribe to the host notification feed.
    fn events(&self) -> broadcast::Receiver<HostEvent>;

    /// Register with the host's device-change notification mechanism.
    fn start_monitoring(&self);

    /// Unregister from device-change notifications.
    fn stop_monitoring(&self);
}
