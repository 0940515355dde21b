//! Device discovery.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::host::UsbHost;

/// Stable identity for a physical USB serial device.
///
/// Immutable once enumerated; re-enumeration produces a fresh set rather than
/// patching descriptors in place. The bus path is the identity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    /// OS path of the device's serial port, e.g. `/dev/ttyUSB0` or `COM3`.
    pub bus_path: String,
    /// Human-readable product string, when the device reports one.
    pub product: Option<String>,
}

impl DeviceDescriptor {
    /// Whether both descriptors name the same physical device.
    pub fn same_device(&self, other: &DeviceDescriptor) -> bool {
        self.bus_path == other.bus_path
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.product {
            Some(product) => write!(
                f,
                "{} ({:04x}:{:04x}) at {}",
                product, self.vendor_id, self.product_id, self.bus_path
            ),
            None => write!(
                f,
                "{:04x}:{:04x} at {}",
                self.vendor_id, self.product_id, self.bus_path
            ),
        }
    }
}

/// Enumerates candidate USB serial devices currently attached to the host.
pub struct DeviceRegistry {
    host: Arc<dyn UsbHost>,
}

impl DeviceRegistry {
    pub fn new(host: Arc<dyn UsbHost>) -> Self {
        Self { host }
    }

    /// Re-queries the host on every call; nothing is cached. An empty result
    /// means no device is attached, not an error.
    pub fn enumerate(&self) -> Vec<DeviceDescriptor> {
        self.host.enumerate()
    }
}
