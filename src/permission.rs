//! Permission negotiation with the host.
//!
//! The host is the source of truth; the broker caches only the last-observed
//! state per device identity and tolerates staleness. Concurrent requests for
//! one device collapse to a single outstanding host prompt.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::host::{HostEvent, UsbHost};
use crate::registry::DeviceDescriptor;

/// Last-observed permission state for a device identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionState {
    #[default]
    Unknown,
    Requested,
    Granted,
    Denied,
}

/// Outcome of a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Granted,
    Denied,
}

#[derive(Default)]
struct Entry {
    state: PermissionState,
    waiters: Vec<oneshot::Sender<PermissionDecision>>,
}

/// Requests and tracks OS-mediated access permission per physical device.
pub struct PermissionBroker {
    host: Arc<dyn UsbHost>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl PermissionBroker {
    /// Create the broker and start its host-event pump. Requires a running
    /// tokio runtime.
    pub fn new(host: Arc<dyn UsbHost>) -> Arc<Self> {
        let broker = Arc::new(Self {
            host: Arc::clone(&host),
            entries: Mutex::new(HashMap::new()),
        });
        let weak: Weak<Self> = Arc::downgrade(&broker);
        let mut events = host.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(HostEvent::PermissionDecision { device, granted }) => {
                        let Some(broker) = weak.upgrade() else { break };
                        broker.resolve(&device, granted);
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "permission pump lagged behind host events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        broker
    }

    /// Cached state for `device`.
    pub fn state(&self, device: &DeviceDescriptor) -> PermissionState {
        self.entries
            .lock()
            .get(&device.bus_path)
            .map(|entry| entry.state)
            .unwrap_or_default()
    }

    /// Request access to `device`.
    ///
    /// Resolves without a host round trip when permission is already recorded.
    /// Otherwise at most one prompt is outstanding per device; later callers
    /// await the same outcome. A denial is not retried here; calling again
    /// issues a fresh prompt.
    pub async fn request(&self, device: &DeviceDescriptor) -> PermissionDecision {
        if self.host.has_permission(device) {
            self.entries
                .lock()
                .entry(device.bus_path.clone())
                .or_default()
                .state = PermissionState::Granted;
            return PermissionDecision::Granted;
        }

        let (rx, issue_prompt) = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(device.bus_path.clone()).or_default();
            match entry.state {
                PermissionState::Granted => return PermissionDecision::Granted,
                PermissionState::Requested => {
                    let (tx, rx) = oneshot::channel();
                    entry.waiters.push(tx);
                    (rx, false)
                }
                PermissionState::Unknown | PermissionState::Denied => {
                    entry.state = PermissionState::Requested;
                    let (tx, rx) = oneshot::channel();
                    entry.waiters.push(tx);
                    (rx, true)
                }
            }
        };

        if issue_prompt {
            debug!(device = %device, "requesting device permission");
            self.host.request_permission(device);
        }

        // A torn-down pump means the decision can never arrive.
        rx.await.unwrap_or(PermissionDecision::Denied)
    }

    fn resolve(&self, device: &DeviceDescriptor, granted: bool) {
        let decision = if granted {
            PermissionDecision::Granted
        } else {
            PermissionDecision::Denied
        };
        let waiters = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(device.bus_path.clone()).or_default();
            entry.state = if granted {
                PermissionState::Granted
            } else {
                PermissionState::Denied
            };
            std::mem::take(&mut entry.waiters)
        };
        debug!(device = %device, granted, waiters = waiters.len(), "permission resolved");
        for waiter in waiters {
            // An abandoned request (caller cancelled its open) is fine; the
            // cache above is still updated.
            let _ = waiter.send(decision);
        }
    }
}

impl std::fmt::Debug for PermissionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionBroker")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}
