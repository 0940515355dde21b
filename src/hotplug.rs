//! Attach/detach notifications with scoped host registration.
//!
//! The host's device-change mechanism is registered when the first subscriber
//! appears and released when the last subscription drops. Release rides on
//! `Drop`, so it happens on every exit path, abnormal ones included.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::events::{EventSink, LifecycleEvent};
use crate::host::{HostEvent, UsbHost};

struct BusInner {
    host: Arc<dyn UsbHost>,
    subscribers: Mutex<usize>,
}

/// Republishes host attach/detach notifications as typed lifecycle events.
#[derive(Clone)]
pub struct HotplugEventBus {
    inner: Arc<BusInner>,
}

impl HotplugEventBus {
    pub fn new(host: Arc<dyn UsbHost>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                host,
                subscribers: Mutex::new(0),
            }),
        }
    }

    /// A live, cancellable notification feed. Dropping the subscription
    /// cancels it.
    pub fn subscribe(&self) -> HotplugSubscription {
        // subscribe to the feed before registering so no event falls in a gap
        let rx = self.inner.host.events();
        let mut count = self.inner.subscribers.lock();
        if *count == 0 {
            debug!("first subscriber, registering host device monitor");
            self.inner.host.start_monitoring();
        }
        *count += 1;
        HotplugSubscription {
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Forward attach/detach events onto a consumer event channel until the
    /// host feed closes or the returned task is aborted.
    pub fn pump_to(&self, sink: EventSink) -> tokio::task::JoinHandle<()> {
        let mut subscription = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                sink.lifecycle(event);
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        *self.inner.subscribers.lock()
    }
}

/// One subscriber's feed. The subscription is the registration: dropping it
/// releases the host monitor once no subscriber remains.
pub struct HotplugSubscription {
    rx: broadcast::Receiver<HostEvent>,
    inner: Arc<BusInner>,
}

impl HotplugSubscription {
    /// Next attach/detach event; None when the host event source is gone.
    pub async fn recv(&mut self) -> Option<LifecycleEvent> {
        loop {
            match self.rx.recv().await {
                Ok(HostEvent::Attached(device)) => return Some(LifecycleEvent::Attached(device)),
                Ok(HostEvent::Detached(device)) => return Some(LifecycleEvent::Detached(device)),
                Ok(HostEvent::PermissionDecision { .. }) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "hotplug subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for HotplugSubscription {
    fn drop(&mut self) {
        let mut count = self.inner.subscribers.lock();
        *count -= 1;
        if *count == 0 {
            debug!("last subscriber gone, releasing host device monitor");
            self.inner.host.stop_monitoring();
        }
    }
}
