//! Shared test utilities for the session lifecycle tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use usblink::{
    ConnectionSession, DeviceDescriptor, EventChannel, HotplugEventBus, MockUsbHost,
    PermissionBroker, SessionEvent,
};

/// Short timeouts keep the lifecycle tests fast while still exercising the
/// bounded-read cancellation path.
pub const TEST_READ_TIMEOUT: Duration = Duration::from_millis(50);
pub const TEST_WRITE_TIMEOUT: Duration = Duration::from_millis(50);

pub struct Harness {
    pub host: Arc<MockUsbHost>,
    pub session: ConnectionSession,
    pub events: EventChannel,
}

/// A full wiring against the mock host. Needs a running tokio runtime for
/// the broker's event pump.
pub fn harness() -> Harness {
    let host = MockUsbHost::new();
    let broker = PermissionBroker::new(host.clone());
    let hotplug = HotplugEventBus::new(host.clone());
    let (sink, events) = EventChannel::new();
    let session = ConnectionSession::with_timeouts(
        host.clone(),
        broker,
        hotplug,
        sink,
        TEST_READ_TIMEOUT,
        TEST_WRITE_TIMEOUT,
    );
    Harness {
        host,
        session,
        events,
    }
}

pub fn test_device(path: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id: 0x2341,
        product_id: 0x0043,
        bus_path: path.into(),
        product: Some("Uno".into()),
    }
}

/// Next event, or panic after two seconds.
pub async fn next_event(events: &mut EventChannel) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Assert that nothing arrives for a while.
pub async fn assert_no_event(events: &mut EventChannel) {
    if let Ok(event) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
        panic!("expected silence, got {event:?}");
    }
}

/// Poll `condition` until it holds, or panic after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within 2s");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
