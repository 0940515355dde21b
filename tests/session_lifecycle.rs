//! End-to-end lifecycle tests against the mock host.
//!
//! These cover the full state machine: discovery, permission negotiation,
//! streaming order, unplug handling and teardown. Tests run serialized
//! because the single-active-session slot is process-wide.

mod common;

use common::{
    assert_no_event, harness, next_event, test_device, wait_until, TEST_READ_TIMEOUT,
};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::time::Instant;

use usblink::{
    DisconnectReason, ErrorKind, FailureReason, LifecycleEvent, SerialParameters, SessionError,
    SessionEvent, SessionState, UsbHost,
};

// ---- discovery ----

#[tokio::test]
#[serial]
async fn enumeration_empty_and_unknown_descriptor_fails_open() {
    let h = harness();
    assert!(h.host.enumerate().is_empty());

    // a descriptor the host never produced
    let ghost = test_device("/dev/ttyUSB9");
    let err = h
        .session
        .open(&ghost, SerialParameters::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NoDeviceFound));

    // nothing was acquired, the session is usable again
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.host.prompt_count(), 0);
}

// ---- permission ----

#[tokio::test]
#[serial]
async fn denied_permission_fails_the_open() {
    let mut h = harness();
    let device = test_device("/dev/ttyUSB0");
    h.host.attach(device.clone());

    let open = h.session.open(&device, SerialParameters::default());
    let driver = async {
        wait_until(|| h.host.prompt_count() > 0).await;
        assert_eq!(h.session.state(), SessionState::PermissionPending);
        h.host.resolve_permission(&device, false);
    };
    let (result, ()) = tokio::join!(open, driver);

    assert!(matches!(result, Err(SessionError::PermissionDenied)));
    assert_eq!(
        h.session.state(),
        SessionState::Failed(FailureReason::PermissionDenied)
    );
    assert_eq!(h.host.prompt_count(), 1);

    let denied: Vec<_> = h
        .events
        .drain()
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                SessionEvent::Lifecycle(LifecycleEvent::PermissionDenied(_))
            )
        })
        .collect();
    assert_eq!(denied.len(), 1);
}

#[tokio::test]
#[serial]
async fn granted_permission_skips_the_pending_phase() {
    let h = harness();
    let device = test_device("/dev/ttyUSB0");
    h.host.attach(device.clone());
    h.host.grant(&device);

    h.session
        .open(&device, SerialParameters::default())
        .await
        .unwrap();

    assert_eq!(h.session.state(), SessionState::Streaming);
    assert_eq!(h.host.prompt_count(), 0);
    assert_eq!(
        h.host.channel(&device).configured(),
        Some(SerialParameters::default())
    );

    h.session.close().unwrap();
}

// ---- streaming ----

#[tokio::test]
#[serial]
async fn frames_arrive_in_order_with_increasing_sequence() {
    let mut h = harness();
    let device = test_device("/dev/ttyUSB0");
    h.host.attach(device.clone());
    h.host.grant(&device);
    let channel = h.host.channel(&device);

    h.session
        .open(&device, SerialParameters::default())
        .await
        .unwrap();

    channel.push_read(&[0x41, 0x42]);
    channel.push_read(&[0x0a]);

    let first = match next_event(&mut h.events).await {
        SessionEvent::Data(frame) => frame,
        other => panic!("expected a data frame, got {other:?}"),
    };
    assert_eq!(first.sequence, 1);
    assert_eq!(first.bytes, vec![0x41, 0x42]);
    assert_eq!(first.text.as_deref(), Some("AB"));

    let second = match next_event(&mut h.events).await {
        SessionEvent::Data(frame) => frame,
        other => panic!("expected a data frame, got {other:?}"),
    };
    assert_eq!(second.sequence, 2);
    assert_eq!(second.bytes, vec![0x0a]);

    h.session.close().unwrap();
}

#[tokio::test]
#[serial]
async fn io_error_ends_the_stream_with_one_disconnect() {
    let mut h = harness();
    let device = test_device("/dev/ttyUSB0");
    h.host.attach(device.clone());
    h.host.grant(&device);
    let channel = h.host.channel(&device);

    h.session
        .open(&device, SerialParameters::default())
        .await
        .unwrap();

    channel.fail_next_read();

    match next_event(&mut h.events).await {
        SessionEvent::Error(event) => assert_eq!(event.kind, ErrorKind::Io),
        other => panic!("expected the read error, got {other:?}"),
    }
    match next_event(&mut h.events).await {
        SessionEvent::Lifecycle(LifecycleEvent::Disconnected { reason, .. }) => {
            assert_eq!(reason, DisconnectReason::Io)
        }
        other => panic!("expected Disconnected, got {other:?}"),
    }

    assert_eq!(h.session.state(), SessionState::Failed(FailureReason::Io));
    wait_until(|| channel.close_count() == 1).await;

    // the worker is gone; late data produces nothing
    channel.push_read(b"late");
    assert_no_event(&mut h.events).await;
    assert_eq!(channel.close_count(), 1);
}

#[tokio::test]
#[serial]
async fn unplug_mid_stream_matches_the_io_error_path_without_a_read_error() {
    let mut h = harness();
    let device = test_device("/dev/ttyUSB0");
    h.host.attach(device.clone());
    h.host.grant(&device);
    let channel = h.host.channel(&device);

    h.session
        .open(&device, SerialParameters::default())
        .await
        .unwrap();

    h.host.detach(&device);

    match next_event(&mut h.events).await {
        SessionEvent::Lifecycle(LifecycleEvent::Disconnected { device: d, reason }) => {
            assert_eq!(reason, DisconnectReason::DeviceDetached);
            assert!(d.same_device(&device));
        }
        other => panic!("expected Disconnected, got {other:?}"),
    }

    assert_eq!(
        h.session.state(),
        SessionState::Failed(FailureReason::DeviceDetached)
    );
    wait_until(|| channel.close_count() == 1).await;
    assert_no_event(&mut h.events).await;
}

// ---- write path ----

#[tokio::test]
#[serial]
async fn write_requires_a_streaming_session() {
    let h = harness();
    let err = h.session.send(b"hello").unwrap_err();
    assert!(matches!(err, SessionError::NotConnected));
}

#[tokio::test]
#[serial]
async fn write_goes_to_the_channel_and_timeout_is_distinct() {
    let h = harness();
    let device = test_device("/dev/ttyUSB0");
    h.host.attach(device.clone());
    h.host.grant(&device);
    let channel = h.host.channel(&device);

    h.session
        .open(&device, SerialParameters::default())
        .await
        .unwrap();

    let written = h.session.send(b"ping\n").unwrap();
    assert_eq!(written, 5);
    assert_eq!(channel.write_log(), vec![b"ping\n".to_vec()]);

    channel.next_write_times_out();
    let err = h.session.send(b"again").unwrap_err();
    assert!(matches!(err, SessionError::WriteTimeout(_)));

    h.session.close().unwrap();
}

// ---- open failures ----

#[tokio::test]
#[serial]
async fn refused_host_open_fails_the_session() {
    let h = harness();
    let device = test_device("/dev/ttyUSB0");
    h.host.attach(device.clone());
    h.host.grant(&device);
    h.host.fail_next_open();

    let err = h
        .session
        .open(&device, SerialParameters::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::ConnectionOpenFailed(_)));
    assert_eq!(
        h.session.state(),
        SessionState::Failed(FailureReason::ConnectionOpenFailed)
    );
    assert_eq!(h.host.channel(&device).close_count(), 0);
}

#[tokio::test]
#[serial]
async fn rejected_parameters_release_the_partially_acquired_handle() {
    let h = harness();
    let device = test_device("/dev/ttyUSB0");
    h.host.attach(device.clone());
    h.host.grant(&device);
    let channel = h.host.channel(&device);
    channel.reject_configure();

    let err = h
        .session
        .open(&device, SerialParameters::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::ConfigurationFailed(_)));
    assert_eq!(
        h.session.state(),
        SessionState::Failed(FailureReason::ConfigurationFailed)
    );
    // acquired, then released exactly once
    assert_eq!(channel.close_count(), 1);
    assert!(!channel.is_open());
}

#[tokio::test]
#[serial]
async fn invalid_parameters_fail_fast_without_touching_the_host() {
    let h = harness();
    let device = test_device("/dev/ttyUSB0");
    h.host.attach(device.clone());

    let params = SerialParameters {
        baud_rate: 0,
        ..SerialParameters::default()
    };
    let err = h.session.open(&device, params).await.unwrap_err();
    assert!(matches!(err, SessionError::ConfigurationFailed(_)));
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.host.prompt_count(), 0);
    assert_eq!(h.host.channel(&device).close_count(), 0);
}

// ---- invariants ----

#[tokio::test]
#[serial]
async fn at_most_one_session_is_active() {
    let h1 = harness();
    let h2 = harness();
    let device = test_device("/dev/ttyUSB0");
    h1.host.attach(device.clone());
    h1.host.grant(&device);
    let other_device = test_device("/dev/ttyACM0");
    h2.host.attach(other_device.clone());
    h2.host.grant(&other_device);

    h1.session
        .open(&device, SerialParameters::default())
        .await
        .unwrap();

    // a second session anywhere in the process is refused
    let err = h2
        .session
        .open(&other_device, SerialParameters::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::AlreadyConnected));

    // and so is reopening the active one
    let err = h1
        .session
        .open(&device, SerialParameters::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::AlreadyConnected));

    h1.session.close().unwrap();

    // the slot frees up on close
    h2.session
        .open(&other_device, SerialParameters::default())
        .await
        .unwrap();
    h2.session.close().unwrap();
}

#[tokio::test]
#[serial]
async fn close_is_idempotent() {
    let mut h = harness();
    let device = test_device("/dev/ttyUSB0");
    h.host.attach(device.clone());
    h.host.grant(&device);
    let channel = h.host.channel(&device);

    // closing an idle session is a no-op success
    h.session.close().unwrap();
    assert_eq!(h.session.state(), SessionState::Idle);

    h.session
        .open(&device, SerialParameters::default())
        .await
        .unwrap();
    h.session.close().unwrap();
    h.session.close().unwrap();

    assert_eq!(h.session.state(), SessionState::Closed);
    assert_eq!(channel.close_count(), 1);
    assert_no_event(&mut h.events).await;
}

#[tokio::test]
#[serial]
async fn cancellation_stops_the_worker_within_one_read_timeout() {
    let h = harness();
    let device = test_device("/dev/ttyUSB0");
    h.host.attach(device.clone());
    h.host.grant(&device);
    let channel = h.host.channel(&device);

    h.session
        .open(&device, SerialParameters::default())
        .await
        .unwrap();

    let started = Instant::now();
    h.session.close().unwrap();
    // close joins the worker, so returning bounds the worker's lifetime
    assert!(started.elapsed() < TEST_READ_TIMEOUT * 4);
    assert_eq!(channel.close_count(), 1);
}

#[tokio::test]
#[serial]
async fn a_closed_session_can_be_reopened() {
    let mut h = harness();
    let device = test_device("/dev/ttyUSB0");
    h.host.attach(device.clone());
    h.host.grant(&device);
    let channel = h.host.channel(&device);

    h.session
        .open(&device, SerialParameters::default())
        .await
        .unwrap();
    channel.push_read(b"first run");
    match next_event(&mut h.events).await {
        SessionEvent::Data(frame) => assert_eq!(frame.sequence, 1),
        other => panic!("expected a data frame, got {other:?}"),
    }
    h.session.close().unwrap();

    h.session
        .open(&device, SerialParameters::default())
        .await
        .unwrap();
    assert_eq!(h.session.state(), SessionState::Streaming);

    // sequence numbers restart; runs are never merged
    channel.push_read(b"second run");
    match next_event(&mut h.events).await {
        SessionEvent::Data(frame) => {
            assert_eq!(frame.sequence, 1);
            assert_eq!(frame.text.as_deref(), Some("second run"));
        }
        other => panic!("expected a data frame, got {other:?}"),
    }

    h.session.close().unwrap();
    assert_eq!(channel.close_count(), 2);
}

#[tokio::test]
#[serial]
async fn dropping_the_session_closes_it() {
    let h = harness();
    let device = test_device("/dev/ttyUSB0");
    h.host.attach(device.clone());
    h.host.grant(&device);
    let channel = h.host.channel(&device);

    h.session
        .open(&device, SerialParameters::default())
        .await
        .unwrap();
    drop(h.session);

    assert_eq!(channel.close_count(), 1);
    assert!(!channel.is_open());
}

// ---- hotplug forwarding ----

#[tokio::test]
#[serial]
async fn attach_events_reach_the_consumer_through_the_pump() {
    let host = usblink::MockUsbHost::new();
    let hotplug = usblink::HotplugEventBus::new(host.clone());
    let (sink, mut events) = usblink::EventChannel::new();
    let pump = hotplug.pump_to(sink);

    let device = test_device("/dev/ttyUSB0");
    host.attach(device.clone());

    match next_event(&mut events).await {
        SessionEvent::Lifecycle(LifecycleEvent::Attached(d)) => {
            assert!(d.same_device(&device))
        }
        other => panic!("expected Attached, got {other:?}"),
    }

    host.detach(&device);
    match next_event(&mut events).await {
        SessionEvent::Lifecycle(LifecycleEvent::Detached(d)) => {
            assert!(d.same_device(&device))
        }
        other => panic!("expected Detached, got {other:?}"),
    }

    pump.abort();
    wait_until(|| !host.monitor_active()).await;
}

#[tokio::test]
#[serial]
async fn session_monitor_subscription_is_released_on_teardown() {
    let h = harness();
    let device = test_device("/dev/ttyUSB0");
    h.host.attach(device.clone());
    h.host.grant(&device);

    assert!(!h.host.monitor_active());
    h.session
        .open(&device, SerialParameters::default())
        .await
        .unwrap();
    wait_until(|| h.host.monitor_active()).await;

    h.session.close().unwrap();
    // the implicit watcher drops its subscription once the stop signal lands
    wait_until(|| !h.host.monitor_active()).await;
}
