//! Connection session: the state machine owning the open channel.
//!
//! A session drives one device through
//! `Idle → Opening → PermissionPending → Configuring → Streaming → Closing →
//! Closed`, with `Failed` reachable from every non-terminal phase after Idle.
//! Closed and Failed are reusable: a fresh `open` starts the machine over.
//!
//! The read loop runs on its own OS thread doing bounded-timeout reads, so a
//! cancellation signal is observed within one timeout interval. Teardown is
//! always signal → join → release: the handle is never dropped while the
//! worker can still touch it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_READ_TIMEOUT_MS, DEFAULT_WRITE_TIMEOUT_MS};
use crate::error::SessionError;
use crate::events::{
    DataFrame, DisconnectReason, ErrorKind, EventSink, LifecycleEvent, SessionEvent,
};
use crate::host::{ChannelError, SerialChannel, UsbHost};
use crate::hotplug::HotplugEventBus;
use crate::params::SerialParameters;
use crate::permission::{PermissionBroker, PermissionDecision};
use crate::registry::DeviceDescriptor;

/// Read buffer for the worker loop.
const READ_BUFFER_SIZE: usize = 1024;

/// Process-wide slot backing the single-active-session invariant: the
/// transport exposes exactly one exclusive handle per device.
static ACTIVE_SESSIONS: AtomicUsize = AtomicUsize::new(0);

/// Where the machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opening,
    PermissionPending,
    Configuring,
    Streaming,
    Closing,
    Closed,
    Failed(FailureReason),
}

impl SessionState {
    /// Terminal (and initial) states accept a fresh `open`.
    pub fn is_reopenable(self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Closed | SessionState::Failed(_)
        )
    }
}

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    PermissionDenied,
    ConnectionOpenFailed,
    ConfigurationFailed,
    Io,
    DeviceDetached,
}

struct SessionInner {
    state: Mutex<SessionState>,
    channel: Mutex<Option<Box<dyn SerialChannel>>>,
    device: Mutex<Option<DeviceDescriptor>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    /// Unplug teardown still running on the blocking pool, if any. A fresh
    /// `open` must wait for it before touching the channel slot.
    teardown: Mutex<Option<tokio::task::JoinHandle<()>>>,
    cancel: AtomicBool,
    holds_slot: AtomicBool,
    sequence: AtomicU64,
    /// Per-activation stop token; wakes the unplug watcher on teardown.
    stop_signal: Mutex<Arc<Notify>>,
    events: EventSink,
    read_timeout: Duration,
}

impl SessionInner {
    fn release_channel(&self) {
        if self.channel.lock().take().is_some() {
            debug!("channel handle released");
        }
    }

    fn release_slot(&self) {
        if self.holds_slot.swap(false, Ordering::AcqRel) {
            ACTIVE_SESSIONS.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn notify_stop(&self) {
        self.stop_signal.lock().notify_one();
    }

    /// Streaming → Failed, for the worker-error and unplug paths. False when
    /// another path already owns teardown (a close in progress, or a race
    /// that got there first), in which case the caller must emit nothing.
    fn fail_streaming(&self, reason: FailureReason) -> bool {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Streaming {
                return false;
            }
            *state = SessionState::Failed(reason);
        }
        self.release_slot();
        self.notify_stop();
        true
    }
}

/// Owns the open byte-stream channel for exactly one device at a time.
///
/// The session value is explicitly owned by its creator; nothing here is
/// ambient. Dropping it closes it.
pub struct ConnectionSession {
    host: Arc<dyn UsbHost>,
    broker: Arc<PermissionBroker>,
    hotplug: HotplugEventBus,
    inner: Arc<SessionInner>,
    write_timeout: Duration,
}

impl ConnectionSession {
    pub fn new(
        host: Arc<dyn UsbHost>,
        broker: Arc<PermissionBroker>,
        hotplug: HotplugEventBus,
        events: EventSink,
    ) -> Self {
        Self::with_timeouts(
            host,
            broker,
            hotplug,
            events,
            Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
        )
    }

    pub fn with_timeouts(
        host: Arc<dyn UsbHost>,
        broker: Arc<PermissionBroker>,
        hotplug: HotplugEventBus,
        events: EventSink,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            host,
            broker,
            hotplug,
            inner: Arc::new(SessionInner {
                state: Mutex::new(SessionState::Idle),
                channel: Mutex::new(None),
                device: Mutex::new(None),
                worker: Mutex::new(None),
                teardown: Mutex::new(None),
                cancel: AtomicBool::new(false),
                holds_slot: AtomicBool::new(false),
                sequence: AtomicU64::new(0),
                stop_signal: Mutex::new(Arc::new(Notify::new())),
                events,
                read_timeout,
            }),
            write_timeout,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == SessionState::Streaming
    }

    /// The device this session currently holds, if any.
    pub fn device(&self) -> Option<DeviceDescriptor> {
        self.inner.device.lock().clone()
    }

    /// Open a session on `descriptor`.
    ///
    /// Suspends while the host decides an outstanding permission prompt. On
    /// any failure the state machine lands in `Failed` (or back in `Idle`
    /// when nothing was acquired) and the same error is returned to the
    /// caller; permission denial is additionally reported on the event
    /// channel.
    pub async fn open(
        &self,
        descriptor: &DeviceDescriptor,
        params: SerialParameters,
    ) -> Result<(), SessionError> {
        params.validate()?;

        {
            let mut state = self.inner.state.lock();
            if !state.is_reopenable() {
                return Err(SessionError::AlreadyConnected);
            }
            if ACTIVE_SESSIONS
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(SessionError::AlreadyConnected);
            }
            self.inner.holds_slot.store(true, Ordering::Release);
            *state = SessionState::Opening;
        }

        // let any teardown from the previous run finish before the
        // cancellation flag is reset, then reap the old worker
        let teardown = self.inner.teardown.lock().take();
        if let Some(task) = teardown {
            let _ = task.await;
        }
        let worker = self.inner.worker.lock().take();
        if let Some(handle) = worker {
            let _ = handle.join();
        }
        self.inner.cancel.store(false, Ordering::Release);
        *self.inner.stop_signal.lock() = Arc::new(Notify::new());

        if !self
            .host
            .enumerate()
            .iter()
            .any(|d| d.same_device(descriptor))
        {
            debug!(device = %descriptor, "device not in enumeration");
            self.abandon_open();
            return Err(SessionError::NoDeviceFound);
        }

        if !self.host.has_permission(descriptor) {
            if !self.advance(SessionState::PermissionPending) {
                return Err(SessionError::NotConnected);
            }
            let decision = self.broker.request(descriptor).await;
            if self.inner.cancel.load(Ordering::Acquire) {
                // a concurrent close won; the broker cache keeps the outcome
                return Err(SessionError::NotConnected);
            }
            match decision {
                PermissionDecision::Denied => {
                    self.inner
                        .events
                        .lifecycle(LifecycleEvent::PermissionDenied(descriptor.clone()));
                    self.fail_open(FailureReason::PermissionDenied);
                    return Err(SessionError::PermissionDenied);
                }
                PermissionDecision::Granted => {
                    self.inner
                        .events
                        .lifecycle(LifecycleEvent::PermissionGranted(descriptor.clone()));
                }
            }
        }

        if !self.advance(SessionState::Configuring) {
            return Err(SessionError::NotConnected);
        }
        let mut channel = match self.host.open(descriptor) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(device = %descriptor, error = %e, "host refused to open channel");
                self.fail_open(FailureReason::ConnectionOpenFailed);
                return Err(SessionError::ConnectionOpenFailed(e.to_string()));
            }
        };
        if let Err(e) = channel.configure(&params) {
            warn!(device = %descriptor, error = %e, "channel rejected parameters");
            drop(channel);
            self.fail_open(FailureReason::ConfigurationFailed);
            return Err(SessionError::ConfigurationFailed(e.to_string()));
        }

        {
            let mut state = self.inner.state.lock();
            if self.inner.cancel.load(Ordering::Acquire)
                || matches!(
                    *state,
                    SessionState::Closing | SessionState::Closed | SessionState::Failed(_)
                )
            {
                drop(state);
                drop(channel);
                self.inner.release_slot();
                return Err(SessionError::NotConnected);
            }
            *self.inner.channel.lock() = Some(channel);
            *self.inner.device.lock() = Some(descriptor.clone());
            self.inner.sequence.store(0, Ordering::Release);
            *state = SessionState::Streaming;
        }

        info!(device = %descriptor, %params, "session streaming");
        self.spawn_worker(descriptor.clone());
        self.spawn_unplug_watcher(descriptor.clone());
        Ok(())
    }

    /// Write while streaming, bounded by `timeout`.
    ///
    /// A transport timeout is reported as `WriteTimeout`, distinct from an
    /// I/O failure. The write serializes against the worker's current read
    /// via the channel mutex, so it may additionally wait up to one read
    /// timeout for its turn.
    pub fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, SessionError> {
        if *self.inner.state.lock() != SessionState::Streaming {
            return Err(SessionError::NotConnected);
        }
        let mut guard = self.inner.channel.lock();
        let channel = guard.as_mut().ok_or(SessionError::NotConnected)?;
        match channel.write(data, timeout) {
            Ok(n) => Ok(n),
            Err(ChannelError::Timeout(t)) => Err(SessionError::WriteTimeout(t)),
            Err(e) => Err(SessionError::Io(e)),
        }
    }

    /// Write with the session's configured write timeout.
    pub fn send(&self, data: &[u8]) -> Result<usize, SessionError> {
        self.write(data, self.write_timeout)
    }

    /// Close the session.
    ///
    /// Idempotent: Idle, Closed and Failed are left untouched. Otherwise the
    /// worker is signalled, joined, and only then is the handle released.
    /// Safe to call concurrently with itself and with an in-flight `open` or
    /// `write`; every such race resolves to Closed with the handle released
    /// exactly once.
    pub fn close(&self) -> Result<(), SessionError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                SessionState::Idle
                | SessionState::Closed
                | SessionState::Failed(_)
                | SessionState::Closing => return Ok(()),
                _ => *state = SessionState::Closing,
            }
        }
        debug!("closing session");
        self.inner.cancel.store(true, Ordering::Release);
        let worker = self.inner.worker.lock().take();
        if let Some(handle) = worker {
            // the loop observes the signal within one bounded read
            let _ = handle.join();
        }
        self.inner.release_channel();
        *self.inner.device.lock() = None;
        *self.inner.state.lock() = SessionState::Closed;
        self.inner.release_slot();
        self.inner.notify_stop();
        info!("session closed");
        Ok(())
    }

    /// Move forward unless a concurrent close got there first.
    fn advance(&self, to: SessionState) -> bool {
        let mut state = self.inner.state.lock();
        if self.inner.cancel.load(Ordering::Acquire)
            || matches!(
                *state,
                SessionState::Closing | SessionState::Closed | SessionState::Failed(_)
            )
        {
            return false;
        }
        *state = to;
        true
    }

    /// Open failed before anything was acquired; back to Idle.
    fn abandon_open(&self) {
        {
            let mut state = self.inner.state.lock();
            if !matches!(*state, SessionState::Closing | SessionState::Closed) {
                *state = SessionState::Idle;
            }
        }
        self.inner.release_slot();
        self.inner.notify_stop();
    }

    /// Open failed after leaving Idle; land in Failed unless a concurrent
    /// close already owns the state.
    fn fail_open(&self, reason: FailureReason) {
        {
            let mut state = self.inner.state.lock();
            if !matches!(*state, SessionState::Closing | SessionState::Closed) {
                *state = SessionState::Failed(reason);
            }
        }
        self.inner.release_slot();
        self.inner.notify_stop();
    }

    fn spawn_worker(&self, device: DeviceDescriptor) {
        let inner = Arc::clone(&self.inner);
        match thread::Builder::new()
            .name("usblink-read".into())
            .spawn(move || read_loop(inner, device))
        {
            Ok(handle) => *self.inner.worker.lock() = Some(handle),
            Err(e) => warn!(error = %e, "failed to spawn read worker"),
        }
    }

    /// The session is always an implicit hotplug subscriber while streaming,
    /// so an unplug is observed even when the consumer never subscribed.
    fn spawn_unplug_watcher(&self, device: DeviceDescriptor) {
        let inner = Arc::clone(&self.inner);
        let stop = self.inner.stop_signal.lock().clone();
        let mut subscription = self.hotplug.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    event = subscription.recv() => match event {
                        Some(LifecycleEvent::Detached(d)) if d.same_device(&device) => {
                            debug!(device = %device, "open device detached");
                            // claim the whole teardown under the state lock so
                            // a reopen cannot interleave before the teardown
                            // task is registered
                            let claimed = {
                                let mut state = inner.state.lock();
                                if *state == SessionState::Streaming {
                                    *state = SessionState::Failed(
                                        FailureReason::DeviceDetached,
                                    );
                                    inner.cancel.store(true, Ordering::Release);
                                    let worker = inner.worker.lock().take();
                                    let teardown_inner = Arc::clone(&inner);
                                    let device = device.clone();
                                    // join on the blocking pool, then release;
                                    // Disconnected must outlast the final frame
                                    let task = tokio::task::spawn_blocking(move || {
                                        if let Some(handle) = worker {
                                            let _ = handle.join();
                                        }
                                        teardown_inner.release_channel();
                                        teardown_inner.events.lifecycle(
                                            LifecycleEvent::Disconnected {
                                                device,
                                                reason: DisconnectReason::DeviceDetached,
                                            },
                                        );
                                    });
                                    *inner.teardown.lock() = Some(task);
                                    true
                                } else {
                                    false
                                }
                            };
                            if claimed {
                                inner.release_slot();
                                inner.notify_stop();
                            }
                            break;
                        }
                        Some(_) => continue,
                        None => break,
                    }
                }
            }
        });
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("state", &self.state())
            .field("device", &self.device())
            .finish()
    }
}

/// The worker: bounded-timeout reads until cancelled or the transport fails.
fn read_loop(inner: Arc<SessionInner>, device: DeviceDescriptor) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    debug!(device = %device, "read worker started");
    loop {
        if inner.cancel.load(Ordering::Acquire) {
            break;
        }
        let outcome = {
            let mut guard = inner.channel.lock();
            let Some(channel) = guard.as_mut() else { break };
            channel.read(&mut buf, inner.read_timeout)
        };
        match outcome {
            Ok(0) => continue,
            Ok(n) => {
                let sequence = inner.sequence.fetch_add(1, Ordering::AcqRel) + 1;
                inner
                    .events
                    .send(SessionEvent::Data(DataFrame::new(sequence, &buf[..n])));
            }
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                if inner.cancel.load(Ordering::Acquire) {
                    // teardown in progress; the error is an artifact of it
                    break;
                }
                warn!(device = %device, error = %e, "read failed, ending stream");
                if inner.fail_streaming(FailureReason::Io) {
                    inner.release_channel();
                    inner.events.error(ErrorKind::Io, e.to_string());
                    inner.events.lifecycle(LifecycleEvent::Disconnected {
                        device: device.clone(),
                        reason: DisconnectReason::Io,
                    });
                }
                break;
            }
        }
    }
    debug!("read worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reopenable_states() {
        assert!(SessionState::Idle.is_reopenable());
        assert!(SessionState::Closed.is_reopenable());
        assert!(SessionState::Failed(FailureReason::Io).is_reopenable());
        assert!(!SessionState::Opening.is_reopenable());
        assert!(!SessionState::PermissionPending.is_reopenable());
        assert!(!SessionState::Configuring.is_reopenable());
        assert!(!SessionState::Streaming.is_reopenable());
        assert!(!SessionState::Closing.is_reopenable());
    }
}
