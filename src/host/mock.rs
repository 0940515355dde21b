//! Mock host implementation for tests.
//!
//! Simulates the host USB subsystem without hardware: scripted device lists,
//! permission prompts resolved by the test, injectable channel faults, and
//! counters for the assertions the lifecycle tests need (prompt collapsing,
//! monitor registration, exactly-once handle release).

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use super::error::ChannelError;
use super::{HostEvent, SerialChannel, UsbHost};
use crate::params::SerialParameters;
use crate::registry::DeviceDescriptor;

#[derive(Debug, Default)]
struct MockHostState {
    devices: Vec<DeviceDescriptor>,
    granted: Vec<String>,
    prompts: Vec<DeviceDescriptor>,
    auto_decision: Option<bool>,
    fail_next_open: bool,
    channels: HashMap<String, MockChannel>,
    monitoring: bool,
    monitor_starts: usize,
    monitor_stops: usize,
}

/// Scriptable stand-in for the host USB subsystem.
#[derive(Clone)]
pub struct MockUsbHost {
    state: Arc<Mutex<MockHostState>>,
    events: broadcast::Sender<HostEvent>,
}

impl MockUsbHost {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            state: Arc::new(Mutex::new(MockHostState::default())),
            events,
        })
    }

    /// Make `device` visible to enumeration. Emits `Attached` when the host
    /// monitor is registered.
    pub fn attach(&self, device: DeviceDescriptor) {
        let monitoring = {
            let mut state = self.state.lock();
            state.devices.push(device.clone());
            state.monitoring
        };
        if monitoring {
            let _ = self.events.send(HostEvent::Attached(device));
        }
    }

    /// Remove `device` from enumeration. Emits `Detached` when the host
    /// monitor is registered.
    pub fn detach(&self, device: &DeviceDescriptor) {
        let monitoring = {
            let mut state = self.state.lock();
            state.devices.retain(|d| !d.same_device(device));
            state.monitoring
        };
        if monitoring {
            let _ = self.events.send(HostEvent::Detached(device.clone()));
        }
    }

    /// Record permission as already granted (the fast path at open time).
    pub fn grant(&self, device: &DeviceDescriptor) {
        self.state.lock().granted.push(device.bus_path.clone());
    }

    /// Deliver the host's answer to an outstanding prompt.
    pub fn resolve_permission(&self, device: &DeviceDescriptor, granted: bool) {
        if granted {
            self.state.lock().granted.push(device.bus_path.clone());
        }
        let _ = self.events.send(HostEvent::PermissionDecision {
            device: device.clone(),
            granted,
        });
    }

    /// Resolve future prompts immediately with `granted`.
    pub fn auto_decide(&self, granted: bool) {
        self.state.lock().auto_decision = Some(granted);
    }

    /// Fail the next `open` call.
    pub fn fail_next_open(&self) {
        self.state.lock().fail_next_open = true;
    }

    /// Scripting handle for the channel `open` hands out for `device`.
    pub fn channel(&self, device: &DeviceDescriptor) -> MockChannel {
        self.state
            .lock()
            .channels
            .entry(device.bus_path.clone())
            .or_insert_with(|| MockChannel::new(&device.bus_path))
            .clone()
    }

    /// How many permission prompts the host has been asked to show.
    pub fn prompt_count(&self) -> usize {
        self.state.lock().prompts.len()
    }

    pub fn monitor_active(&self) -> bool {
        self.state.lock().monitoring
    }

    pub fn monitor_start_count(&self) -> usize {
        self.state.lock().monitor_starts
    }

    pub fn monitor_stop_count(&self) -> usize {
        self.state.lock().monitor_stops
    }
}

impl UsbHost for MockUsbHost {
    fn enumerate(&self) -> Vec<DeviceDescriptor> {
        self.state.lock().devices.clone()
    }

    fn has_permission(&self, device: &DeviceDescriptor) -> bool {
        self.state
            .lock()
            .granted
            .iter()
            .any(|path| *path == device.bus_path)
    }

    fn request_permission(&self, device: &DeviceDescriptor) {
        let decision = {
            let mut state = self.state.lock();
            state.prompts.push(device.clone());
            state.auto_decision
        };
        if let Some(granted) = decision {
            self.resolve_permission(device, granted);
        }
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn SerialChannel>, ChannelError> {
        let channel = {
            let mut state = self.state.lock();
            if state.fail_next_open {
                state.fail_next_open = false;
                return Err(ChannelError::Io(std::io::Error::other(
                    "injected open failure",
                )));
            }
            if !state.devices.iter().any(|d| d.same_device(device)) {
                return Err(ChannelError::not_found(&device.bus_path));
            }
            state
                .channels
                .entry(device.bus_path.clone())
                .or_insert_with(|| MockChannel::new(&device.bus_path))
                .clone()
        };
        channel.acquire()?;
        Ok(Box::new(MockChannelHandle { channel }))
    }

    fn events(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    fn start_monitoring(&self) {
        let mut state = self.state.lock();
        state.monitoring = true;
        state.monitor_starts += 1;
    }

    fn stop_monitoring(&self) {
        let mut state = self.state.lock();
        state.monitoring = false;
        state.monitor_stops += 1;
    }
}

impl std::fmt::Debug for MockUsbHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockUsbHost")
            .field("devices", &state.devices.len())
            .field("monitoring", &state.monitoring)
            .finish()
    }
}

#[derive(Debug, Default)]
struct MockChannelState {
    read_queue: VecDeque<Vec<u8>>,
    write_log: Vec<Vec<u8>>,
    fail_next_read: bool,
    next_write_times_out: bool,
    reject_configure: bool,
    configured: Option<SerialParameters>,
    open_handles: usize,
    close_count: usize,
}

/// Scripting side of a mock channel.
///
/// The host hands the session a [`MockChannelHandle`] sharing this state, so
/// a test can feed reads, inspect writes and count releases while the session
/// owns the handle.
#[derive(Clone)]
pub struct MockChannel {
    bus_path: String,
    state: Arc<Mutex<MockChannelState>>,
    data_ready: Arc<Condvar>,
}

impl MockChannel {
    pub fn new(bus_path: impl Into<String>) -> Self {
        Self {
            bus_path: bus_path.into(),
            state: Arc::new(Mutex::new(MockChannelState::default())),
            data_ready: Arc::new(Condvar::new()),
        }
    }

    /// Queue one inbound chunk; the next read returns it as a whole.
    pub fn push_read(&self, data: &[u8]) {
        self.state.lock().read_queue.push_back(data.to_vec());
        self.data_ready.notify_all();
    }

    /// Make the next read fail with an I/O error.
    pub fn fail_next_read(&self) {
        self.state.lock().fail_next_read = true;
        self.data_ready.notify_all();
    }

    /// Make the next write time out instead of completing.
    pub fn next_write_times_out(&self) {
        self.state.lock().next_write_times_out = true;
    }

    /// Reject the configure call, as a channel refusing the line settings.
    pub fn reject_configure(&self) {
        self.state.lock().reject_configure = true;
    }

    /// Everything written through the handle, in order.
    pub fn write_log(&self) -> Vec<Vec<u8>> {
        self.state.lock().write_log.clone()
    }

    /// The parameters the session applied, if configure ran.
    pub fn configured(&self) -> Option<SerialParameters> {
        self.state.lock().configured
    }

    /// How many times the exclusive handle has been released.
    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    /// Whether the exclusive handle is currently held.
    pub fn is_open(&self) -> bool {
        self.state.lock().open_handles > 0
    }

    fn acquire(&self) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if state.open_handles > 0 {
            return Err(ChannelError::config("channel handle already held"));
        }
        state.open_handles += 1;
        Ok(())
    }

    fn note_closed(&self) {
        let mut state = self.state.lock();
        state.open_handles -= 1;
        state.close_count += 1;
    }
}

impl std::fmt::Debug for MockChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockChannel")
            .field("bus_path", &self.bus_path)
            .field("queued_reads", &state.read_queue.len())
            .field("open_handles", &state.open_handles)
            .finish()
    }
}

/// The exclusive handle the mock host hands to the session. Dropping it is
/// the release, mirroring the real channel, and is counted for the
/// double-release assertions.
#[derive(Debug)]
pub struct MockChannelHandle {
    channel: MockChannel,
}

impl SerialChannel for MockChannelHandle {
    fn configure(&mut self, params: &SerialParameters) -> Result<(), ChannelError> {
        let mut state = self.channel.state.lock();
        if state.reject_configure {
            state.reject_configure = false;
            return Err(ChannelError::config("line settings rejected"));
        }
        state.configured = Some(*params);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.channel.state.lock();
        loop {
            if state.fail_next_read {
                state.fail_next_read = false;
                return Err(ChannelError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "injected read failure",
                )));
            }
            if let Some(chunk) = state.read_queue.pop_front() {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    state.read_queue.push_front(chunk[n..].to_vec());
                }
                return Ok(n);
            }
            if Instant::now() >= deadline {
                return Err(ChannelError::Timeout(timeout));
            }
            self.channel.data_ready.wait_until(&mut state, deadline);
        }
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, ChannelError> {
        let mut state = self.channel.state.lock();
        if state.next_write_times_out {
            state.next_write_times_out = false;
            return Err(ChannelError::Timeout(timeout));
        }
        state.write_log.push(data.to_vec());
        Ok(data.len())
    }

    fn bus_path(&self) -> &str {
        &self.channel.bus_path
    }
}

impl Drop for MockChannelHandle {
    fn drop(&mut self) {
        self.channel.note_closed();
    }
}
