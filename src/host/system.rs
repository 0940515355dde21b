//! `serialport`-backed host implementation.
//!
//! Enumeration leans on the serialport crate's USB probing: only ports the
//! probe attributes to a USB bridge are reported, everything else (PCI UARTs,
//! pseudo terminals) is filtered out. Desktop hosts have no interactive
//! permission prompt; access control happens when the device node is opened,
//! so permission requests resolve to an immediate grant and a refused open
//! surfaces on the open call itself.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::error::ChannelError;
use super::{HostEvent, SerialChannel, UsbHost};
use crate::params::{DataBits, Parity, SerialParameters, StopBits};
use crate::registry::DeviceDescriptor;

/// Capacity of the host notification feed.
const EVENT_BUFFER_SIZE: usize = 64;

/// How often the monitor thread re-enumerates when watching for hotplug.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Host implementation backed by the operating system's serial subsystem.
pub struct SystemUsbHost {
    events: broadcast::Sender<HostEvent>,
    monitor: Mutex<Option<MonitorHandle>>,
    poll_interval: Duration,
}

struct MonitorHandle {
    stop: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl SystemUsbHost {
    pub fn new() -> Arc<Self> {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// The OS has no push notification for serial hotplug that works across
    /// platforms, so attach/detach is detected by re-enumerating on an
    /// interval and diffing.
    pub fn with_poll_interval(poll_interval: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Arc::new(Self {
            events,
            monitor: Mutex::new(None),
            poll_interval,
        })
    }
}

fn probe_usb_ports() -> Vec<DeviceDescriptor> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .iter()
            .filter_map(|info| match &info.port_type {
                serialport::SerialPortType::UsbPort(usb) => Some(DeviceDescriptor {
                    vendor_id: usb.vid,
                    product_id: usb.pid,
                    bus_path: info.port_name.clone(),
                    product: usb.product.clone(),
                }),
                _ => None,
            })
            .collect(),
        Err(e) => {
            warn!(error = %e, "USB enumeration failed");
            Vec::new()
        }
    }
}

impl UsbHost for SystemUsbHost {
    fn enumerate(&self) -> Vec<DeviceDescriptor> {
        probe_usb_ports()
    }

    fn has_permission(&self, _device: &DeviceDescriptor) -> bool {
        // No prompt on desktop hosts; the open call is the gate.
        true
    }

    fn request_permission(&self, device: &DeviceDescriptor) {
        let _ = self.events.send(HostEvent::PermissionDecision {
            device: device.clone(),
            granted: true,
        });
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn SerialChannel>, ChannelError> {
        let port = serialport::new(&device.bus_path, 115_200)
            .timeout(Duration::from_millis(1000))
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => ChannelError::not_found(&device.bus_path),
                serialport::ErrorKind::InvalidInput => ChannelError::config(e.to_string()),
                _ => ChannelError::Serial(e),
            })?;

        Ok(Box::new(SystemChannel {
            port,
            bus_path: device.bus_path.clone(),
        }))
    }

    fn events(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    fn start_monitoring(&self) {
        let mut guard = self.monitor.lock();
        if guard.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let events = self.events.clone();
        let interval = self.poll_interval;
        let thread = thread::spawn(move || {
            debug!("hotplug monitor started");
            let mut known: HashMap<String, DeviceDescriptor> = probe_usb_ports()
                .into_iter()
                .map(|d| (d.bus_path.clone(), d))
                .collect();
            while !stop_flag.load(Ordering::Acquire) {
                thread::sleep(interval);
                let current: HashMap<String, DeviceDescriptor> = probe_usb_ports()
                    .into_iter()
                    .map(|d| (d.bus_path.clone(), d))
                    .collect();
                for (path, device) in &current {
                    if !known.contains_key(path) {
                        let _ = events.send(HostEvent::Attached(device.clone()));
                    }
                }
                for (path, device) in &known {
                    if !current.contains_key(path) {
                        let _ = events.send(HostEvent::Detached(device.clone()));
                    }
                }
                known = current;
            }
            debug!("hotplug monitor stopped");
        });
        *guard = Some(MonitorHandle { stop, thread });
    }

    fn stop_monitoring(&self) {
        if let Some(handle) = self.monitor.lock().take() {
            handle.stop.store(true, Ordering::Release);
            let _ = handle.thread.join();
        }
    }
}

impl std::fmt::Debug for SystemUsbHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemUsbHost")
            .field("monitoring", &self.monitor.lock().is_some())
            .finish()
    }
}

impl Drop for SystemUsbHost {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

/// Channel handle wrapping the OS serial port.
pub struct SystemChannel {
    port: Box<dyn serialport::SerialPort>,
    bus_path: String,
}

impl SerialChannel for SystemChannel {
    fn configure(&mut self, params: &SerialParameters) -> Result<(), ChannelError> {
        self.port.set_baud_rate(params.baud_rate)?;
        self.port.set_data_bits(convert_data_bits(params.data_bits))?;
        self.port.set_stop_bits(convert_stop_bits(params.stop_bits)?)?;
        self.port.set_parity(convert_parity(params.parity)?)?;
        self.port.set_flow_control(serialport::FlowControl::None)?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError> {
        self.port.set_timeout(timeout)?;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) =>
            {
                Err(ChannelError::Timeout(timeout))
            }
            Err(e) => Err(ChannelError::Io(e)),
        }
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, ChannelError> {
        self.port.set_timeout(timeout)?;
        match self.port.write(data) {
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) =>
            {
                Err(ChannelError::Timeout(timeout))
            }
            Err(e) => Err(ChannelError::Io(e)),
        }
    }

    fn bus_path(&self) -> &str {
        &self.bus_path
    }
}

impl std::fmt::Debug for SystemChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemChannel")
            .field("bus_path", &self.bus_path)
            .field("baud_rate", &self.port.baud_rate().ok())
            .finish()
    }
}

// Conversions into the serialport crate's parameter types. The fallible ones
// cover line settings the desktop backend cannot express.

fn convert_data_bits(bits: DataBits) -> serialport::DataBits {
    match bits {
        DataBits::Five => serialport::DataBits::Five,
        DataBits::Six => serialport::DataBits::Six,
        DataBits::Seven => serialport::DataBits::Seven,
        DataBits::Eight => serialport::DataBits::Eight,
    }
}

fn convert_stop_bits(bits: StopBits) -> Result<serialport::StopBits, ChannelError> {
    match bits {
        StopBits::One => Ok(serialport::StopBits::One),
        StopBits::Two => Ok(serialport::StopBits::Two),
        StopBits::OnePointFive => Err(ChannelError::config(
            "1.5 stop bits not supported by this host",
        )),
    }
}

fn convert_parity(parity: Parity) -> Result<serialport::Parity, ChannelError> {
    match parity {
        Parity::None => Ok(serialport::Parity::None),
        Parity::Odd => Ok(serialport::Parity::Odd),
        Parity::Even => Ok(serialport::Parity::Even),
        Parity::Mark | Parity::Space => Err(ChannelError::config(
            "mark/space parity not supported by this host",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_bits_conversion() {
        assert_eq!(
            convert_data_bits(DataBits::Eight),
            serialport::DataBits::Eight
        );
        assert_eq!(convert_data_bits(DataBits::Five), serialport::DataBits::Five);
    }

    #[test]
    fn test_stop_bits_conversion() {
        assert_eq!(
            convert_stop_bits(StopBits::One).unwrap(),
            serialport::StopBits::One
        );
        assert_eq!(
            convert_stop_bits(StopBits::Two).unwrap(),
            serialport::StopBits::Two
        );
        assert!(convert_stop_bits(StopBits::OnePointFive).is_err());
    }

    #[test]
    fn test_parity_conversion() {
        assert_eq!(convert_parity(Parity::Even).unwrap(), serialport::Parity::Even);
        assert!(convert_parity(Parity::Mark).is_err());
        assert!(convert_parity(Parity::Space).is_err());
    }

    #[test]
    fn test_open_missing_device_fails() {
        let host = SystemUsbHost::new();
        let device = DeviceDescriptor {
            vendor_id: 0x0403,
            product_id: 0x6001,
            bus_path: "/dev/nonexistent_usblink_port".into(),
            product: None,
        };
        assert!(host.open(&device).is_err());
    }

    #[test]
    fn test_monitoring_starts_and_stops() {
        let host = SystemUsbHost::with_poll_interval(Duration::from_millis(10));
        host.start_monitoring();
        // second start is a no-op, not a second thread
        host.start_monitoring();
        host.stop_monitoring();
        host.stop_monitoring();
    }
}
