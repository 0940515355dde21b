//! Demo consumer: stream bytes from a USB serial device to stdout.
//!
//! This binary plays the consumer seat at the session's boundary: it picks a
//! device, opens a session, drains the event channel and closes on Ctrl-C.

use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use usblink::{
    ConnectionSession, DeviceRegistry, EventChannel, HotplugEventBus, LifecycleEvent,
    PermissionBroker, SessionConfig, SessionEvent, SystemUsbHost, UsbHost,
};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Stream bytes from a USB serial device",
    long_about = "Enumerates attached USB serial devices, opens a session on one of them and \
                  prints incoming data until the device disappears or Ctrl-C is pressed."
)]
struct Args {
    /// Bus path of the device to open (defaults to the first enumerated one).
    #[arg(short, long)]
    device: Option<String>,

    /// List attached USB serial devices and exit.
    #[arg(short, long)]
    list: bool,

    /// Baud rate override.
    #[arg(short, long)]
    baud: Option<u32>,

    /// Line of text to send after connecting.
    #[arg(short, long)]
    send: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut config = SessionConfig::load()?;
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }

    let host: Arc<dyn UsbHost> = SystemUsbHost::new();
    let registry = DeviceRegistry::new(Arc::clone(&host));

    let devices = registry.enumerate();
    if args.list {
        if devices.is_empty() {
            println!("no USB serial devices attached");
        }
        for device in &devices {
            println!("{device}");
        }
        return Ok(());
    }

    let descriptor = match &args.device {
        Some(path) => devices
            .iter()
            .find(|d| d.bus_path == *path)
            .cloned()
            .ok_or_else(|| format!("device {path} not found"))?,
        None => devices
            .first()
            .cloned()
            .ok_or("no USB serial devices attached")?,
    };

    let broker = PermissionBroker::new(Arc::clone(&host));
    let hotplug = HotplugEventBus::new(Arc::clone(&host));
    let (sink, mut events) = EventChannel::new();
    let attach_pump = hotplug.pump_to(sink.clone());

    let session = ConnectionSession::with_timeouts(
        host,
        broker,
        hotplug,
        sink,
        config.read_timeout(),
        config.write_timeout(),
    );

    session
        .open(&descriptor, config.serial_parameters()?)
        .await?;
    info!(device = %descriptor, "connected, reading data");

    if let Some(line) = &args.send {
        let mut payload = line.clone().into_bytes();
        payload.push(b'\n');
        session.send(&payload)?;
    }

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(SessionEvent::Data(frame)) => match &frame.text {
                    Some(text) if !text.is_empty() => println!("{text}"),
                    _ => println!("[{} bytes]", frame.bytes.len()),
                },
                Some(SessionEvent::Lifecycle(lifecycle)) => {
                    info!(event = ?lifecycle, "lifecycle");
                    if matches!(lifecycle, LifecycleEvent::Disconnected { .. }) {
                        break;
                    }
                }
                Some(SessionEvent::Error(event)) => {
                    error!(kind = ?event.kind, "{}", event.message);
                }
                None => break,
            }
        }
    }

    attach_pump.abort();
    if let Err(e) = session.close() {
        warn!(error = %e, "close failed");
    }
    info!("disconnected");
    Ok(())
}
