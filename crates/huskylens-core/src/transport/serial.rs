//! UART transport
//!
//! The HuskyLens UART runs at 9600 baud, 8N1, no flow control. A background
//! task reads the port and fans received chunks out to subscribers; writes
//! go straight to the port.

use std::collections::BTreeMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serialport::{SerialPortInfo, SerialPortType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use super::{ChannelId, Transport, DATA_CHANNEL_CAPACITY};
use crate::config::SerialConfig;
use crate::protocol::{ProtocolError, TransportError};
use crate::queue::BusyGate;

const READ_CHUNK: usize = 256;

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer string (if USB device)
    pub manufacturer: Option<String>,

    /// Product string (if USB device)
    pub product: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// Port families in the order they are offered. Numbered nodes sort
/// numerically within a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PortClass {
    /// USB-UART bridge chip
    UsbSerial(u32),
    /// USB CDC ACM device
    CdcAcm(u32),
    Other,
}

impl PortClass {
    fn of(name: &str) -> Self {
        let node = Path::new(name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(name);
        let number = |suffix: &str| suffix.parse().unwrap_or(u32::MAX);

        if let Some(suffix) = node.strip_prefix("ttyUSB") {
            PortClass::UsbSerial(number(suffix))
        } else if let Some(suffix) = node.strip_prefix("ttyACM") {
            PortClass::CdcAcm(number(suffix))
        } else {
            PortClass::Other
        }
    }
}

fn order_ports(ports: &mut [PortInfo]) {
    ports.sort_by_cached_key(|p| (PortClass::of(&p.name), p.name.clone()));
}

/// USB serial nodes present in /dev, whether or not udev announced them
#[cfg(target_os = "linux")]
fn dev_nodes() -> Vec<String> {
    let Ok(entries) = fs::read_dir("/dev") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|node| PortClass::of(node) != PortClass::Other)
        .map(|node| format!("/dev/{}", node))
        .collect()
}

/// List serial ports, USB adapters first
pub fn list_ports() -> Vec<PortInfo> {
    let mut found: BTreeMap<String, PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from)
        .map(|port| (port.name.clone(), port))
        .collect();

    #[cfg(target_os = "linux")]
    for name in dev_nodes() {
        found
            .entry(name.clone())
            .or_insert_with(|| PortInfo::bare(name));
    }

    let mut ports: Vec<PortInfo> = found.into_values().collect();
    order_ports(&mut ports);
    debug!(count = ports.len(), "Enumerated serial ports");
    ports
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// HuskyLens on a UART
pub struct SerialTransport {
    name: String,
    writer: Mutex<BoxedWriter>,
    data_tx: broadcast::Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
    gate: Arc<BusyGate>,
    reader: JoinHandle<()>,
}

impl SerialTransport {
    /// Open the configured port, or the first one found
    pub fn open(config: &SerialConfig) -> Result<Self, ProtocolError> {
        let name = match &config.port {
            Some(port) => port.clone(),
            None => list_ports()
                .into_iter()
                .next()
                .map(|p| p.name)
                .ok_or_else(|| TransportError::Serial("no serial port found".into()))?,
        };

        let stream = tokio_serial::new(&name, config.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| TransportError::Serial(format!("{}: {}", name, e)))?;

        info!(port = %name, baud = config.baud_rate, "Serial port opened");
        Ok(Self::from_stream(name, stream))
    }

    /// Run over any byte stream. Must be called from within a tokio runtime.
    pub fn from_stream<S>(name: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let name = name.into();
        let (mut read_half, write_half) = tokio::io::split(stream);
        let (data_tx, _) = broadcast::channel(DATA_CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));

        let reader = {
            let data_tx = data_tx.clone();
            let connected = Arc::clone(&connected);
            let name = name.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match read_half.read(&mut buf).await {
                        Ok(0) => {
                            debug!(port = %name, "Serial stream closed");
                            break;
                        }
                        Ok(n) => {
                            // No subscriber just means nobody is waiting
                            let _ = data_tx.send(buf[..n].to_vec());
                        }
                        Err(e) => {
                            warn!(port = %name, "Serial read failed: {}", e);
                            break;
                        }
                    }
                }
                connected.store(false, Ordering::SeqCst);
            })
        };

        Self {
            name,
            writer: Mutex::new(Box::new(write_half)),
            data_tx,
            connected,
            gate: BusyGate::shared(),
            reader,
        }
    }

    /// Port name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl Transport for SerialTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn can_write_now(&self) -> bool {
        true
    }

    async fn write(&self, _channel: ChannelId, bytes: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::Serial(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::Serial(e.to_string()))
    }

    fn on_data(&self) -> broadcast::Receiver<Vec<u8>> {
        self.data_tx.subscribe()
    }

    fn busy_gate(&self) -> Arc<BusyGate> {
        Arc::clone(&self.gate)
    }
}
