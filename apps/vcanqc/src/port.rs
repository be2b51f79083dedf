//! # Serial Port Adapter
//!
//! Puts a real serial port behind the core's [`Transport`] trait and finds
//! the tester among the ports the OS reports.

use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, info};
use vcanqc_core::{QcError, Transport};

/// Per-read poll interval. The link owns the real response deadline.
const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Description used when the OS has nothing better to say about a port.
const NO_DESCRIPTION: &str = "n/a";

// =============================================================================
// TRANSPORT
// =============================================================================

/// An open serial port.
pub struct PortTransport {
    name: String,
    port: Box<dyn SerialPort>,
}

impl PortTransport {
    /// Open `name` at `baud`, 8N1, with a short read poll.
    pub fn open(name: &str, baud: u32) -> Result<Self, QcError> {
        let port = serialport::new(name, baud)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| QcError::Io(format!("cannot open {}: {}", name, e)))?;
        info!(port = name, baud, "serial port opened");
        Ok(Self {
            name: name.to_string(),
            port,
        })
    }
}

impl std::fmt::Debug for PortTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortTransport").field("name", &self.name).finish()
    }
}

impl Transport for PortTransport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

// =============================================================================
// DISCOVERY
// =============================================================================

/// A port as listed to the operator.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

impl PortInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }

    /// Ports without a description are legacy or virtual placeholders.
    pub fn is_usable(&self) -> bool {
        !self.description.is_empty() && self.description != NO_DESCRIPTION
    }
}

fn describe(kind: &SerialPortType) -> String {
    match kind {
        SerialPortType::UsbPort(usb) => usb
            .product
            .clone()
            .or_else(|| usb.manufacturer.clone())
            .unwrap_or_else(|| format!("USB {:04x}:{:04x}", usb.vid, usb.pid)),
        SerialPortType::BluetoothPort => "Bluetooth".to_string(),
        SerialPortType::PciPort => "PCI".to_string(),
        SerialPortType::Unknown => NO_DESCRIPTION.to_string(),
    }
}

/// Every usable port the OS reports.
pub fn list_ports() -> Result<Vec<PortInfo>, QcError> {
    let ports = serialport::available_ports()
        .map_err(|e| QcError::Io(format!("cannot enumerate serial ports: {}", e)))?;
    let all: Vec<PortInfo> = ports
        .into_iter()
        .map(|p| PortInfo::new(p.port_name, describe(&p.port_type)))
        .collect();
    debug!(count = all.len(), "serial ports enumerated");
    Ok(usable(all))
}

/// Drop ports without a real description.
pub fn usable(ports: Vec<PortInfo>) -> Vec<PortInfo> {
    ports.into_iter().filter(PortInfo::is_usable).collect()
}

/// The only candidate, if there is exactly one.
pub fn auto_select(ports: &[PortInfo]) -> Option<&PortInfo> {
    match ports {
        [only] => Some(only),
        _ => None,
    }
}

// =============================================================================
// TESTS
// =============================================================================
