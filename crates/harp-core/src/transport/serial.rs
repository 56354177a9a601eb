//! Serial port handling
//!
//! Discovery of Harp boards among the host's serial ports and opening of the
//! asynchronous serial stream.

use serialport::{SerialPortInfo, SerialPortType};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, warn};

use crate::protocol::ProtocolError;

/// FTDI vendor id
const FTDI_VID: u16 = 0x0403;

/// USB-serial bridges fitted to Harp boards, as (vendor id, product id)
const HARP_BRIDGES: [(u16, u16); 2] = [
    // FT232R
    (FTDI_VID, 0x6001),
    // FT231X
    (FTDI_VID, 0x6015),
];

/// A serial port that may have a Harp device behind it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Serial number of the USB bridge, printed on the board label
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// True when the port is one of the USB bridges Harp boards ship with
    pub fn is_harp_bridge(&self) -> bool {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => HARP_BRIDGES.contains(&(vid, pid)),
            _ => false,
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
                serial_number: usb.serial_number,
            },
            _ => Self {
                name: info.port_name,
                vid: None,
                pid: None,
                serial_number: None,
            },
        }
    }
}

/// Ports backed by a Harp USB bridge, sorted by name.
///
/// Enumeration failures are logged and yield an empty list.
pub fn find_harp_ports() -> Vec<PortInfo> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(err) => {
            warn!("serial port enumeration failed: {}", err);
            return Vec::new();
        }
    };
    harp_ports(ports.into_iter().map(PortInfo::from))
}

fn harp_ports(ports: impl IntoIterator<Item = PortInfo>) -> Vec<PortInfo> {
    let mut found: Vec<PortInfo> = ports.into_iter().filter(PortInfo::is_harp_bridge).collect();
    found.sort_by(|a, b| a.name.cmp(&b.name));
    found.dedup_by(|a, b| a.name == b.name);
    debug!("found {} Harp port(s)", found.len());
    found
}

/// Open a serial port as an async stream, 8N1 without flow control
pub fn open_port(name: &str, baud_rate: u32) -> Result<SerialStream, ProtocolError> {
    debug!("opening serial port {} at {} baud", name, baud_rate);
    let stream = tokio_serial::new(name, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native_async()?;
    Ok(stream)
}
