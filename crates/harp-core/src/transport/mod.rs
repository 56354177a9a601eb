//! Transport
//!
//! Owns one duplex connection to a device, feeds received bytes through the
//! stream parser and delivers frames to a swappable sink.

mod connection;
pub mod serial;
mod sink;
mod stream;

pub use connection::Transport;
pub use serial::{find_harp_ports, open_port, PortInfo};
pub use sink::{FrameSink, IdentitySink, SinkTransition};
pub use stream::{open, open_stream, DeviceOptions, FrameStream, FrameWriter};

use serde::{Deserialize, Serialize};

use crate::protocol::{Frame, ProtocolError, DEFAULT_BAUD_RATE};

/// Size of the receive buffer handed to each read
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// What to do with well-formed frames carrying the error bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErrorPolicy {
    /// Deliver error replies as ordinary frames
    Ignore,
    /// Deliver error replies as [`ProtocolError::DeviceError`]
    #[default]
    Raise,
}

impl ErrorPolicy {
    /// Apply the policy to one received frame
    pub fn apply(self, frame: Frame) -> Result<Frame, ProtocolError> {
        match self {
            ErrorPolicy::Raise if frame.is_error() => Err(ProtocolError::from_error_frame(&frame)),
            _ => Ok(frame),
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Serial port name
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Receive buffer size in bytes
    pub read_buffer_size: usize,
    /// Handling of error replies
    pub error_policy: ErrorPolicy,
    /// Reject frames whose payload type is invalid, not only bad checksums
    pub check_payload_type: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            error_policy: ErrorPolicy::default(),
            check_payload_type: true,
        }
    }
}

impl TransportConfig {
    /// Default configuration for the given port
    pub fn for_port(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"port_name": "/dev/ttyUSB0", "error_policy": "Ignore"}"#)
                .unwrap();
        assert_eq!(config.port_name, "/dev/ttyUSB0");
        assert_eq!(config.error_policy, ErrorPolicy::Ignore);
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert!(config.check_payload_type);
    }

    #[test]
    fn test_raise_policy_converts_error_replies() {
        let mut bytes = Frame::write(32, 1u8).as_bytes().to_vec();
        bytes[0] |= crate::protocol::ERROR_FLAG;
        let last = bytes.len() - 1;
        bytes[last] = crate::protocol::checksum(&bytes[..last]);
        let frame = Frame::from_bytes(bytes).unwrap();

        assert!(ErrorPolicy::Ignore.apply(frame.clone()).is_ok());
        assert!(matches!(
            ErrorPolicy::Raise.apply(frame),
            Err(ProtocolError::DeviceError { address: 32, .. })
        ));
    }
}
