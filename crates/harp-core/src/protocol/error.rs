//! Protocol errors

use thiserror::Error;

use super::{Frame, MessageType, PayloadType};

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Timed out waiting for a reply")]
    Timeout,

    #[error("Command cancelled while waiting for a reply")]
    Cancelled,

    #[error("Connection closed")]
    Closed,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error(
        "Device reported an erroneous {message_type} command on register {address} \
         (payload type {payload_type}, value {value})"
    )]
    DeviceError {
        address: u8,
        message_type: MessageType,
        payload_type: PayloadType,
        value: String,
    },

    #[error("Unexpected device: expected WhoAmI {expected}, got {actual}")]
    UnexpectedDevice { expected: u16, actual: u16 },

    #[error("Payload type mismatch: expected {expected}, got {actual}")]
    UnexpectedPayload {
        expected: PayloadType,
        actual: PayloadType,
    },

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// Build the error raised for a well-formed frame carrying the error bit.
    pub fn from_error_frame(frame: &Frame) -> Self {
        ProtocolError::DeviceError {
            address: frame.address(),
            message_type: frame.message_type().unwrap_or(MessageType::Read),
            payload_type: frame.payload_type(),
            value: frame.render_payload(),
        }
    }

    /// Whether the error was reported by the device rather than the link.
    pub fn is_device_error(&self) -> bool {
        matches!(self, ProtocolError::DeviceError { .. })
    }
}

impl From<tokio_serial::Error> for ProtocolError {
    fn from(err: tokio_serial::Error) -> Self {
        match err.kind {
            tokio_serial::ErrorKind::NoDevice => ProtocolError::PortNotFound(err.description),
            _ => ProtocolError::SerialError(err.to_string()),
        }
    }
}
