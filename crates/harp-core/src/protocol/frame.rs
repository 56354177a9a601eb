//! Frame encoding/decoding
//!
//! A [`Frame`] is one immutable wire message. Frames are built through the
//! constructors below and inspected through fixed-offset getters; nothing
//! mutates a frame once it exists.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::payload::{decode_timestamp, encode_timestamp, render_payload, PayloadValue, Timestamped};
use super::{ProtocolError, HEADER_SIZE, MAX_FRAME_SIZE, MIN_FRAME_SIZE, TIMESTAMP_SIZE};

/// Bit set on the message type of replies reporting an error
pub const ERROR_FLAG: u8 = 0x08;

/// Port value used by host-originated commands
pub const HOST_PORT: u8 = 255;

/// Kind of a protocol message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Register read request or reply
    Read = 1,
    /// Register write request or reply
    Write = 2,
    /// Unsolicited device event
    Event = 3,
}

impl MessageType {
    /// Decode the kind from a message type byte, ignoring the error flag
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte & !ERROR_FLAG {
            1 => Some(MessageType::Read),
            2 => Some(MessageType::Write),
            3 => Some(MessageType::Event),
            _ => None,
        }
    }

    /// Whether a header byte is a message type, optionally with the error flag,
    /// and carries no other bits.
    pub fn is_header_byte(byte: u8) -> bool {
        matches!(byte, 1..=3 | 0x09..=0x0B)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Read => write!(f, "read"),
            MessageType::Write => write!(f, "write"),
            MessageType::Event => write!(f, "event"),
        }
    }
}

/// Payload type byte: element size, signedness, float and timestamp flags
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadType(u8);

impl PayloadType {
    /// Bits holding the element size in bytes
    pub const SIZE_MASK: u8 = 0x0F;
    /// Payload starts with a 6-byte timestamp
    pub const TIMESTAMP_FLAG: u8 = 0x10;
    /// Unused; never set in a valid payload type
    pub const RESERVED_FLAG: u8 = 0x20;
    /// IEEE 754 elements
    pub const FLOAT_FLAG: u8 = 0x40;
    /// Two's complement elements
    pub const SIGNED_FLAG: u8 = 0x80;

    /// Unsigned 8-bit
    pub const U8: Self = Self(0x01);
    /// Signed 8-bit
    pub const S8: Self = Self(0x81);
    /// Unsigned 16-bit
    pub const U16: Self = Self(0x02);
    /// Signed 16-bit
    pub const S16: Self = Self(0x82);
    /// Unsigned 32-bit
    pub const U32: Self = Self(0x04);
    /// Signed 32-bit
    pub const S32: Self = Self(0x84);
    /// Unsigned 64-bit
    pub const U64: Self = Self(0x08);
    /// Signed 64-bit
    pub const S64: Self = Self(0x88);
    /// 32-bit float
    pub const FLOAT: Self = Self(0x44);

    /// Wrap a raw payload type byte
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw payload type byte
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Size in bytes of one payload element
    pub const fn element_size(self) -> usize {
        (self.0 & Self::SIZE_MASK) as usize
    }

    /// True when the timestamp flag is set
    pub const fn is_timestamped(self) -> bool {
        self.0 & Self::TIMESTAMP_FLAG != 0
    }

    /// True for float elements
    pub const fn is_float(self) -> bool {
        self.0 & Self::FLOAT_FLAG != 0
    }

    /// True for signed integer elements
    pub const fn is_signed(self) -> bool {
        self.0 & Self::SIGNED_FLAG != 0
    }

    /// Same element type with the timestamp flag set
    pub const fn timestamped(self) -> Self {
        Self(self.0 | Self::TIMESTAMP_FLAG)
    }

    /// Same element type with the timestamp flag cleared
    pub const fn untimestamped(self) -> Self {
        Self(self.0 & !Self::TIMESTAMP_FLAG)
    }

    /// Element size is one of 1, 2, 4 or 8 and the reserved bit is clear
    pub const fn is_valid(self) -> bool {
        matches!(self.element_size(), 1 | 2 | 4 | 8) && self.0 & Self::RESERVED_FLAG == 0
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.untimestamped() {
            Self::U8 => "U8",
            Self::S8 => "S8",
            Self::U16 => "U16",
            Self::S16 => "S16",
            Self::U32 => "U32",
            Self::S32 => "S32",
            Self::U64 => "U64",
            Self::S64 => "S64",
            Self::FLOAT => "Float",
            _ => return write!(f, "{:#04x}", self.0),
        };
        if self.is_timestamped() {
            write!(f, "Timestamped{}", name)
        } else {
            f.write_str(name)
        }
    }
}

impl fmt::Debug for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadType({})", self)
    }
}

/// Truncated 8-bit sum of a byte slice
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// One complete protocol message
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    bytes: Bytes,
}

impl Frame {
    /// Wrap raw bytes received from the wire.
    ///
    /// The buffer must be non-empty and its length byte must agree with its
    /// actual size. Checksum and type validity are reported by
    /// [`Frame::is_valid`], not enforced here.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(ProtocolError::InvalidFrame("empty buffer".to_string()));
        }
        if bytes.len() < MIN_FRAME_SIZE {
            return Err(ProtocolError::InvalidFrame(format!(
                "{} bytes is shorter than the minimum frame",
                bytes.len()
            )));
        }
        if bytes[1] as usize + 2 != bytes.len() {
            return Err(ProtocolError::InvalidFrame(format!(
                "length byte {} does not match buffer of {} bytes",
                bytes[1],
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    /// Encode a frame from its fields and raw payload bytes.
    ///
    /// When `timestamp` is given, the timestamp flag is added to the payload
    /// type and the 6-byte time prefix is written before the payload.
    pub fn encode(
        message_type: MessageType,
        address: u8,
        port: u8,
        payload_type: PayloadType,
        timestamp: Option<f64>,
        payload: &[u8],
    ) -> Result<Self, ProtocolError> {
        let payload_type = match timestamp {
            Some(_) => payload_type.timestamped(),
            None => payload_type,
        };
        let total = HEADER_SIZE
            + if timestamp.is_some() { TIMESTAMP_SIZE } else { 0 }
            + payload.len()
            + 1;
        if total > MAX_FRAME_SIZE {
            return Err(ProtocolError::InvalidFrame(format!(
                "payload of {} bytes does not fit in one frame",
                payload.len()
            )));
        }

        Ok(Self::assemble(
            message_type,
            address,
            port,
            payload_type,
            timestamp,
            payload,
        ))
    }

    /// Lay out a frame whose size is already known to fit the length byte.
    fn assemble(
        message_type: MessageType,
        address: u8,
        port: u8,
        payload_type: PayloadType,
        timestamp: Option<f64>,
        payload: &[u8],
    ) -> Self {
        let total = HEADER_SIZE
            + if timestamp.is_some() { TIMESTAMP_SIZE } else { 0 }
            + payload.len()
            + 1;
        let mut bytes = Vec::with_capacity(total);
        bytes.push(message_type as u8);
        bytes.push((total - 2) as u8);
        bytes.push(address);
        bytes.push(port);
        bytes.push(payload_type.bits());
        if let Some(seconds) = timestamp {
            bytes.extend_from_slice(&encode_timestamp(seconds));
        }
        bytes.extend_from_slice(payload);
        bytes.push(checksum(&bytes));

        Self {
            bytes: Bytes::from(bytes),
        }
    }

    /// Read request for a register of the given payload type
    pub fn read(address: u8, payload_type: PayloadType) -> Self {
        Self::assemble(MessageType::Read, address, HOST_PORT, payload_type, None, &[])
    }

    /// Read request typed by the register's value kind
    pub fn read_register<T: PayloadValue>(address: u8) -> Self {
        Self::read(address, T::PAYLOAD_TYPE)
    }

    /// Write request carrying one value
    pub fn write<T: PayloadValue>(address: u8, value: T) -> Self {
        Self::with_value(MessageType::Write, address, value)
    }

    /// Write request carrying an array of values
    pub fn write_array<T: PayloadValue>(address: u8, values: &[T]) -> Result<Self, ProtocolError> {
        Self::with_values(MessageType::Write, address, HOST_PORT, values)
    }

    /// Single-value frame addressed from the host port
    pub fn with_value<T: PayloadValue>(message_type: MessageType, address: u8, value: T) -> Self {
        Self::with_value_at_port(message_type, address, HOST_PORT, value)
    }

    /// Single-value frame with an explicit port
    pub fn with_value_at_port<T: PayloadValue>(
        message_type: MessageType,
        address: u8,
        port: u8,
        value: T,
    ) -> Self {
        let mut payload = Vec::with_capacity(T::SIZE);
        value.write_le(&mut payload);
        Self::assemble(message_type, address, port, T::PAYLOAD_TYPE, None, &payload)
    }

    /// Single-value frame carrying a timestamp
    pub fn with_timestamped_value<T: PayloadValue>(
        message_type: MessageType,
        address: u8,
        port: u8,
        seconds: f64,
        value: T,
    ) -> Self {
        let mut payload = Vec::with_capacity(T::SIZE);
        value.write_le(&mut payload);
        Self::assemble(
            message_type,
            address,
            port,
            T::PAYLOAD_TYPE.timestamped(),
            Some(seconds),
            &payload,
        )
    }

    /// Array frame with an explicit port
    pub fn with_values<T: PayloadValue>(
        message_type: MessageType,
        address: u8,
        port: u8,
        values: &[T],
    ) -> Result<Self, ProtocolError> {
        let payload = encode_values(values);
        Self::encode(message_type, address, port, T::PAYLOAD_TYPE, None, &payload)
    }

    /// Array frame carrying a timestamp
    pub fn with_timestamped_values<T: PayloadValue>(
        message_type: MessageType,
        address: u8,
        port: u8,
        seconds: f64,
        values: &[T],
    ) -> Result<Self, ProtocolError> {
        let payload = encode_values(values);
        Self::encode(
            message_type,
            address,
            port,
            T::PAYLOAD_TYPE,
            Some(seconds),
            &payload,
        )
    }

    /// Raw frame bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Total frame length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Frames are never empty; provided for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Raw message type byte including the error flag
    pub fn message_type_byte(&self) -> u8 {
        self.bytes[0]
    }

    /// Message kind with the error flag stripped
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_byte(self.bytes[0])
    }

    /// Whether the device flagged this frame as an error reply
    pub fn is_error(&self) -> bool {
        self.bytes[0] & ERROR_FLAG != 0
    }

    /// Register address
    pub fn address(&self) -> u8 {
        self.bytes[2]
    }

    /// Port byte; 255 addresses the device itself
    pub fn port(&self) -> u8 {
        self.bytes[3]
    }

    /// Declared payload type, timestamp flag included
    pub fn payload_type(&self) -> PayloadType {
        PayloadType::from_bits(self.bytes[4])
    }

    /// Stored trailing checksum byte
    pub fn checksum(&self) -> u8 {
        self.bytes[self.bytes.len() - 1]
    }

    /// True when the payload carries a timestamp prefix
    pub fn is_timestamped(&self) -> bool {
        self.payload_type().is_timestamped()
    }

    /// Offset of the first value byte: 5, or 11 when timestamped
    pub fn payload_offset(&self) -> usize {
        if self.is_timestamped() {
            HEADER_SIZE + TIMESTAMP_SIZE
        } else {
            HEADER_SIZE
        }
    }

    /// Value bytes, excluding timestamp and checksum
    pub fn payload(&self) -> &[u8] {
        let end = self.bytes.len() - 1;
        let start = self.payload_offset().min(end);
        &self.bytes[start..end]
    }

    /// Device time in seconds, for timestamped frames
    pub fn timestamp(&self) -> Option<f64> {
        if !self.is_timestamped() || self.bytes.len() < HEADER_SIZE + TIMESTAMP_SIZE + 1 {
            return None;
        }
        Some(decode_timestamp(
            &self.bytes[HEADER_SIZE..HEADER_SIZE + TIMESTAMP_SIZE],
        ))
    }

    /// Whether this frame is a reply to a request with the given address and kind
    pub fn is_match(&self, address: u8, message_type: MessageType) -> bool {
        self.address() == address && self.message_type() == Some(message_type)
    }

    /// Full validity check: message type, payload type, shape and checksum.
    pub fn is_valid(&self) -> bool {
        let type_byte = self.bytes[0];
        let type_ok = match MessageType::from_byte(type_byte) {
            Some(MessageType::Event) => type_byte & ERROR_FLAG == 0,
            Some(_) => MessageType::is_header_byte(type_byte),
            None => false,
        };
        type_ok
            && self.payload_type().is_valid()
            && self.bytes.len() > self.payload_offset()
            && self.has_valid_checksum()
    }

    /// Whether the stored checksum matches the computed one
    pub fn has_valid_checksum(&self) -> bool {
        let end = self.bytes.len() - 1;
        checksum(&self.bytes[..end]) == self.bytes[end]
    }

    /// First payload element decoded as `T`.
    pub fn value<T: PayloadValue>(&self) -> Result<T, ProtocolError> {
        self.check_payload_type::<T>()?;
        let payload = self.payload();
        if payload.len() < T::SIZE {
            return Err(ProtocolError::InvalidFrame(format!(
                "payload of {} bytes is too short for {}",
                payload.len(),
                T::PAYLOAD_TYPE
            )));
        }
        Ok(T::read_le(payload))
    }

    /// All payload elements decoded as `T`; `count = payload_len / size`.
    pub fn values<T: PayloadValue>(&self) -> Result<Vec<T>, ProtocolError> {
        self.check_payload_type::<T>()?;
        Ok(self
            .payload()
            .chunks_exact(T::SIZE)
            .map(T::read_le)
            .collect())
    }

    /// First payload element together with the frame timestamp.
    pub fn timestamped_value<T: PayloadValue>(&self) -> Result<Timestamped<T>, ProtocolError> {
        let seconds = self.timestamp().ok_or_else(|| {
            ProtocolError::InvalidFrame("frame does not carry a timestamp".to_string())
        })?;
        Ok(Timestamped::new(self.value::<T>()?, seconds))
    }

    /// All payload elements together with the frame timestamp.
    pub fn timestamped_values<T: PayloadValue>(
        &self,
    ) -> Result<Timestamped<Vec<T>>, ProtocolError> {
        let seconds = self.timestamp().ok_or_else(|| {
            ProtocolError::InvalidFrame("frame does not carry a timestamp".to_string())
        })?;
        Ok(Timestamped::new(self.values::<T>()?, seconds))
    }

    /// Payload rendered per its declared type, for diagnostics
    pub fn render_payload(&self) -> String {
        render_payload(self.payload_type(), self.payload())
    }

    fn check_payload_type<T: PayloadValue>(&self) -> Result<(), ProtocolError> {
        let actual = self.payload_type().untimestamped();
        if actual != T::PAYLOAD_TYPE {
            return Err(ProtocolError::UnexpectedPayload {
                expected: T::PAYLOAD_TYPE,
                actual,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("message_type", &self.message_type())
            .field("error", &self.is_error())
            .field("address", &self.address())
            .field("port", &self.port())
            .field("payload_type", &self.payload_type())
            .field("payload", &format_args!("{:02x?}", self.payload()))
            .finish()
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

fn encode_values<T: PayloadValue>(values: &[T]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(values.len() * T::SIZE);
    for value in values {
        value.write_le(&mut payload);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_request_layout() {
        let frame = Frame::read(0, PayloadType::U16);
        assert_eq!(frame.as_bytes(), &[0x01, 0x04, 0x00, 0xFF, 0x02, 0x06]);
        assert!(frame.is_valid());
        assert!(frame.payload().is_empty());
    }

    #[test]
    fn test_length_byte_invariant() {
        let frame = Frame::write(32, 0xDEADBEEFu32);
        assert_eq!(frame.as_bytes()[1] as usize, frame.len() - 2);
        assert_eq!(frame.len(), 10);
    }

    #[test]
    fn test_reject_empty_and_mismatched_buffers() {
        assert!(Frame::from_bytes(Vec::new()).is_err());
        assert!(Frame::from_bytes(vec![0x01, 0x09, 0x00, 0xFF, 0x01, 0x00]).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let values = vec![0u8; 252];
        assert!(Frame::write_array(1, &values).is_err());
        assert!(Frame::write_array(1, &values[..251]).is_ok());
    }

    #[test]
    fn test_error_flag() {
        let mut bytes = Frame::write(4, 7u8).as_bytes().to_vec();
        bytes[0] |= ERROR_FLAG;
        let last = bytes.len() - 1;
        bytes[last] = checksum(&bytes[..last]);
        let frame = Frame::from_bytes(bytes).unwrap();
        assert!(frame.is_error());
        assert_eq!(frame.message_type(), Some(MessageType::Write));
        assert!(frame.is_valid());
    }

    #[test]
    fn test_payload_type_display() {
        assert_eq!(PayloadType::U16.to_string(), "U16");
        assert_eq!(PayloadType::FLOAT.timestamped().to_string(), "TimestampedFloat");
        assert_eq!(PayloadType::from_bits(0x03).to_string(), "0x03");
    }

    #[test]
    fn test_payload_type_mismatch() {
        let frame = Frame::write(4, 7u8);
        assert!(matches!(
            frame.value::<u16>(),
            Err(ProtocolError::UnexpectedPayload { .. })
        ));
    }
}
