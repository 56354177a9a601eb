//! Harp Binary Protocol
//!
//! Implements the framing used by Harp devices on the wire: frame
//! construction and inspection, typed payload access, the resynchronizing
//! stream parser and capture-file replay.
//!
//! Wire layout of one frame:
//! - 1 byte: message type (Read=1, Write=2, Event=3, `| 0x08` on error replies)
//! - 1 byte: remaining length (total length - 2)
//! - 1 byte: register address
//! - 1 byte: port (255 for host-originated commands)
//! - 1 byte: payload type
//! - N bytes: optional 6-byte timestamp followed by the payload
//! - 1 byte: checksum (truncated 8-bit sum of all preceding bytes)

mod capture;
mod codec;
mod error;
mod frame;
mod parser;
pub mod payload;
pub mod registers;

pub use capture::{read_capture, CaptureReader};
pub use codec::HarpCodec;
pub use error::ProtocolError;
pub use frame::{checksum, Frame, MessageType, PayloadType, ERROR_FLAG, HOST_PORT};
pub use parser::StreamParser;
pub use payload::{PayloadValue, Timestamped};

/// Default baud rate of the Harp serial link
pub const DEFAULT_BAUD_RATE: u32 = 1_000_000;

/// Default bound for identification and pre-flight replies in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 500;

/// Largest frame the one-byte length field can describe
pub const MAX_FRAME_SIZE: usize = u8::MAX as usize + 2;

/// Size of the fixed frame header (type, length, address, port, payload type)
pub const HEADER_SIZE: usize = 5;

/// Size of the timestamp prefix carried by timestamped payloads
pub const TIMESTAMP_SIZE: usize = 6;

/// Smallest well-formed frame: header plus checksum
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + 1;
