//! Typed payload values
//!
//! Every numeric kind the protocol can carry implements [`PayloadValue`],
//! which ties the Rust type to its [`PayloadType`] and to its little-endian
//! wire encoding.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

use super::{PayloadType, TIMESTAMP_SIZE};

/// Resolution of the microsecond field of a timestamp, in seconds
pub const TIMESTAMP_TICK: f64 = 32e-6;

/// A numeric kind that can be carried in a frame payload
pub trait PayloadValue: Copy + PartialEq + fmt::Debug + fmt::Display + Send + 'static {
    /// Payload type describing one element of this kind (without timestamp flag)
    const PAYLOAD_TYPE: PayloadType;

    /// Encoded size of one element in bytes
    const SIZE: usize;

    /// Decode one element from the first `SIZE` bytes
    fn read_le(bytes: &[u8]) -> Self;

    /// Append the little-endian encoding of this element
    fn write_le(self, out: &mut Vec<u8>);
}

macro_rules! impl_payload_value {
    ($ty:ty, $payload_type:expr, $read:expr, $write:expr) => {
        impl PayloadValue for $ty {
            const PAYLOAD_TYPE: PayloadType = $payload_type;
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn read_le(bytes: &[u8]) -> Self {
                $read(bytes)
            }

            fn write_le(self, out: &mut Vec<u8>) {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                $write(&mut buf, self);
                out.extend_from_slice(&buf);
            }
        }
    };
}

impl_payload_value!(u8, PayloadType::U8, |b: &[u8]| b[0], |buf: &mut [u8], v: u8| buf[0] = v);
impl_payload_value!(i8, PayloadType::S8, |b: &[u8]| b[0] as i8, |buf: &mut [u8], v: i8| buf[0] =
    v as u8);
impl_payload_value!(u16, PayloadType::U16, LittleEndian::read_u16, LittleEndian::write_u16);
impl_payload_value!(i16, PayloadType::S16, LittleEndian::read_i16, LittleEndian::write_i16);
impl_payload_value!(u32, PayloadType::U32, LittleEndian::read_u32, LittleEndian::write_u32);
impl_payload_value!(i32, PayloadType::S32, LittleEndian::read_i32, LittleEndian::write_i32);
impl_payload_value!(u64, PayloadType::U64, LittleEndian::read_u64, LittleEndian::write_u64);
impl_payload_value!(i64, PayloadType::S64, LittleEndian::read_i64, LittleEndian::write_i64);
impl_payload_value!(f32, PayloadType::FLOAT, LittleEndian::read_f32, LittleEndian::write_f32);

/// A payload value paired with the device time it was acquired at
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timestamped<T> {
    /// Decoded value
    pub value: T,
    /// Device time in seconds
    pub seconds: f64,
}

impl<T> Timestamped<T> {
    /// Pair a value with a timestamp
    pub fn new(value: T, seconds: f64) -> Self {
        Self { value, seconds }
    }
}

/// Encode a device time as 4-byte whole seconds + 2-byte 32 µs ticks.
pub fn encode_timestamp(seconds: f64) -> [u8; TIMESTAMP_SIZE] {
    let whole = seconds.floor();
    let ticks = ((seconds - whole) / TIMESTAMP_TICK).round();

    let mut out = [0u8; TIMESTAMP_SIZE];
    LittleEndian::write_u32(&mut out[0..4], whole as u32);
    LittleEndian::write_u16(&mut out[4..6], ticks as u16);
    out
}

/// Decode the 6-byte timestamp prefix back into seconds.
pub fn decode_timestamp(bytes: &[u8]) -> f64 {
    let whole = LittleEndian::read_u32(&bytes[0..4]);
    let ticks = LittleEndian::read_u16(&bytes[4..6]);
    whole as f64 + ticks as f64 * TIMESTAMP_TICK
}

/// Render raw payload bytes according to a declared payload type.
///
/// Single elements are rendered bare, arrays as `[a, b, ...]`. Bytes that do
/// not fill a whole element are ignored.
pub fn render_payload(payload_type: PayloadType, payload: &[u8]) -> String {
    fn render<T: PayloadValue>(payload: &[u8]) -> Vec<String> {
        payload
            .chunks_exact(T::SIZE)
            .map(|chunk| T::read_le(chunk).to_string())
            .collect()
    }

    let size = payload_type.element_size();
    let values = match (payload_type.is_float(), payload_type.is_signed(), size) {
        (true, _, 4) => render::<f32>(payload),
        (false, false, 1) => render::<u8>(payload),
        (false, true, 1) => render::<i8>(payload),
        (false, false, 2) => render::<u16>(payload),
        (false, true, 2) => render::<i16>(payload),
        (false, false, 4) => render::<u32>(payload),
        (false, true, 4) => render::<i32>(payload),
        (false, false, 8) => render::<u64>(payload),
        (false, true, 8) => render::<i64>(payload),
        _ => return format!("{:02x?}", payload),
    };

    match values.len() {
        1 => values.into_iter().next().unwrap_or_default(),
        _ => format!("[{}]", values.join(", ")),
    }
}
