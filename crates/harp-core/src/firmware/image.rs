//! Firmware images
//!
//! Images are loaded from Intel HEX (`.hex`) or raw binary files. The file
//! stem carries the [`FirmwareMetadata`].

use std::fs;
use std::path::Path;
use tracing::debug;

use super::{FirmwareError, FirmwareMetadata};

/// Value of flash bytes not covered by any record
pub const ERASED_BYTE: u8 = 0xFF;

/// Upper bound on the image size accepted from Intel HEX files
const MAX_IMAGE_SIZE: usize = 16 * 1024 * 1024;

/// A firmware image together with its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFirmware {
    /// Metadata parsed from the file name
    pub metadata: FirmwareMetadata,
    data: Vec<u8>,
}

impl DeviceFirmware {
    /// Wrap a flat image starting at byte address 0
    pub fn new(metadata: FirmwareMetadata, data: Vec<u8>) -> Self {
        Self { metadata, data }
    }

    /// Load a firmware file named after its metadata
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FirmwareError> {
        let path = path.as_ref();
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| FirmwareError::InvalidFileName(path.display().to_string()))?;
        let metadata: FirmwareMetadata = stem.parse()?;

        let is_hex = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("hex"));
        let data = if is_hex {
            parse_intel_hex(&fs::read_to_string(path)?)?
        } else {
            fs::read(path)?
        };

        debug!("loaded firmware {} ({} bytes)", metadata, data.len());
        Ok(Self { metadata, data })
    }

    /// Image bytes, starting at address 0
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Image size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for an image without data
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Flatten an Intel HEX file into an image starting at address 0.
///
/// Supports data, end-of-file, extended segment and extended linear address
/// records; start address records are accepted and ignored.
pub fn parse_intel_hex(text: &str) -> Result<Vec<u8>, FirmwareError> {
    let mut image = Vec::new();
    let mut base: usize = 0;

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let invalid = |message: &str| FirmwareError::InvalidHex {
            line: line_no,
            message: message.to_string(),
        };

        let digits = line
            .strip_prefix(':')
            .ok_or_else(|| invalid("missing ':' start code"))?;
        let record = decode_hex(digits).ok_or_else(|| invalid("invalid hex digits"))?;
        if record.len() < 5 {
            return Err(invalid("record too short"));
        }
        let count = record[0] as usize;
        if record.len() != count + 5 {
            return Err(invalid("byte count does not match record length"));
        }
        if record.iter().fold(0u8, |sum, &b| sum.wrapping_add(b)) != 0 {
            return Err(invalid("checksum mismatch"));
        }

        let offset = u16::from_be_bytes([record[1], record[2]]) as usize;
        let data = &record[4..4 + count];
        match record[3] {
            0x00 => {
                let start = base + offset;
                let end = start + data.len();
                if end > MAX_IMAGE_SIZE {
                    return Err(invalid("address beyond supported image size"));
                }
                if image.len() < end {
                    image.resize(end, ERASED_BYTE);
                }
                image[start..end].copy_from_slice(data);
            }
            0x01 => return Ok(image),
            0x02 if count == 2 => base = (u16::from_be_bytes([data[0], data[1]]) as usize) << 4,
            0x04 if count == 2 => base = (u16::from_be_bytes([data[0], data[1]]) as usize) << 16,
            0x03 | 0x05 => {}
            0x02 | 0x04 => return Err(invalid("address record must carry two bytes")),
            other => return Err(invalid(&format!("unknown record type {:#04x}", other))),
        }
    }

    Err(FirmwareError::InvalidHex {
        line: text.lines().count(),
        message: "missing end-of-file record".to_string(),
    })
}

fn decode_hex(digits: &str) -> Option<Vec<u8>> {
    if digits.len() % 2 != 0 || !digits.is_ascii() {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
        .collect()
}
