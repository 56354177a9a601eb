//! Firmware errors

use std::io;
use thiserror::Error;

use super::bootloader::DeviceErrorCode;
use super::HarpVersion;
use crate::protocol::registers::ResetFlags;
use crate::protocol::ProtocolError;

/// Errors reading firmware metadata or images
#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("Invalid firmware file name: {0}")]
    InvalidFileName(String),

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    #[error("Invalid Intel HEX record on line {line}: {message}")]
    InvalidHex { line: usize, message: String },

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

/// Errors of the bootloader protocol. Every one of them is fatal.
#[derive(Error, Debug)]
pub enum BootloaderError {
    #[error("Reply length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Reply checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("Reply does not start with the bootloader sync bytes")]
    InvalidSync,

    #[error("Reply opcode {actual:#04x} does not answer request {expected:#04x}")]
    UnexpectedOpcode { expected: u8, actual: u8 },

    #[error("Bootloader reported error: {0}")]
    Device(DeviceErrorCode),

    #[error("Bootloader reported an invalid page size of {0} bytes")]
    InvalidPageSize(u32),

    #[error("Timed out waiting for the bootloader")]
    Timeout,

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

/// Outcome of a failed firmware update
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error(
        "Firmware {firmware} does not support device {device_name} \
         (hardware {hardware_version}, assembly {assembly})"
    )]
    IncompatibleFirmware {
        firmware: String,
        device_name: String,
        hardware_version: HarpVersion,
        assembly: u8,
    },

    #[error("Unexpected boot mode {0:?}")]
    UnexpectedBootMode(ResetFlags),

    #[error("Pre-flight check failed: {0}")]
    PreFlight(#[source] ProtocolError),

    #[error("Could not open the bootloader connection: {0}")]
    BootloaderUnavailable(#[source] ProtocolError),

    #[error("Bootloader handshake failed: {0}")]
    Bootloader(#[source] BootloaderError),

    #[error("Firmware upload failed after {bytes_written} bytes: {source}")]
    Upload {
        bytes_written: usize,
        #[source]
        source: BootloaderError,
    },
}

impl UpdateError {
    /// Whether the update was refused before any page was written.
    ///
    /// After an upload failure the device may hold a partially written image.
    pub fn is_safe_to_retry(&self) -> bool {
        !matches!(self, UpdateError::Upload { .. })
    }
}
