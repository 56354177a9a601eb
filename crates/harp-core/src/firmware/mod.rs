//! Firmware
//!
//! Firmware metadata and images, the bootloader protocol and the update
//! state machine driving it.

pub mod bootloader;
mod error;
mod image;
mod metadata;
mod update;

pub use bootloader::{BootloaderFrame, BootloaderSession, DeviceErrorCode, Opcode};
pub use error::{BootloaderError, FirmwareError, UpdateError};
pub use image::{parse_intel_hex, DeviceFirmware};
pub use metadata::{FirmwareMetadata, HarpVersion};
pub use update::{
    bootloader_reset_flags, update_firmware, update_firmware_with, UpdateOptions,
    DEFAULT_BOOTLOADER_BAUD_RATE,
};
