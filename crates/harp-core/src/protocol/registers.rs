//! Common registers
//!
//! Every Harp device implements the same block of core registers at
//! addresses 0-14. Device-specific registers start above them.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

use super::PayloadType;

/// Device identifier (U16)
pub const WHO_AM_I: u8 = 0;
/// Hardware major version (U8)
pub const HARDWARE_VERSION_HIGH: u8 = 1;
/// Hardware minor version (U8)
pub const HARDWARE_VERSION_LOW: u8 = 2;
/// Board assembly number (U8)
pub const ASSEMBLY_VERSION: u8 = 3;
/// Harp core major version (U8)
pub const CORE_VERSION_HIGH: u8 = 4;
/// Harp core minor version (U8)
pub const CORE_VERSION_LOW: u8 = 5;
/// Firmware major version (U8)
pub const FIRMWARE_VERSION_HIGH: u8 = 6;
/// Firmware minor version (U8)
pub const FIRMWARE_VERSION_LOW: u8 = 7;
/// Clock whole seconds (U32)
pub const TIMESTAMP_SECONDS: u8 = 8;
/// Clock sub-second part in 32 µs ticks (U16)
pub const TIMESTAMP_MICROSECONDS: u8 = 9;
/// Operation mode and indicators (U8)
pub const OPERATION_CONTROL: u8 = 10;
/// Reset and boot flags (U8)
pub const RESET_DEVICE: u8 = 11;
/// Device name, NUL padded (U8 array)
pub const DEVICE_NAME: u8 = 12;
/// Serial number (U16)
pub const SERIAL_NUMBER: u8 = 13;
/// Clock synchronization role (U8)
pub const CLOCK_CONFIGURATION: u8 = 14;

/// Length of the DeviceName register in bytes
pub const DEVICE_NAME_LENGTH: usize = 25;

/// Name and payload type of every core register
const CORE_REGISTERS: [(u8, &str, PayloadType); 15] = [
    (WHO_AM_I, "WhoAmI", PayloadType::U16),
    (HARDWARE_VERSION_HIGH, "HardwareVersionHigh", PayloadType::U8),
    (HARDWARE_VERSION_LOW, "HardwareVersionLow", PayloadType::U8),
    (ASSEMBLY_VERSION, "AssemblyVersion", PayloadType::U8),
    (CORE_VERSION_HIGH, "CoreVersionHigh", PayloadType::U8),
    (CORE_VERSION_LOW, "CoreVersionLow", PayloadType::U8),
    (FIRMWARE_VERSION_HIGH, "FirmwareVersionHigh", PayloadType::U8),
    (FIRMWARE_VERSION_LOW, "FirmwareVersionLow", PayloadType::U8),
    (TIMESTAMP_SECONDS, "TimestampSeconds", PayloadType::U32),
    (TIMESTAMP_MICROSECONDS, "TimestampMicroseconds", PayloadType::U16),
    (OPERATION_CONTROL, "OperationControl", PayloadType::U8),
    (RESET_DEVICE, "ResetDevice", PayloadType::U8),
    (DEVICE_NAME, "DeviceName", PayloadType::U8),
    (SERIAL_NUMBER, "SerialNumber", PayloadType::U16),
    (CLOCK_CONFIGURATION, "ClockConfiguration", PayloadType::U8),
];

static REGISTER_NAMES: LazyLock<HashMap<u8, &'static str>> = LazyLock::new(|| {
    CORE_REGISTERS
        .iter()
        .map(|&(address, name, _)| (address, name))
        .collect()
});

/// Name of a core register
pub fn register_name(address: u8) -> Option<&'static str> {
    REGISTER_NAMES.get(&address).copied()
}

/// Declared payload type of a core register
pub fn register_payload_type(address: u8) -> Option<PayloadType> {
    CORE_REGISTERS
        .iter()
        .find(|(a, _, _)| *a == address)
        .map(|&(_, _, payload_type)| payload_type)
}

bitflags! {
    /// Flags of the ResetDevice register
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ResetFlags: u8 {
        /// Reboot with the default register values
        const RESTORE_DEFAULT   = 0x01;
        /// Reboot with the values saved in non-volatile memory
        const RESTORE_EEPROM    = 0x02;
        /// Save the current register values and reboot
        const SAVE              = 0x04;
        /// Reboot restoring the default device name
        const RESTORE_NAME      = 0x08;
        /// Reboot into the bootloader
        const UPDATE_FIRMWARE   = 0x20;
        /// Read-only: booted with the default register values
        const BOOT_FROM_DEFAULT = 0x40;
        /// Read-only: booted with the values saved in non-volatile memory
        const BOOT_FROM_EEPROM  = 0x80;
    }
}

bitflags! {
    /// Single-bit fields of the OperationControl register, above the mode bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct ControlFlags: u8 {
        const DUMP_REGISTERS    = 0x08;
        const MUTE_REPLIES      = 0x10;
        const VISUAL_INDICATORS = 0x20;
        const OPERATION_LED     = 0x40;
        const HEARTBEAT         = 0x80;
    }
}

/// Device operation mode, bits 0-1 of OperationControl
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OperationMode {
    /// No events are sent
    #[default]
    Standby,
    /// Events are sent
    Active,
    /// Device-specific high throughput mode
    Speed,
}

impl OperationMode {
    fn bits(self) -> u8 {
        match self {
            OperationMode::Standby => 0,
            OperationMode::Active => 1,
            OperationMode::Speed => 3,
        }
    }
}

/// Contents of the OperationControl register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationControl {
    pub mode: OperationMode,
    /// Dump all register values when written
    pub dump_registers: bool,
    /// Suppress replies to commands
    pub mute_replies: bool,
    /// Enable the board LEDs
    pub visual_indicators: bool,
    /// Blink the operation LED with the mode
    pub operation_led: bool,
    /// Send a TimestampSeconds event every second
    pub heartbeat: bool,
}

impl OperationControl {
    /// Register value
    pub fn to_byte(self) -> u8 {
        let mut flags = ControlFlags::empty();
        flags.set(ControlFlags::DUMP_REGISTERS, self.dump_registers);
        flags.set(ControlFlags::MUTE_REPLIES, self.mute_replies);
        flags.set(ControlFlags::VISUAL_INDICATORS, self.visual_indicators);
        flags.set(ControlFlags::OPERATION_LED, self.operation_led);
        flags.set(ControlFlags::HEARTBEAT, self.heartbeat);
        self.mode.bits() | flags.bits()
    }

    /// Decode a register value; the reserved mode value 2 reads as Standby.
    pub fn from_byte(bits: u8) -> Self {
        let mode = match bits & 0x03 {
            1 => OperationMode::Active,
            3 => OperationMode::Speed,
            _ => OperationMode::Standby,
        };
        let flags = ControlFlags::from_bits_truncate(bits);
        Self {
            mode,
            dump_registers: flags.contains(ControlFlags::DUMP_REGISTERS),
            mute_replies: flags.contains(ControlFlags::MUTE_REPLIES),
            visual_indicators: flags.contains(ControlFlags::VISUAL_INDICATORS),
            operation_led: flags.contains(ControlFlags::OPERATION_LED),
            heartbeat: flags.contains(ControlFlags::HEARTBEAT),
        }
    }
}

impl Default for OperationControl {
    fn default() -> Self {
        Self {
            mode: OperationMode::Active,
            dump_registers: false,
            mute_replies: false,
            visual_indicators: true,
            operation_led: true,
            heartbeat: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_names() {
        assert_eq!(register_name(WHO_AM_I), Some("WhoAmI"));
        assert_eq!(register_name(RESET_DEVICE), Some("ResetDevice"));
        assert_eq!(register_name(200), None);
        assert_eq!(register_payload_type(TIMESTAMP_SECONDS), Some(PayloadType::U32));
    }

    #[test]
    fn test_reset_flags() {
        let flags = ResetFlags::RESTORE_EEPROM | ResetFlags::UPDATE_FIRMWARE;
        assert_eq!(flags.bits(), 0x22);
        assert!(flags.contains(ResetFlags::UPDATE_FIRMWARE));
        assert!(!flags.contains(ResetFlags::BOOT_FROM_EEPROM));
        assert_eq!(
            format!("{:?}", flags),
            "ResetFlags(RESTORE_EEPROM | UPDATE_FIRMWARE)"
        );

        // Unknown bits read back from a device are kept
        let raw = ResetFlags::from_bits_retain(0x90);
        assert_eq!(raw.bits(), 0x90);
        assert!(raw.contains(ResetFlags::BOOT_FROM_EEPROM));
    }

    #[test]
    fn test_reset_flags_serde() {
        let flags = ResetFlags::BOOT_FROM_DEFAULT | ResetFlags::SAVE;
        let json = serde_json::to_string(&flags).unwrap();
        let back: ResetFlags = serde_json::from_str(&json).unwrap();
        assert_eq!(back, flags);
    }

    #[test]
    fn test_operation_control_bits() {
        let control = OperationControl {
            mode: OperationMode::Active,
            dump_registers: true,
            mute_replies: false,
            visual_indicators: true,
            operation_led: true,
            heartbeat: true,
        };
        assert_eq!(control.to_byte(), 0xE9);
        assert_eq!(OperationControl::from_byte(0xE9), control);
    }
}
