//! # Harp Core Library
//!
//! Host-side implementation of the Harp binary protocol.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Frame construction and inspection with typed payload access
//! - A resynchronizing stream parser shared by live links and capture replay
//! - A transport owning one serial (or any duplex) connection
//! - An async request/reply command layer
//! - Firmware metadata, images and the bootloader update state machine
//!
//! ## Example
//!
//! ```rust,ignore
//! use harp_core::prelude::*;
//!
//! let device = Device::connect("/dev/ttyUSB0")?;
//! let who_am_i = device.read_who_am_i().await?;
//! let name = device.read_device_name().await?;
//! println!("{} ({})", name, who_am_i);
//!
//! let firmware = DeviceFirmware::from_file("Behavior-fw2.1-harp1.13-hw2.0-ass0.hex")?;
//! drop(device);
//! let options = UpdateOptions::default();
//! update_firmware("/dev/ttyUSB0", &firmware, |p| println!("{:.0}%", p), &options).await?;
//! ```

pub mod device;
pub mod firmware;
pub mod protocol;
pub mod transport;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::device::Device;
    pub use crate::firmware::{
        update_firmware, DeviceFirmware, FirmwareMetadata, HarpVersion, UpdateError,
        UpdateOptions,
    };
    pub use crate::protocol::registers::{OperationControl, OperationMode, ResetFlags};
    pub use crate::protocol::{Frame, MessageType, PayloadType, ProtocolError, StreamParser};
    pub use crate::transport::{open, DeviceOptions, ErrorPolicy, TransportConfig};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
