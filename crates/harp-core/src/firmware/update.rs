//! Firmware update
//!
//! Phases, with the progress reported at the end of each:
//! 1. Pre-flight over the normal protocol: compatibility check and reset
//!    flags that make the next boot enter the bootloader (20%).
//! 2. Bootloader handshake on a dedicated connection (40%).
//! 3. Page-by-page upload (40% to 90%, by bytes written).
//! 4. Exit, rebooting into the new firmware (100%).

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::bootloader::BootloaderSession;
use super::image::ERASED_BYTE;
use super::{DeviceFirmware, UpdateError};
use crate::device::Device;
use crate::protocol::registers::ResetFlags;
use crate::protocol::{ProtocolError, DEFAULT_TIMEOUT_MS};
use crate::transport::open_port;

/// Default baud rate of the bootloader link
pub const DEFAULT_BOOTLOADER_BAUD_RATE: u32 = 2_000_000;

const PREFLIGHT_DONE: f64 = 20.0;
const BOOTLOADER_READY: f64 = 40.0;
const UPLOAD_DONE: f64 = 90.0;
const COMPLETE: f64 = 100.0;

/// Firmware update options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateOptions {
    /// Skip the compatibility check and tolerate an unresponsive device
    pub force: bool,
    /// Baud rate of the bootloader connection
    pub bootloader_baud_rate: u32,
    /// Bound on the whole pre-flight exchange in milliseconds
    pub preflight_timeout_ms: u64,
    /// Delay for the device to reboot into its bootloader
    pub reset_settle_ms: u64,
    /// Delay between opening the bootloader connection and the first request
    pub bootloader_settle_ms: u64,
    /// Bound on each read of a bootloader reply
    pub ack_timeout_ms: u64,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            force: false,
            bootloader_baud_rate: DEFAULT_BOOTLOADER_BAUD_RATE,
            preflight_timeout_ms: DEFAULT_TIMEOUT_MS,
            reset_settle_ms: 1000,
            bootloader_settle_ms: 200,
            ack_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

/// Reset flags that make a device booted with `current` restart into its bootloader
pub fn bootloader_reset_flags(current: ResetFlags) -> Result<ResetFlags, UpdateError> {
    if current.contains(ResetFlags::BOOT_FROM_EEPROM) {
        Ok(ResetFlags::RESTORE_DEFAULT | ResetFlags::UPDATE_FIRMWARE)
    } else if current.contains(ResetFlags::BOOT_FROM_DEFAULT) {
        Ok(ResetFlags::RESTORE_EEPROM | ResetFlags::UPDATE_FIRMWARE)
    } else {
        Err(UpdateError::UnexpectedBootMode(current))
    }
}

/// Update the firmware of the device on `port_name`.
///
/// The same port is reopened at the bootloader baud rate for the upload.
pub async fn update_firmware<P>(
    port_name: &str,
    firmware: &DeviceFirmware,
    progress: P,
    options: &UpdateOptions,
) -> Result<(), UpdateError>
where
    P: FnMut(f64),
{
    let device = Device::connect(port_name).map_err(UpdateError::PreFlight)?;
    let baud_rate = options.bootloader_baud_rate;
    let open_bootloader = || std::future::ready(open_port(port_name, baud_rate));
    update_firmware_with(device, open_bootloader, firmware, progress, options).await
}

/// Update the firmware of `device`, reaching its bootloader through `open_bootloader`.
///
/// `device` is closed once the pre-flight phase is over. Errors for which
/// [`UpdateError::is_safe_to_retry`] holds were raised before any page was
/// written.
pub async fn update_firmware_with<S, F, Fut, P>(
    device: Device,
    open_bootloader: F,
    firmware: &DeviceFirmware,
    mut progress: P,
    options: &UpdateOptions,
) -> Result<(), UpdateError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<S, ProtocolError>>,
    P: FnMut(f64),
{
    info!(
        "updating firmware to {} ({} bytes)",
        firmware.metadata,
        firmware.len()
    );

    let preflight_timeout = Duration::from_millis(options.preflight_timeout_ms);
    let checked = tokio::time::timeout(preflight_timeout, preflight(&device, firmware, options))
        .await
        .unwrap_or(Err(UpdateError::PreFlight(ProtocolError::Timeout)));
    match checked {
        Ok(()) => {}
        Err(UpdateError::PreFlight(ProtocolError::Timeout)) if options.force => {
            warn!("pre-flight timed out, assuming the device is already in its bootloader");
        }
        Err(err) => return Err(err),
    }
    drop(device);

    tokio::time::sleep(Duration::from_millis(options.reset_settle_ms)).await;
    progress(PREFLIGHT_DONE);

    let stream = open_bootloader()
        .await
        .map_err(UpdateError::BootloaderUnavailable)?;
    tokio::time::sleep(Duration::from_millis(options.bootloader_settle_ms)).await;
    let mut session = BootloaderSession::new(stream, Duration::from_millis(options.ack_timeout_ms));

    let page_size = session
        .read_page_size()
        .await
        .map_err(UpdateError::Bootloader)? as usize;
    info!("bootloader ready, page size {}", page_size);
    progress(BOOTLOADER_READY);

    let data = firmware.data();
    let total = data.len();
    let mut written = 0;
    for chunk in data.chunks(page_size) {
        let mut page = chunk.to_vec();
        page.resize(page_size, ERASED_BYTE);

        session
            .write_page(written as u32, &page)
            .await
            .map_err(|source| UpdateError::Upload {
                bytes_written: written,
                source,
            })?;
        written += chunk.len();
        debug!("wrote {}/{} bytes", written, total);
        let fraction = written as f64 / total as f64;
        progress(BOOTLOADER_READY + (UPLOAD_DONE - BOOTLOADER_READY) * fraction);
    }
    if total == 0 {
        progress(UPLOAD_DONE);
    }

    session.exit().await.map_err(|source| UpdateError::Upload {
        bytes_written: written,
        source,
    })?;
    info!("firmware update complete");
    progress(COMPLETE);
    Ok(())
}

async fn preflight(
    device: &Device,
    firmware: &DeviceFirmware,
    options: &UpdateOptions,
) -> Result<(), UpdateError> {
    let hardware_version = device
        .read_hardware_version()
        .await
        .map_err(UpdateError::PreFlight)?;
    let device_name = device
        .read_device_name()
        .await
        .map_err(UpdateError::PreFlight)?;
    let assembly = device
        .read_assembly_version()
        .await
        .map_err(UpdateError::PreFlight)?;
    debug!(
        "device {} hardware {} assembly {}",
        device_name, hardware_version, assembly
    );

    let supported = firmware
        .metadata
        .supports(&device_name, &hardware_version, Some(assembly as u32));
    if !supported {
        if !options.force {
            return Err(UpdateError::IncompatibleFirmware {
                firmware: firmware.metadata.to_string(),
                device_name,
                hardware_version,
                assembly,
            });
        }
        warn!(
            "forcing {} onto incompatible device {}",
            firmware.metadata, device_name
        );
    }

    let current = device.read_reset_flags().await.map_err(UpdateError::PreFlight)?;
    let flags = bootloader_reset_flags(current)?;
    debug!("boot mode {:?}, writing {:?}", current, flags);
    device
        .write_reset_flags(flags)
        .await
        .map_err(UpdateError::PreFlight)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootloader_reset_flags() {
        assert_eq!(
            bootloader_reset_flags(ResetFlags::BOOT_FROM_EEPROM).unwrap(),
            ResetFlags::RESTORE_DEFAULT | ResetFlags::UPDATE_FIRMWARE
        );
        assert_eq!(
            bootloader_reset_flags(ResetFlags::BOOT_FROM_DEFAULT).unwrap(),
            ResetFlags::RESTORE_EEPROM | ResetFlags::UPDATE_FIRMWARE
        );
        assert!(matches!(
            bootloader_reset_flags(ResetFlags::SAVE),
            Err(UpdateError::UnexpectedBootMode(_))
        ));
    }

    #[test]
    fn test_only_upload_failures_are_unsafe() {
        assert!(UpdateError::PreFlight(ProtocolError::Timeout).is_safe_to_retry());
        assert!(UpdateError::UnexpectedBootMode(ResetFlags::empty()).is_safe_to_retry());
        assert!(!UpdateError::Upload {
            bytes_written: 128,
            source: crate::firmware::BootloaderError::Timeout,
        }
        .is_safe_to_retry());
    }
}
