//! Async command layer
//!
//! [`Device`] writes a request frame and resolves with the first later frame
//! whose (address, message type) matches it. There are no sequence numbers
//! on the wire, so concurrent commands to the same address must be
//! serialized by the caller; commands to different addresses may overlap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::firmware::HarpVersion;
use crate::protocol::registers::{self, OperationControl, ResetFlags};
use crate::protocol::{Frame, MessageType, PayloadValue, ProtocolError};
use crate::transport::{ErrorPolicy, FrameSink, SinkTransition, Transport, TransportConfig};

/// A command waiting for its reply
struct Waiter {
    id: u64,
    address: u8,
    message_type: MessageType,
    reply: oneshot::Sender<Result<Frame, ProtocolError>>,
}

/// Waiters shared between callers and the receive loop, in registration order
#[derive(Clone, Default)]
struct PendingReplies {
    waiters: Arc<Mutex<Vec<Waiter>>>,
    next_id: Arc<AtomicU64>,
}

impl PendingReplies {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Waiter>> {
        match self.waiters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn register(
        &self,
        address: u8,
        message_type: MessageType,
    ) -> (u64, oneshot::Receiver<Result<Frame, ProtocolError>>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push(Waiter {
            id,
            address,
            message_type,
            reply: tx,
        });
        (id, rx)
    }

    fn remove(&self, id: u64) {
        self.lock().retain(|w| w.id != id);
    }

    /// Take the first still-pending waiter for (address, message type)
    fn take(&self, address: u8, message_type: MessageType) -> Option<Waiter> {
        let mut waiters = self.lock();
        waiters
            .iter()
            .position(|w| w.address == address && w.message_type == message_type)
            .map(|index| waiters.remove(index))
    }

    /// Resolve the first still-pending waiter matching `frame`
    fn resolve(&self, frame: Frame) {
        let waiter = frame
            .message_type()
            .and_then(|message_type| self.take(frame.address(), message_type));
        match waiter {
            Some(waiter) => {
                let _ = waiter.reply.send(Ok(frame));
            }
            None => trace!("unsolicited frame {:?}", frame),
        }
    }

    /// Fail the first still-pending waiter addressed by a device error
    fn fail(&self, address: u8, message_type: MessageType, err: ProtocolError) {
        match self.take(address, message_type) {
            Some(waiter) => {
                let _ = waiter.reply.send(Err(err));
            }
            None => warn!("unsolicited {}", err),
        }
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

/// Removes a waiter when the waiting future is dropped
struct WaiterGuard<'a> {
    pending: &'a PendingReplies,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

/// Transport sink routing replies to pending commands
struct ReplyDispatcher {
    pending: PendingReplies,
}

impl FrameSink for ReplyDispatcher {
    fn deliver(&mut self, item: Result<Frame, ProtocolError>) -> SinkTransition {
        match item {
            Ok(frame) => self.pending.resolve(frame),
            // A transport with ErrorPolicy::Raise converts error replies before they get here
            Err(
                err @ ProtocolError::DeviceError {
                    address,
                    message_type,
                    ..
                },
            ) => self.pending.fail(address, message_type, err),
            Err(err) => warn!("receive error: {}", err),
        }
        SinkTransition::Keep
    }
}

impl Drop for ReplyDispatcher {
    fn drop(&mut self) {
        // Fail every pending command once the connection is gone
        self.pending.clear();
    }
}

/// Request/reply access to one device
pub struct Device {
    transport: Arc<Transport>,
    pending: PendingReplies,
    shutdown: CancellationToken,
    leave_open: bool,
}

impl Device {
    /// Open the serial port and attach a command layer to it
    pub fn connect(port_name: &str) -> Result<Self, ProtocolError> {
        Self::connect_with(&TransportConfig::for_port(port_name))
    }

    /// Open the serial port described by `config`
    pub fn connect_with(config: &TransportConfig) -> Result<Self, ProtocolError> {
        let pending = PendingReplies::default();
        let transport =
            Transport::open_serial(&Self::command_config(config), Self::dispatcher(&pending))?;
        Ok(Self::with_parts(Arc::new(transport), pending, false))
    }

    /// Attach a command layer to an arbitrary duplex byte stream
    pub fn from_stream<S>(stream: S, config: &TransportConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let pending = PendingReplies::default();
        let transport = Transport::open(
            stream,
            &Self::command_config(config),
            Self::dispatcher(&pending),
        );
        Self::with_parts(Arc::new(transport), pending, false)
    }

    /// Take over an existing transport by swapping its sink.
    ///
    /// With `leave_open` the transport survives closing this device, for use
    /// inside a longer-lived session.
    pub fn attach(transport: Arc<Transport>, leave_open: bool) -> Self {
        let pending = PendingReplies::default();
        transport.replace_sink(Self::dispatcher(&pending));
        Self::with_parts(transport, pending, leave_open)
    }

    fn with_parts(transport: Arc<Transport>, pending: PendingReplies, leave_open: bool) -> Self {
        Self {
            transport,
            pending,
            shutdown: CancellationToken::new(),
            leave_open,
        }
    }

    fn dispatcher(pending: &PendingReplies) -> Box<dyn FrameSink> {
        Box::new(ReplyDispatcher {
            pending: pending.clone(),
        })
    }

    /// Error replies are converted per command, never by the transport
    fn command_config(config: &TransportConfig) -> TransportConfig {
        TransportConfig {
            error_policy: ErrorPolicy::Ignore,
            ..config.clone()
        }
    }

    /// Underlying transport
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Write `request` and wait for the first matching reply.
    ///
    /// Cancellation aborts only the wait; the request is never withdrawn or
    /// retried. A reply with the error bit set fails with
    /// [`ProtocolError::DeviceError`].
    pub async fn command(
        &self,
        request: Frame,
        cancel: &CancellationToken,
    ) -> Result<Frame, ProtocolError> {
        let message_type = request.message_type().ok_or_else(|| {
            ProtocolError::InvalidFrame(format!(
                "message type {:#04x} cannot be sent as a command",
                request.message_type_byte()
            ))
        })?;
        if cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }

        // Register before writing so a fast reply cannot be missed
        let (id, reply) = self.pending.register(request.address(), message_type);
        let _guard = WaiterGuard {
            pending: &self.pending,
            id,
        };
        debug!(
            "command {} register {} ({:?})",
            message_type,
            request.address(),
            registers::register_name(request.address())
        );
        self.transport.write(&request).await?;

        let reply = tokio::select! {
            reply = reply => reply.map_err(|_| ProtocolError::Closed)??,
            _ = cancel.cancelled() => return Err(ProtocolError::Cancelled),
            _ = self.shutdown.cancelled() => return Err(ProtocolError::Closed),
        };
        if reply.is_error() {
            return Err(ProtocolError::from_error_frame(&reply));
        }
        Ok(reply)
    }

    /// [`Device::command`] bounded by a timeout
    pub async fn command_timeout(
        &self,
        request: Frame,
        timeout: Duration,
    ) -> Result<Frame, ProtocolError> {
        let cancel = CancellationToken::new();
        tokio::time::timeout(timeout, self.command(request, &cancel))
            .await
            .map_err(|_| ProtocolError::Timeout)?
    }

    /// Command that only ends with a reply or with the device closing
    async fn request(&self, frame: Frame) -> Result<Frame, ProtocolError> {
        self.command(frame, &CancellationToken::new()).await
    }

    /// Read one value from a register
    pub async fn read<T: PayloadValue>(&self, address: u8) -> Result<T, ProtocolError> {
        self.request(Frame::read_register::<T>(address))
            .await?
            .value::<T>()
    }

    /// Read every element of an array register
    pub async fn read_array<T: PayloadValue>(&self, address: u8) -> Result<Vec<T>, ProtocolError> {
        self.request(Frame::read_register::<T>(address))
            .await?
            .values::<T>()
    }

    /// Write one value to a register
    pub async fn write<T: PayloadValue>(&self, address: u8, value: T) -> Result<(), ProtocolError> {
        self.request(Frame::write(address, value)).await.map(|_| ())
    }

    /// Device identifier from WhoAmI
    pub async fn read_who_am_i(&self) -> Result<u16, ProtocolError> {
        self.read::<u16>(registers::WHO_AM_I).await
    }

    /// Hardware version from the HardwareVersionHigh/Low pair
    pub async fn read_hardware_version(&self) -> Result<HarpVersion, ProtocolError> {
        self.read_version(registers::HARDWARE_VERSION_HIGH, registers::HARDWARE_VERSION_LOW)
            .await
    }

    /// Version of the Harp core implemented by the firmware
    pub async fn read_core_version(&self) -> Result<HarpVersion, ProtocolError> {
        self.read_version(registers::CORE_VERSION_HIGH, registers::CORE_VERSION_LOW)
            .await
    }

    /// Firmware version from the FirmwareVersionHigh/Low pair
    pub async fn read_firmware_version(&self) -> Result<HarpVersion, ProtocolError> {
        self.read_version(registers::FIRMWARE_VERSION_HIGH, registers::FIRMWARE_VERSION_LOW)
            .await
    }

    async fn read_version(&self, high: u8, low: u8) -> Result<HarpVersion, ProtocolError> {
        let major = self.read::<u8>(high).await?;
        let minor = self.read::<u8>(low).await?;
        Ok(HarpVersion::new(major as u32, Some(minor as u32)))
    }

    /// Board assembly number
    pub async fn read_assembly_version(&self) -> Result<u8, ProtocolError> {
        self.read::<u8>(registers::ASSEMBLY_VERSION).await
    }

    /// Device name, with the NUL padding stripped
    pub async fn read_device_name(&self) -> Result<String, ProtocolError> {
        let bytes = self.read_array::<u8>(registers::DEVICE_NAME).await?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).trim().to_string())
    }

    /// Serial number
    pub async fn read_serial_number(&self) -> Result<u16, ProtocolError> {
        self.read::<u16>(registers::SERIAL_NUMBER).await
    }

    /// Whole seconds of the device clock
    pub async fn read_timestamp_seconds(&self) -> Result<u32, ProtocolError> {
        self.read::<u32>(registers::TIMESTAMP_SECONDS).await
    }

    /// Set the whole seconds of the device clock
    pub async fn write_timestamp_seconds(&self, seconds: u32) -> Result<(), ProtocolError> {
        self.write(registers::TIMESTAMP_SECONDS, seconds).await
    }

    /// Current ResetDevice flags, including the read-only boot source
    pub async fn read_reset_flags(&self) -> Result<ResetFlags, ProtocolError> {
        self.read::<u8>(registers::RESET_DEVICE)
            .await
            .map(ResetFlags::from_bits_retain)
    }

    /// Write ResetDevice; most flags reboot the device
    pub async fn write_reset_flags(&self, flags: ResetFlags) -> Result<(), ProtocolError> {
        self.write(registers::RESET_DEVICE, flags.bits()).await
    }

    /// Set operation mode and indicator behaviour
    pub async fn write_operation_control(
        &self,
        control: OperationControl,
    ) -> Result<(), ProtocolError> {
        self.write(registers::OPERATION_CONTROL, control.to_byte())
            .await
    }

    /// Fail pending commands and release the transport unless told to leave it open
    pub fn close(&self) {
        self.shutdown.cancel();
        if !self.leave_open {
            self.transport.close();
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}
