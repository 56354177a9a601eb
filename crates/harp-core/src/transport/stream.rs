//! Streaming access to a device
//!
//! [`open_stream`] is the frame-level entry point for hosts that consume
//! every frame a device sends: it returns a writer for commands and a stream
//! of decoded frames, optionally after verifying the device identity.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::{open_port, IdentitySink, Transport, TransportConfig};
use crate::protocol::registers::{self, OperationControl};
use crate::protocol::{Frame, ProtocolError, DEFAULT_TIMEOUT_MS};

/// Options applied while bringing a device connection up
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    /// Refuse the connection unless WhoAmI reports this id
    pub expected_who_am_i: Option<u16>,
    /// Bound on the identification round trip in milliseconds
    pub identify_timeout_ms: u64,
    /// Written to the OperationControl register once the device is verified
    pub operation_control: Option<OperationControl>,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            expected_who_am_i: None,
            identify_timeout_ms: DEFAULT_TIMEOUT_MS,
            operation_control: None,
        }
    }
}

/// Sending half of an open device stream
#[derive(Clone)]
pub struct FrameWriter {
    transport: Arc<Transport>,
}

impl FrameWriter {
    /// Send one frame
    pub async fn write(&self, frame: &Frame) -> Result<(), ProtocolError> {
        self.transport.write(frame).await
    }

    /// Close the connection; the frame stream ends
    pub fn close(&self) {
        self.transport.close();
    }

    /// Underlying transport, e.g. to attach an async command layer
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }
}

/// Receiving half of an open device stream, in exact reassembly order
pub struct FrameStream {
    rx: mpsc::UnboundedReceiver<Result<Frame, ProtocolError>>,
    // Keeps the connection alive while only the stream is held
    _transport: Arc<Transport>,
}

impl FrameStream {
    /// Next decoded frame; `None` once the connection is closed
    pub async fn next(&mut self) -> Option<Result<Frame, ProtocolError>> {
        self.rx.recv().await
    }
}

/// Open a frame stream on an arbitrary duplex byte stream.
pub async fn open_stream<S>(
    stream: S,
    config: &TransportConfig,
    options: &DeviceOptions,
) -> Result<(FrameWriter, FrameStream), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();

    let transport = match options.expected_who_am_i {
        None => Arc::new(Transport::open(stream, config, Box::new(tx))),
        Some(expected) => {
            let (verified_tx, verified_rx) = oneshot::channel();
            let sink = IdentitySink::new(expected, Box::new(tx), verified_tx);
            let transport = Arc::new(Transport::open(stream, config, Box::new(sink)));

            transport
                .write(&Frame::read_register::<u16>(registers::WHO_AM_I))
                .await?;
            let timeout = Duration::from_millis(options.identify_timeout_ms);
            match tokio::time::timeout(timeout, verified_rx).await {
                Ok(Ok(Ok(()))) => info!("device {} verified", expected),
                Ok(Ok(Err(err))) => {
                    transport.close();
                    return Err(err);
                }
                Ok(Err(_)) => {
                    transport.close();
                    return Err(ProtocolError::Closed);
                }
                Err(_) => {
                    transport.close();
                    return Err(ProtocolError::Timeout);
                }
            }
            transport
        }
    };

    if let Some(control) = options.operation_control {
        debug!("writing operation control {:?}", control);
        transport
            .write(&Frame::write(registers::OPERATION_CONTROL, control.to_byte()))
            .await?;
    }

    Ok((
        FrameWriter {
            transport: transport.clone(),
        },
        FrameStream {
            rx,
            _transport: transport,
        },
    ))
}

/// Open a frame stream on the serial port named in `config`.
pub async fn open(
    config: &TransportConfig,
    options: &DeviceOptions,
) -> Result<(FrameWriter, FrameStream), ProtocolError> {
    let stream = open_port(&config.port_name, config.baud_rate)?;
    open_stream(stream, config, options).await
}
