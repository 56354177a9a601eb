//! Connection management
//!
//! A [`Transport`] owns exactly one duplex stream. Reception runs on a
//! spawned task that feeds the stream parser and delivers frames to the
//! active sink; writes go through an async mutex so they can be issued
//! concurrently with reception and with each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::sink::{FrameSink, SinkSlot};
use super::{open_port, ErrorPolicy, TransportConfig};
use crate::protocol::{Frame, ProtocolError, StreamParser};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One live connection to a device
pub struct Transport {
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    sink: SinkSlot,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl Transport {
    /// Take ownership of `stream` and start receiving into `sink`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<S>(stream: S, config: &TransportConfig, sink: Box<dyn FrameSink>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let sink = SinkSlot::new(sink);
        let closed = Arc::new(AtomicBool::new(false));

        let parser = StreamParser::with_payload_type_check(config.check_payload_type);
        let reader = tokio::spawn(receive_loop(
            read_half,
            parser,
            config.error_policy,
            config.read_buffer_size.max(1),
            sink.clone(),
            closed.clone(),
        ));

        Self {
            writer: tokio::sync::Mutex::new(Some(Box::new(write_half))),
            sink,
            reader: Mutex::new(Some(reader)),
            closed,
        }
    }

    /// Open the serial port named in `config`
    pub fn open_serial(
        config: &TransportConfig,
        sink: Box<dyn FrameSink>,
    ) -> Result<Self, ProtocolError> {
        let stream = open_port(&config.port_name, config.baud_rate)?;
        Ok(Self::open(stream, config, sink))
    }

    /// Send the raw bytes of one frame
    pub async fn write(&self, frame: &Frame) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ProtocolError::Closed)?;
        trace!("tx {:02x?}", frame.as_bytes());
        writer.write_all(frame.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Route all subsequent frames to `sink` without reopening the connection
    pub fn replace_sink(&self, sink: Box<dyn FrameSink>) {
        self.sink.replace(sink);
    }

    /// Whether the connection was closed locally or by the peer
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release the connection. Idempotent; only the first call has effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing transport");

        let reader = match self.reader.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = reader {
            handle.abort();
        }
        // A write in flight keeps the half alive until it completes; it is
        // released with the transport in that case.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        self.sink.clear();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn receive_loop<S>(
    mut reader: ReadHalf<S>,
    mut parser: StreamParser,
    policy: ErrorPolicy,
    buffer_size: usize,
    sink: SinkSlot,
    closed: Arc<AtomicBool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut buffer = vec![0u8; buffer_size];
    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => {
                debug!("connection closed by peer");
                break;
            }
            Ok(n) => n,
            Err(err) => {
                warn!("receive failed: {}", err);
                sink.deliver(Err(ProtocolError::IoError(err)));
                break;
            }
        };
        trace!("rx {:02x?}", &buffer[..n]);
        parser.push(&buffer[..n], |frame| sink.deliver(policy.apply(frame)));
    }
    closed.store(true, Ordering::Release);
    sink.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (local, _remote) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = Transport::open(local, &TransportConfig::default(), Box::new(tx));

        transport.close();
        transport.close();
        assert!(transport.is_closed());
        assert!(rx.recv().await.is_none());
        assert!(matches!(
            transport.write(&Frame::write(1, 1u8)).await,
            Err(ProtocolError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_peer_disconnect_ends_stream() {
        let (local, remote) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = Transport::open(local, &TransportConfig::default(), Box::new(tx));

        drop(remote);
        assert!(rx.recv().await.is_none());
        assert!(transport.is_closed());
    }
}
