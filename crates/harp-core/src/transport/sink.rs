//! Frame sinks
//!
//! The receive loop hands every decoded item to the transport's active
//! sink. A sink answers each delivery with a [`SinkTransition`], which is how
//! one-shot sinks hand off to their successor from the receiving context
//! without any other party mutating the slot concurrently.

use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::protocol::{registers, Frame, MessageType, ProtocolError};

/// Receiver of decoded frames
pub trait FrameSink: Send {
    /// Handle one received item and say what sink should receive the next one
    fn deliver(&mut self, item: Result<Frame, ProtocolError>) -> SinkTransition;
}

/// Outcome of a delivery
pub enum SinkTransition {
    /// Keep this sink active
    Keep,
    /// Replace this sink with another one for all subsequent items
    Handoff(Box<dyn FrameSink>),
    /// Remove this sink; later items are dropped
    Detach,
}

impl FrameSink for mpsc::UnboundedSender<Result<Frame, ProtocolError>> {
    fn deliver(&mut self, item: Result<Frame, ProtocolError>) -> SinkTransition {
        match self.send(item) {
            Ok(()) => SinkTransition::Keep,
            Err(_) => SinkTransition::Detach,
        }
    }
}

/// Shared slot holding the active sink
#[derive(Clone, Default)]
pub(crate) struct SinkSlot {
    inner: Arc<Mutex<Option<Box<dyn FrameSink>>>>,
}

impl SinkSlot {
    pub(crate) fn new(sink: Box<dyn FrameSink>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(sink))),
        }
    }

    /// Deliver one item to the active sink and apply its transition
    pub(crate) fn deliver(&self, item: Result<Frame, ProtocolError>) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let transition = match guard.as_mut() {
            Some(sink) => sink.deliver(item),
            None => return,
        };
        match transition {
            SinkTransition::Keep => {}
            SinkTransition::Handoff(next) => *guard = Some(next),
            SinkTransition::Detach => *guard = None,
        }
    }

    /// Install a new sink, dropping the previous one
    pub(crate) fn replace(&self, sink: Box<dyn FrameSink>) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(sink);
    }

    /// Drop the active sink, ending its stream
    pub(crate) fn clear(&self) {
        let previous = match self.inner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(previous);
    }
}

/// One-shot sink verifying the device identity before handing off.
///
/// It waits for the first WhoAmI read reply. When the reported id matches,
/// the verification result is signalled and all later frames go to the
/// caller's sink. On mismatch the error is signalled and the caller's sink
/// never receives a frame.
pub struct IdentitySink {
    expected: u16,
    next: Option<Box<dyn FrameSink>>,
    verified: Option<oneshot::Sender<Result<(), ProtocolError>>>,
}

impl IdentitySink {
    /// Check WhoAmI replies against `expected`; on success hand off to `next`
    pub fn new(
        expected: u16,
        next: Box<dyn FrameSink>,
        verified: oneshot::Sender<Result<(), ProtocolError>>,
    ) -> Self {
        Self {
            expected,
            next: Some(next),
            verified: Some(verified),
        }
    }

    fn signal(&mut self, result: Result<(), ProtocolError>) {
        if let Some(tx) = self.verified.take() {
            let _ = tx.send(result);
        }
    }
}

impl FrameSink for IdentitySink {
    fn deliver(&mut self, item: Result<Frame, ProtocolError>) -> SinkTransition {
        let frame = match item {
            Ok(frame) => frame,
            Err(ProtocolError::DeviceError { address, .. }) if address != registers::WHO_AM_I => {
                return SinkTransition::Keep;
            }
            Err(err) => {
                self.signal(Err(err));
                return SinkTransition::Detach;
            }
        };

        if !frame.is_match(registers::WHO_AM_I, MessageType::Read) {
            debug!("dropping frame received before identification: {:?}", frame);
            return SinkTransition::Keep;
        }
        if frame.is_error() {
            self.signal(Err(ProtocolError::from_error_frame(&frame)));
            return SinkTransition::Detach;
        }

        match frame.value::<u16>() {
            Ok(actual) if actual == self.expected => {
                debug!("device identified as {}", actual);
                self.signal(Ok(()));
                match self.next.take() {
                    Some(next) => SinkTransition::Handoff(next),
                    None => SinkTransition::Detach,
                }
            }
            Ok(actual) => {
                warn!(
                    "unexpected device: expected WhoAmI {}, got {}",
                    self.expected, actual
                );
                self.signal(Err(ProtocolError::UnexpectedDevice {
                    expected: self.expected,
                    actual,
                }));
                SinkTransition::Detach
            }
            Err(err) => {
                self.signal(Err(err));
                SinkTransition::Detach
            }
        }
    }
}
