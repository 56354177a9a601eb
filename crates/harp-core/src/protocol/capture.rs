//! Capture file replay
//!
//! Replays recorded raw byte captures through the same [`StreamParser`] the
//! live transport uses, so resynchronization points are identical.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use super::{Frame, ProtocolError, StreamParser};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames from any `Read` source of raw protocol bytes.
pub struct CaptureReader<R> {
    inner: R,
    parser: StreamParser,
    ready: VecDeque<Frame>,
    chunk: Vec<u8>,
    finished: bool,
}

impl<R: Read> CaptureReader<R> {
    /// Create a reader with full frame validation
    pub fn new(inner: R) -> Self {
        Self::with_parser(inner, StreamParser::new())
    }

    /// Create a reader driving an explicitly configured parser
    pub fn with_parser(inner: R, parser: StreamParser) -> Self {
        Self {
            inner,
            parser,
            ready: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK_SIZE],
            finished: false,
        }
    }

    /// Read the next frame, or `None` at end of input.
    pub fn read_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }
            if self.finished {
                return Ok(None);
            }

            let read = match self.inner.read(&mut self.chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(ProtocolError::IoError(err)),
            };
            if read == 0 {
                self.finished = true;
                continue;
            }

            let ready = &mut self.ready;
            self.parser
                .push(&self.chunk[..read], |frame| ready.push_back(frame));
        }
    }

    /// Parser state, e.g. to inspect how many buffers were rejected
    pub fn parser(&self) -> &StreamParser {
        &self.parser
    }

    /// Consume the reader and return the inner source.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Iterator for CaptureReader<R> {
    type Item = Result<Frame, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_frame().transpose()
    }
}

/// Read every frame of a capture file.
pub fn read_capture(path: impl AsRef<Path>) -> Result<Vec<Frame>, ProtocolError> {
    let file = File::open(path)?;
    CaptureReader::new(file).collect()
}
