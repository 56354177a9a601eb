//! Incremental stream parser
//!
//! Reassembles frames from byte chunks of any size. The same parser is fed
//! by the live receive loop and by bulk reads of capture files.
//!
//! When a completed buffer fails validation the parser does not drop it as
//! a whole: it discards only its first byte and re-scans from the second
//! one, which recovers from a single corrupted byte without losing sync.

use bytes::Bytes;
use std::collections::VecDeque;
use tracing::{debug, warn};

use super::{Frame, MessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    /// Waiting for a message type byte
    ScanHeader,
    /// Header byte seen, waiting for the length byte
    ReadLength,
    /// Filling the message buffer
    ReadBody,
}

/// Stateful frame reassembler for one connection
#[derive(Debug)]
pub struct StreamParser {
    state: ParserState,
    header: u8,
    buffer: Vec<u8>,
    offset: usize,
    check_payload_type: bool,
    in_corrupt_run: bool,
    rejected: u64,
}

impl StreamParser {
    /// Create a parser validating checksum and payload type
    pub fn new() -> Self {
        Self::with_payload_type_check(true)
    }

    /// Create a parser; when `check_payload_type` is false only the checksum
    /// decides whether a completed buffer is accepted.
    pub fn with_payload_type_check(check_payload_type: bool) -> Self {
        Self {
            state: ParserState::ScanHeader,
            header: 0,
            buffer: Vec::new(),
            offset: 0,
            check_payload_type,
            in_corrupt_run: false,
            rejected: 0,
        }
    }

    /// Number of completed buffers rejected so far
    pub fn rejected_count(&self) -> u64 {
        self.rejected
    }

    /// Whether no partial frame is pending
    pub fn is_idle(&self) -> bool {
        self.state == ParserState::ScanHeader
    }

    /// Drop any partial frame and go back to scanning for a header
    pub fn reset(&mut self) {
        self.state = ParserState::ScanHeader;
        self.buffer.clear();
        self.offset = 0;
        self.in_corrupt_run = false;
    }

    /// Consume a chunk and collect the frames it completes
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        self.push(data, |frame| frames.push(frame));
        frames
    }

    /// Consume a chunk, handing every completed frame to `emit` in stream order
    pub fn push<F: FnMut(Frame)>(&mut self, data: &[u8], mut emit: F) {
        // Bytes of rejected buffers waiting to be re-scanned ahead of `data`
        let mut replay: VecDeque<u8> = VecDeque::new();
        let mut pos = 0;

        loop {
            if self.state == ParserState::ReadBody && replay.is_empty() {
                let wanted = self.buffer.len() - self.offset;
                let n = wanted.min(data.len() - pos);
                self.buffer[self.offset..self.offset + n].copy_from_slice(&data[pos..pos + n]);
                self.offset += n;
                pos += n;
                if self.offset == self.buffer.len() {
                    self.complete(&mut replay, &mut emit);
                    continue;
                }
                break;
            }

            let byte = match replay.pop_front() {
                Some(byte) => byte,
                None if pos < data.len() => {
                    pos += 1;
                    data[pos - 1]
                }
                None => break,
            };
            self.step(byte, &mut replay, &mut emit);
        }
    }

    fn step<F: FnMut(Frame)>(&mut self, byte: u8, replay: &mut VecDeque<u8>, emit: &mut F) {
        match self.state {
            ParserState::ScanHeader => {
                if MessageType::is_header_byte(byte) {
                    self.header = byte;
                    self.state = ParserState::ReadLength;
                }
            }
            ParserState::ReadLength => {
                if byte == 0 {
                    self.state = ParserState::ScanHeader;
                    return;
                }
                self.buffer = vec![0u8; byte as usize + 2];
                self.buffer[0] = self.header;
                self.buffer[1] = byte;
                self.offset = 2;
                self.state = ParserState::ReadBody;
            }
            ParserState::ReadBody => {
                self.buffer[self.offset] = byte;
                self.offset += 1;
                if self.offset == self.buffer.len() {
                    self.complete(replay, emit);
                }
            }
        }
    }

    fn complete<F: FnMut(Frame)>(&mut self, replay: &mut VecDeque<u8>, emit: &mut F) {
        let buffer = Bytes::from(std::mem::take(&mut self.buffer));
        self.offset = 0;
        self.state = ParserState::ScanHeader;

        let accepted = match Frame::from_bytes(buffer.clone()) {
            Ok(frame) if self.accepts(&frame) => Some(frame),
            _ => None,
        };

        match accepted {
            Some(frame) => {
                if self.in_corrupt_run {
                    debug!("stream parser resynchronized");
                    self.in_corrupt_run = false;
                }
                emit(frame);
            }
            None => {
                self.rejected += 1;
                if !self.in_corrupt_run {
                    warn!(
                        "discarding corrupt frame of {} bytes, resynchronizing",
                        buffer.len()
                    );
                    self.in_corrupt_run = true;
                }
                // Rewind by length - 1: re-scan from the second byte of the buffer
                for &byte in buffer[1..].iter().rev() {
                    replay.push_front(byte);
                }
            }
        }
    }

    fn accepts(&self, frame: &Frame) -> bool {
        if self.check_payload_type {
            frame.is_valid()
        } else {
            frame.has_valid_checksum()
        }
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{checksum, PayloadType};

    #[test]
    fn test_zero_length_is_skipped() {
        let mut parser = StreamParser::new();
        let valid = Frame::write(3, 9u8);
        let mut stream = vec![0x01, 0x00];
        stream.extend_from_slice(valid.as_bytes());
        assert_eq!(parser.feed(&stream), vec![valid]);
    }

    #[test]
    fn test_garbage_before_header_is_discarded() {
        let mut parser = StreamParser::new();
        let valid = Frame::read(12, PayloadType::U8);
        let mut stream = vec![0xFF, 0x42, 0x00, 0x10];
        stream.extend_from_slice(valid.as_bytes());
        assert_eq!(parser.feed(&stream), vec![valid]);
        assert!(parser.is_idle());
    }

    #[test]
    fn test_rejected_buffer_is_rescanned_from_second_byte() {
        // A bogus header/length pair swallows the start of a real frame; the
        // real frame begins at the second byte of the rejected buffer.
        let valid = Frame::write(7, 0x55u8);
        let mut stream = vec![0x02];
        stream.extend_from_slice(valid.as_bytes());

        let mut parser = StreamParser::new();
        let frames = parser.feed(&stream);
        assert_eq!(frames, vec![valid]);
        assert_eq!(parser.rejected_count(), 1);
    }

    #[test]
    fn test_checksum_only_mode_accepts_unknown_payload_type() {
        let mut bytes = vec![0x03, 0x05, 0x01, 0xFF, 0x23, 0x00];
        bytes.push(checksum(&bytes));

        let mut strict = StreamParser::new();
        assert!(strict.feed(&bytes).is_empty());

        let mut lenient = StreamParser::with_payload_type_check(false);
        assert_eq!(lenient.feed(&bytes).len(), 1);
    }

    #[test]
    fn test_reset_drops_partial_frame() {
        let valid = Frame::write(1, 1u16);
        let mut parser = StreamParser::new();
        assert!(parser.feed(&valid.as_bytes()[..4]).is_empty());
        assert!(!parser.is_idle());
        parser.reset();
        assert_eq!(parser.feed(valid.as_bytes()), vec![valid]);
    }
}
