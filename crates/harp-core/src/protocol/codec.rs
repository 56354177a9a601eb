//! `tokio_util::codec` adapter over the stream parser

use bytes::BytesMut;
use std::collections::VecDeque;
use tokio_util::codec::{Decoder, Encoder};

use super::{Frame, ProtocolError, StreamParser};

/// Frame codec for use with `FramedRead`/`FramedWrite`
#[derive(Debug, Default)]
pub struct HarpCodec {
    parser: StreamParser,
    ready: VecDeque<Frame>,
}

impl HarpCodec {
    /// Codec around a configured parser
    pub fn new(parser: StreamParser) -> Self {
        Self {
            parser,
            ready: VecDeque::new(),
        }
    }
}

impl Decoder for HarpCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if self.ready.is_empty() && !src.is_empty() {
            // The parser keeps partial frames itself, so the whole buffer is consumed
            let chunk = src.split();
            let ready = &mut self.ready;
            self.parser.push(&chunk, |frame| ready.push_back(frame));
        }
        Ok(self.ready.pop_front())
    }
}

impl Encoder<Frame> for HarpCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.extend_from_slice(frame.as_bytes());
        Ok(())
    }
}

impl Encoder<&Frame> for HarpCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.extend_from_slice(frame.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_across_partial_buffers() {
        let frames = [Frame::write(1, 7u8), Frame::write(2, 9u16)];
        let wire: Vec<u8> = frames.iter().flat_map(|f| f.as_bytes().to_vec()).collect();

        let mut codec = HarpCodec::default();
        let mut buf = BytesMut::from(&wire[..5]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&wire[5..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frames[0].clone()));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frames[1].clone()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_encode_writes_raw_bytes() {
        let frame = Frame::write(4, 0x1234u16);
        let mut dst = BytesMut::new();
        codec_encode(&frame, &mut dst);
        assert_eq!(&dst[..], frame.as_bytes());
    }

    fn codec_encode(frame: &Frame, dst: &mut BytesMut) {
        HarpCodec::default().encode(frame, dst).unwrap();
    }
}
