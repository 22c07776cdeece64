//! Fixed-length frame codec
//!
//! The gateway stream has no delimiters or length prefix: every inbound
//! message is exactly `frame_len` bytes. Outbound frames are written as-is.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Splits the inbound byte stream into `frame_len` chunks
#[derive(Debug, Clone)]
pub struct FixedFrameCodec {
    frame_len: usize,
}

impl FixedFrameCodec {
    pub fn new(frame_len: usize) -> Self {
        Self { frame_len }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }
}

impl Decoder for FixedFrameCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < self.frame_len {
            src.reserve(self.frame_len - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(self.frame_len).freeze()))
    }

    // Trailing partial frame at EOF is dropped
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let frame = self.decode(src)?;
        if frame.is_none() {
            src.clear();
        }
        Ok(frame)
    }
}

impl Encoder<Bytes> for FixedFrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
