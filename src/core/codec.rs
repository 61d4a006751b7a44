//! Tokio codec adapter over [`frame`](super::frame).
//!
//! Lets the connection read path run a `FramedRead` over any `AsyncRead`
//! while the framing rules stay in the pure functions.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_FRAME_LENGTH;
use crate::core::frame::{self, Frame};
use crate::error::ProtocolError;

/// Length-prefixed frame codec
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl FrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_LENGTH)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        frame::split_frame(src, self.max_frame_length)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame::encode_into(&item, dst)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame::encode_into(&item.payload, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_waits_for_complete_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0, 0, 0, 3, b'a'][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 5);

        buf.extend_from_slice(b"bc");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"abc");
        assert!(buf.is_empty());
    }

    #[test]
    fn encode_matches_pure_encoder() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"pong"), &mut buf).unwrap();
        assert_eq!(buf.freeze(), frame::encode(b"pong").unwrap());
    }

    #[test]
    fn decode_enforces_limit() {
        let mut codec = FrameCodec::new(8);
        let mut buf = BytesMut::from(&[0, 0, 0, 9][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::OversizedFrame(9))
        ));
    }
}
