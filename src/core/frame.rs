//! Length-prefixed frames.
//!
//! Each message travels as a 4-byte big-endian length followed by exactly that
//! many payload bytes. Big-endian is fixed for wire compatibility and never
//! follows the host byte order.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Size of the length prefix in bytes
pub const HEADER_LEN: usize = 4;

/// Largest payload whose length fits the prefix
pub const MAX_ENCODABLE_LEN: usize = u32::MAX as usize;

/// One decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Number of bytes this frame occupies on the wire
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Build the length prefix for a payload of `len` bytes.
pub fn header(len: usize) -> Result<[u8; HEADER_LEN]> {
    let len = u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge(len))?;
    Ok(len.to_be_bytes())
}

/// Encode `payload` as a single frame.
///
/// Fails with [`ProtocolError::FrameTooLarge`] before producing any output if
/// the payload length does not fit in 32 bits.
pub fn encode(payload: &[u8]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_into(payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Append the frame for `payload` to `dst`. `dst` is untouched on error.
pub fn encode_into(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let prefix = header(payload.len())?;
    dst.reserve(HEADER_LEN + payload.len());
    dst.put_slice(&prefix);
    dst.put_slice(payload);
    Ok(())
}

/// Read the announced payload length, if the prefix is complete.
#[inline]
pub fn peek_len(buffer: &[u8]) -> Option<usize> {
    let prefix: [u8; HEADER_LEN] = buffer.get(..HEADER_LEN)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix) as usize)
}

/// Try to decode one frame from the front of `buffer`.
///
/// Returns the frame and the number of bytes it occupied, or `None` when the
/// buffer does not yet hold a complete frame. Nothing is consumed on `None`;
/// the caller keeps the bytes and retries after more data arrives.
pub fn try_decode(buffer: &[u8]) -> Option<(Frame, usize)> {
    let len = peek_len(buffer)?;
    let total = HEADER_LEN.checked_add(len)?;
    let payload = buffer.get(HEADER_LEN..total)?;
    Some((Frame::new(Bytes::copy_from_slice(payload)), total))
}

/// Decode one frame by splitting it off the front of `buffer` without copying.
///
/// Headers announcing more than `max_len` payload bytes are rejected with
/// [`ProtocolError::OversizedFrame`] before any payload is buffered.
pub fn split_frame(buffer: &mut BytesMut, max_len: usize) -> Result<Option<Frame>> {
    let Some(len) = peek_len(buffer) else {
        return Ok(None);
    };
    if len > max_len {
        return Err(ProtocolError::OversizedFrame(len));
    }

    let total = HEADER_LEN + len;
    if buffer.len() < total {
        buffer.reserve(total - buffer.len());
        return Ok(None);
    }

    let mut frame = buffer.split_to(total);
    let payload = frame.split_off(HEADER_LEN).freeze();
    Ok(Some(Frame { payload }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_prefixes_big_endian_length() {
        let bytes = encode(b"ping").unwrap();
        assert_eq!(&bytes[..], &[0, 0, 0, 4, b'p', b'i', b'n', b'g']);
    }

    #[test]
    fn empty_payload_round_trips() {
        let bytes = encode(&[]).unwrap();
        assert_eq!(&bytes[..], &[0, 0, 0, 0]);

        let (frame, consumed) = try_decode(&bytes).unwrap();
        assert!(frame.is_empty());
        assert_eq!(consumed, HEADER_LEN);
    }

    #[test]
    fn header_rejects_lengths_beyond_u32() {
        let too_big = MAX_ENCODABLE_LEN + 1;
        match header(too_big) {
            Err(ProtocolError::FrameTooLarge(n)) => assert_eq!(n, too_big),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(header(MAX_ENCODABLE_LEN).unwrap(), [0xFF; 4]);
    }

    #[test]
    fn short_buffer_is_incomplete() {
        assert!(try_decode(&[]).is_none());
        assert!(try_decode(&[0, 0, 0]).is_none());
        assert!(try_decode(&[0, 0, 0, 2, 0xAA]).is_none());
    }

    #[test]
    fn decode_consumes_only_the_first_frame() {
        let mut wire = BytesMut::new();
        encode_into(b"one", &mut wire).unwrap();
        encode_into(b"two", &mut wire).unwrap();

        let (first, consumed) = try_decode(&wire).unwrap();
        assert_eq!(&first.payload[..], b"one");
        assert_eq!(consumed, 7);

        let (second, _) = try_decode(&wire[consumed..]).unwrap();
        assert_eq!(&second.payload[..], b"two");
    }

    #[test]
    fn split_frame_leaves_partial_tail() {
        let mut buf = BytesMut::new();
        encode_into(b"abc", &mut buf).unwrap();
        buf.extend_from_slice(&[0, 0, 0, 5, 1, 2]);

        let frame = split_frame(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"abc");
        assert!(split_frame(&mut buf, 1024).unwrap().is_none());
        assert_eq!(&buf[..], &[0, 0, 0, 5, 1, 2]);
    }

    #[test]
    fn split_frame_rejects_oversized_header() {
        let mut buf = BytesMut::from(&[0, 0, 1, 0][..]);
        assert!(matches!(
            split_frame(&mut buf, 255),
            Err(ProtocolError::OversizedFrame(256))
        ));
    }
}
