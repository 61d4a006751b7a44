#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use peerlink::core::codec::FrameCodec;
use peerlink::core::frame;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Frame decoding must never panic, whatever arrives on the wire
    let _ = frame::try_decode(data);

    let mut codec = FrameCodec::new(64 * 1024);
    let mut buffer = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buffer) {}
});
