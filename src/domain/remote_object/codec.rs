use bytes::{Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// TCP framing for remote-object messages.
///
/// Frames are opaque byte payloads; what they contain is decided by the
/// protocol layer on top.
pub struct FrameCodec {
    codec: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self { codec: LengthDelimitedCodec::builder().max_frame_length(max_frame_length).new_codec() }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(64 * 1024 * 1024)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.codec.encode(item, dst)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.codec.decode(src)?.map(BytesMut::freeze))
    }
}
