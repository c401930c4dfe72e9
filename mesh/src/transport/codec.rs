//! Length-prefixed bincode framing for node connections.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::message::Frame;
use crate::error::TransportError;

#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_bytes)
                .new_codec(),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded =
            bincode::serialize(&frame).map_err(|e| TransportError::Codec(e.to_string()))?;
        self.inner.encode(Bytes::from(encoded), dst)?;
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(body) = self.inner.decode(src)? else {
            return Ok(None);
        };
        bincode::deserialize(&body)
            .map(Some)
            .map_err(|e| TransportError::Codec(e.to_string()))
    }
}
