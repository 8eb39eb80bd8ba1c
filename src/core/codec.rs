//! Tokio codec over the framing state machine, for peers that read and write
//! whole frames through `tokio_util::codec::Framed` instead of the pooled
//! connection manager.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::token::{FrameFormat, MessageToken};
use crate::error::{ProtocolError, Result};

pub struct FrameCodec {
    token: MessageToken,
}

impl FrameCodec {
    pub fn new(format: FrameFormat) -> Self {
        Self {
            token: MessageToken::new(format),
        }
    }

    pub fn format(&self) -> &FrameFormat {
        self.token.format()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(FrameFormat::default())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if let Some(frame) = self.token.take_frame() {
            return Ok(Some(frame));
        }

        let used = self.token.consume(&src[..])?;
        src.advance(used);
        Ok(self.token.take_frame())
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if self.token.has_partial_frame() || !src.is_empty() => {
                Err(ProtocolError::ConnectionClosed)
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<()> {
        self.token.format().encode_into(&body, dst)
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, body: &[u8], dst: &mut BytesMut) -> Result<()> {
        self.token.format().encode_into(body, dst)
    }
}
