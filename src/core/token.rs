//! # Message Token
//!
//! Per-connection framing state. Raw receive completions, each at most one
//! arena segment long, are fed into the token; it collects the fixed-width
//! length prefix, then exactly the declared number of body bytes, and hands
//! out one complete frame at a time.
//!
//! ## Wire Format
//! ```text
//! [Length(2|3|4, big or little endian)] [Body(Length)]
//! ```
//!
//! ## State Machine
//! ```text
//! AwaitingHeader -> AwaitingBody -> FrameReady -> AwaitingHeader
//! ```
//! A zero-length body goes straight from `AwaitingHeader` to `FrameReady`.
//!
//! The token is owned by exactly one connection and is never shared, so it
//! carries no internal locking.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::{ProtocolError, Result};

/// Upper bound on the body capacity reserved up front when a header arrives.
/// Larger bodies grow the accumulation buffer as bytes actually arrive.
const INITIAL_BODY_RESERVE: usize = 8 * 1024;

/// Width of the length prefix on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthPrefix {
    U16,
    U24,
    #[default]
    U32,
}

impl LengthPrefix {
    /// Prefix width in bytes
    pub const fn width(self) -> usize {
        match self {
            LengthPrefix::U16 => 2,
            LengthPrefix::U24 => 3,
            LengthPrefix::U32 => 4,
        }
    }

    /// Largest body length the prefix can express
    pub const fn max_value(self) -> usize {
        match self {
            LengthPrefix::U16 => 0xFFFF,
            LengthPrefix::U24 => 0xFF_FFFF,
            LengthPrefix::U32 => 0xFFFF_FFFF,
        }
    }
}

/// Byte order of the length prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

/// Frame layout shared by the decoder (token) and the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub prefix: LengthPrefix,
    pub byte_order: ByteOrder,
    /// Maximum accepted body length in bytes
    pub max_frame_size: usize,
}

impl FrameFormat {
    pub fn new(prefix: LengthPrefix, byte_order: ByteOrder, max_frame_size: usize) -> Self {
        Self {
            prefix,
            byte_order,
            max_frame_size,
        }
    }

    /// Length prefix width in bytes
    #[inline]
    pub fn header_len(&self) -> usize {
        self.prefix.width()
    }

    /// Largest body that is both allowed and encodable.
    #[inline]
    pub fn effective_max(&self) -> usize {
        self.max_frame_size.min(self.prefix.max_value())
    }

    /// Parse a body length out of a complete header.
    fn read_length(&self, header: &[u8]) -> usize {
        match self.byte_order {
            ByteOrder::Big => header
                .iter()
                .fold(0usize, |acc, byte| (acc << 8) | *byte as usize),
            ByteOrder::Little => header
                .iter()
                .rev()
                .fold(0usize, |acc, byte| (acc << 8) | *byte as usize),
        }
    }

    fn put_length(&self, len: usize, dst: &mut BytesMut) {
        let width = self.header_len();
        match self.byte_order {
            ByteOrder::Big => dst.put_uint(len as u64, width),
            ByteOrder::Little => dst.put_uint_le(len as u64, width),
        }
    }

    /// Write `[prefix][body]` into `dst`.
    ///
    /// # Errors
    /// Returns `ProtocolError::MessageTooLarge` if the body exceeds the maximum
    /// frame size or cannot be expressed by the prefix width.
    pub fn encode_into(&self, body: &[u8], dst: &mut BytesMut) -> Result<()> {
        let max = self.effective_max();
        if body.len() > max {
            return Err(ProtocolError::MessageTooLarge {
                len: body.len(),
                max,
            });
        }

        dst.reserve(self.header_len() + body.len());
        self.put_length(body.len(), dst);
        dst.extend_from_slice(body);
        Ok(())
    }
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self::new(
            LengthPrefix::default(),
            ByteOrder::default(),
            crate::config::DEFAULT_MAX_FRAME_SIZE,
        )
    }
}

/// Encode one body into a standalone frame.
pub fn encode_frame(format: &FrameFormat, body: &[u8]) -> Result<Bytes> {
    let mut dst = BytesMut::with_capacity(format.header_len() + body.len());
    format.encode_into(body, &mut dst)?;
    Ok(dst.freeze())
}

/// Framing progress of a [`MessageToken`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    AwaitingHeader,
    AwaitingBody,
    FrameReady,
}

/// Accumulates receive completions into complete frames.
pub struct MessageToken {
    format: FrameFormat,
    state: TokenState,
    header: [u8; 4],
    header_filled: usize,
    declared: usize,
    body: BytesMut,
    bytes_consumed: u64,
    frames_completed: u64,
    /// Framing error raised after earlier frames of the same input completed.
    pending_error: Option<ProtocolError>,
}

impl MessageToken {
    pub fn new(format: FrameFormat) -> Self {
        Self {
            format,
            state: TokenState::AwaitingHeader,
            header: [0; 4],
            header_filled: 0,
            declared: 0,
            body: BytesMut::new(),
            bytes_consumed: 0,
            frames_completed: 0,
            pending_error: None,
        }
    }

    pub fn state(&self) -> TokenState {
        self.state
    }

    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    /// Declared body length, once the header has been read.
    pub fn declared_length(&self) -> Option<usize> {
        match self.state {
            TokenState::AwaitingHeader => None,
            _ => Some(self.declared),
        }
    }

    /// Body bytes accumulated for the frame in progress
    pub fn buffered(&self) -> usize {
        self.body.len()
    }

    /// Total stream bytes consumed over the token's lifetime
    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed
    }

    /// Frames handed out over the token's lifetime
    pub fn frames_completed(&self) -> u64 {
        self.frames_completed
    }

    /// Whether part of a frame has been received but not completed.
    pub fn has_partial_frame(&self) -> bool {
        match self.state {
            TokenState::AwaitingHeader => self.header_filled > 0,
            TokenState::AwaitingBody => true,
            TokenState::FrameReady => false,
        }
    }

    /// Consume bytes from `input` until one frame is ready or the input runs out.
    ///
    /// Returns the number of bytes consumed. Bytes after a frame boundary are
    /// left in `input` for the caller; while a frame is ready and not yet
    /// taken nothing is consumed.
    ///
    /// # Errors
    /// Returns `ProtocolError::FrameSize` when a header declares a body larger
    /// than the configured maximum. The token is reset afterwards.
    pub fn consume(&mut self, input: &[u8]) -> Result<usize> {
        let mut used = 0;

        loop {
            match self.state {
                TokenState::FrameReady => break,
                TokenState::AwaitingHeader => {
                    let width = self.format.header_len();
                    let take = (width - self.header_filled).min(input.len() - used);
                    self.header[self.header_filled..self.header_filled + take]
                        .copy_from_slice(&input[used..used + take]);
                    self.header_filled += take;
                    used += take;

                    if self.header_filled < width {
                        break;
                    }

                    let declared = self.format.read_length(&self.header[..width]);
                    let max = self.format.max_frame_size;
                    if declared > max {
                        warn!(declared, max, "Rejecting oversized frame header");
                        self.bytes_consumed += used as u64;
                        self.reset();
                        return Err(ProtocolError::FrameSize { declared, max });
                    }

                    self.declared = declared;
                    if declared == 0 {
                        self.state = TokenState::FrameReady;
                    } else {
                        self.body.reserve(declared.min(INITIAL_BODY_RESERVE));
                        self.state = TokenState::AwaitingBody;
                    }
                }
                TokenState::AwaitingBody => {
                    let need = self.declared - self.body.len();
                    let take = need.min(input.len() - used);
                    self.body.extend_from_slice(&input[used..used + take]);
                    used += take;

                    if self.body.len() < self.declared {
                        break;
                    }
                    self.state = TokenState::FrameReady;
                }
            }
        }

        self.bytes_consumed += used as u64;
        Ok(used)
    }

    /// Take the ready frame and reset to `AwaitingHeader`.
    pub fn take_frame(&mut self) -> Option<Bytes> {
        if self.state != TokenState::FrameReady {
            return None;
        }

        let frame = self.body.split().freeze();
        self.state = TokenState::AwaitingHeader;
        self.header_filled = 0;
        self.declared = 0;
        self.frames_completed += 1;
        trace!(len = frame.len(), "Frame assembled");
        Some(frame)
    }

    /// Feed one receive completion, returning every frame it completes.
    ///
    /// When the input completes one or more frames and then hits a framing
    /// error, the completed frames are returned and the error is held back:
    /// it is available from [`take_error`](Self::take_error) and is returned
    /// by the next call to `feed`.
    ///
    /// # Errors
    /// Returns `ProtocolError::FrameSize` when a header declares an oversized
    /// body and no frame completed before it, or when an error is pending.
    pub fn feed(&mut self, mut input: &[u8]) -> Result<Vec<Bytes>> {
        if let Some(err) = self.pending_error.take() {
            return Err(err);
        }

        let mut frames = Vec::new();

        if let Some(frame) = self.take_frame() {
            frames.push(frame);
        }

        while !input.is_empty() {
            let used = match self.consume(input) {
                Ok(used) => used,
                Err(err) if frames.is_empty() => return Err(err),
                Err(err) => {
                    self.pending_error = Some(err);
                    return Ok(frames);
                }
            };
            input = &input[used..];
            match self.take_frame() {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }

        // A zero-length frame may be completed by the last header byte.
        if let Some(frame) = self.take_frame() {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Take the framing error held back by the last [`feed`](Self::feed).
    pub fn take_error(&mut self) -> Option<ProtocolError> {
        self.pending_error.take()
    }

    /// Whether a framing error is waiting to be collected.
    pub fn has_pending_error(&self) -> bool {
        self.pending_error.is_some()
    }

    /// Discard any partial frame and any pending error.
    pub fn reset(&mut self) {
        self.pending_error = None;
        self.state = TokenState::AwaitingHeader;
        self.header_filled = 0;
        self.declared = 0;
        self.body.clear();
    }
}

impl fmt::Debug for MessageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageToken")
            .field("state", &self.state)
            .field("declared", &self.declared_length())
            .field("buffered", &self.body.len())
            .field("frames_completed", &self.frames_completed)
            .finish()
    }
}

/// Splits an encoded frame into segment-sized send chunks, in order.
#[derive(Debug, Clone)]
pub struct SendChunks {
    frame: Bytes,
    chunk_size: usize,
}

impl SendChunks {
    pub fn new(frame: Bytes, chunk_size: usize) -> Self {
        Self {
            frame,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Bytes not yet yielded
    pub fn remaining(&self) -> usize {
        self.frame.len()
    }
}

impl Iterator for SendChunks {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.frame.is_empty() {
            return None;
        }
        let n = self.chunk_size.min(self.frame.len());
        Some(self.frame.split_to(n))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.frame.len().div_ceil(self.chunk_size);
        (n, Some(n))
    }
}
