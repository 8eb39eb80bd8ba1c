//! # Operation Context
//!
//! Reusable descriptor for one in-flight send or receive. A context is bound
//! to one arena segment for its whole life; while checked out it also carries
//! the owning connection and, for receives, that connection's message token.

use std::fmt;
use std::io;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::arena::Segment;
use crate::core::token::MessageToken;
use crate::error::{ProtocolError, Result};
use crate::transport::connection::ConnectionId;

/// Direction of the operation a context services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Receive,
    Send,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Receive => f.write_str("receive"),
            OperationKind::Send => f.write_str("send"),
        }
    }
}

pub struct OperationContext {
    slot: usize,
    pool_id: u64,
    kind: OperationKind,
    segment: Segment,
    owner: Option<ConnectionId>,
    token: Option<MessageToken>,
    filled: usize,
}

impl OperationContext {
    pub(crate) fn new(slot: usize, pool_id: u64, kind: OperationKind, segment: Segment) -> Self {
        Self {
            slot,
            pool_id,
            kind,
            segment,
            owner: None,
            token: None,
            filled: 0,
        }
    }

    /// Slot index within the owning pool
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Connection this context is checked out for, `None` while pooled.
    pub fn owner(&self) -> Option<ConnectionId> {
        self.owner
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Largest number of bytes a single operation can move
    pub fn capacity(&self) -> usize {
        self.segment.len()
    }

    pub(crate) fn bind(&mut self, owner: ConnectionId) {
        self.owner = Some(owner);
        self.filled = 0;
    }

    /// Clear per-operation state before the context goes back to the pool.
    pub(crate) fn unbind(&mut self) {
        self.owner = None;
        self.token = None;
        self.filled = 0;
    }

    /// Attach a connection's token, returning any token attached before.
    pub fn attach_token(&mut self, token: MessageToken) -> Option<MessageToken> {
        self.token.replace(token)
    }

    pub fn detach_token(&mut self) -> Option<MessageToken> {
        self.token.take()
    }

    pub fn token(&self) -> Option<&MessageToken> {
        self.token.as_ref()
    }

    /// Bytes moved by the last operation
    pub fn filled(&self) -> &[u8] {
        &self.segment.as_slice()[..self.filled]
    }

    /// Copy as much of `data` as fits into the segment, returning the count.
    pub fn load(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.segment.len());
        self.segment.as_mut_slice()[..n].copy_from_slice(&data[..n]);
        self.filled = n;
        n
    }

    /// Read at most one segment's worth of bytes. `Ok(0)` means the peer closed.
    pub async fn receive_from<R>(&mut self, reader: &mut R) -> io::Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        debug_assert_eq!(self.kind, OperationKind::Receive);
        self.filled = 0;
        let n = reader.read(self.segment.as_mut_slice()).await?;
        self.filled = n;
        Ok(n)
    }

    /// Write the loaded bytes in full.
    pub async fn transmit_to<W>(&mut self, writer: &mut W) -> io::Result<usize>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        debug_assert_eq!(self.kind, OperationKind::Send);
        let n = self.filled;
        writer.write_all(&self.segment.as_slice()[..n]).await?;
        Ok(n)
    }

    /// Feed the bytes of the last receive into the attached token.
    ///
    /// # Errors
    /// Propagates framing errors; fails with `ProtocolError::Custom` when no
    /// token is attached.
    pub fn complete_receive(&mut self) -> Result<Vec<Bytes>> {
        let Self {
            segment,
            token,
            filled,
            ..
        } = self;

        let token = token
            .as_mut()
            .ok_or_else(|| ProtocolError::Custom("No message token attached".into()))?;
        token.feed(&segment.as_slice()[..*filled])
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("slot", &self.slot)
            .field("kind", &self.kind)
            .field("segment", &self.segment)
            .field("owner", &self.owner)
            .field("filled", &self.filled)
            .finish()
    }
}
