//! # Connection State
//!
//! Per-connection bookkeeping shared between the manager, the receive task and
//! the send task of one connection.
//!
//! ## Lifecycle
//! `Connecting → Connected → Closing → Closed`. Transitions only move forward;
//! the first reason recorded for leaving `Connected` is the one reported.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::cipher::Cipher;

/// Identifier of one connection within a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a connection left the `Connected` state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// `close` was called on this side
    LocalClose,
    /// The peer closed its end (zero-byte read)
    PeerClosed,
    /// No traffic in either direction for the idle window
    IdleTimeout,
    /// The peer violated framing (oversized or truncated frame)
    FrameError,
    /// A frame body failed to decrypt
    DecryptionFailure,
    /// Socket read or write failed
    TransportError,
    /// The manager is shutting down
    Shutdown,
}

impl DisconnectReason {
    /// Reason recorded when `err` ends a connection.
    pub fn for_error(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::FrameSize { .. } => DisconnectReason::FrameError,
            ProtocolError::DecryptionFailure => DisconnectReason::DecryptionFailure,
            ProtocolError::ConnectionTimeout => DisconnectReason::IdleTimeout,
            ProtocolError::PoolClosed => DisconnectReason::Shutdown,
            _ => DisconnectReason::TransportError,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::LocalClose => "closed locally",
            DisconnectReason::PeerClosed => "closed by peer",
            DisconnectReason::IdleTimeout => "idle timeout",
            DisconnectReason::FrameError => "framing error",
            DisconnectReason::DecryptionFailure => "decryption failure",
            DisconnectReason::TransportError => "transport error",
            DisconnectReason::Shutdown => "manager shutdown",
        };
        f.write_str(text)
    }
}

/// One queued outbound message, already payload-encoded but not yet encrypted.
pub(crate) struct SendRequest {
    pub(crate) payload: Vec<u8>,
    pub(crate) done: oneshot::Sender<Result<()>>,
}

/// Resolves once a queued message has been fully written.
///
/// Resolves to `ProtocolError::ConnectionClosed` if the connection closed
/// before the message went out.
#[derive(Debug)]
#[must_use = "a receipt does nothing unless awaited"]
pub struct SendReceipt {
    rx: oneshot::Receiver<Result<()>>,
}

impl SendReceipt {
    pub(crate) fn new(rx: oneshot::Receiver<Result<()>>) -> Self {
        Self { rx }
    }
}

impl Future for SendReceipt {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ProtocolError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Shared state of one live connection
pub(crate) struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    state: AtomicU8,
    reason: OnceLock<DisconnectReason>,
    cancel: CancellationToken,
    finished: CancellationToken,
    last_activity: Mutex<Instant>,
    cipher: Mutex<Box<dyn Cipher>>,
    send_tx: mpsc::Sender<SendRequest>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        peer: SocketAddr,
        cancel: CancellationToken,
        cipher: Box<dyn Cipher>,
        send_tx: mpsc::Sender<SendRequest>,
    ) -> Self {
        Self {
            id,
            peer,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            reason: OnceLock::new(),
            cancel,
            finished: CancellationToken::new(),
            last_activity: Mutex::new(Instant::now()),
            cipher: Mutex::new(cipher),
            send_tx,
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; fails if another transition happened first.
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Enter `Closing` and cancel both loops. Only the first reason sticks.
    ///
    /// Returns `true` if this call started the close.
    pub(crate) fn begin_close(&self, reason: DisconnectReason) -> bool {
        let _ = self.reason.set(reason);
        let started = self.transition(ConnectionState::Connected, ConnectionState::Closing)
            || self.transition(ConnectionState::Connecting, ConnectionState::Closing);
        self.cancel.cancel();
        started
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.finished.cancel();
    }

    pub(crate) fn reason(&self) -> DisconnectReason {
        self.reason
            .get()
            .copied()
            .unwrap_or(DisconnectReason::Shutdown)
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolves once the connection reached `Closed`.
    pub(crate) async fn wait_closed(&self) {
        self.finished.cancelled().await;
    }

    pub(crate) fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<SendRequest> {
        &self.send_tx
    }

    pub(crate) fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut cipher = self
            .cipher
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_CIPHER_LOCK.into()))?;
        cipher.encrypt(plaintext)
    }

    pub(crate) fn decrypt(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut cipher = self
            .cipher
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_CIPHER_LOCK.into()))?;
        cipher.decrypt(body)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}
