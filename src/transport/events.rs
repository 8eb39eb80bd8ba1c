//! # Event Surface
//!
//! Callbacks the manager invokes as connections come and go.
//!
//! Callbacks run on the connection's receive task, so `on_message` for one
//! connection is always called in wire order. Keep them short; hand heavy
//! work to another task (or use [`ChannelHandler`]).

use std::marker::PhantomData;
use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::error::ProtocolError;
use crate::transport::connection::{ConnectionId, DisconnectReason};

pub trait TransportHandler<M>: Send + Sync + 'static {
    /// The connection reached `Connected`; fires before any message.
    fn on_connected(&self, _connection: ConnectionId, _peer: SocketAddr) {}

    /// One decrypted, decoded message.
    fn on_message(&self, _connection: ConnectionId, _message: M) {}

    /// The connection reached `Closed` and all its contexts are back in the pools.
    fn on_disconnected(&self, _connection: ConnectionId, _reason: DisconnectReason) {}

    /// A connection-local error; fatal ones are followed by `on_disconnected`.
    fn on_error(&self, _connection: ConnectionId, _error: ProtocolError) {}
}

/// Handler that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl<M> TransportHandler<M> for NoopHandler {}

#[derive(Debug)]
pub enum TransportEvent<M> {
    Connected {
        connection: ConnectionId,
        peer: SocketAddr,
    },
    Message {
        connection: ConnectionId,
        message: M,
    },
    Disconnected {
        connection: ConnectionId,
        reason: DisconnectReason,
    },
    Error {
        connection: ConnectionId,
        error: ProtocolError,
    },
}

impl<M> TransportEvent<M> {
    pub fn connection(&self) -> ConnectionId {
        match self {
            TransportEvent::Connected { connection, .. }
            | TransportEvent::Message { connection, .. }
            | TransportEvent::Disconnected { connection, .. }
            | TransportEvent::Error { connection, .. } => *connection,
        }
    }
}

/// Forwards every callback as a [`TransportEvent`] onto an unbounded channel.
pub struct ChannelHandler<M> {
    tx: mpsc::UnboundedSender<TransportEvent<M>>,
    _marker: PhantomData<fn(M)>,
}

impl<M: Send + 'static> ChannelHandler<M> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent<M>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                _marker: PhantomData,
            },
            rx,
        )
    }

    fn forward(&self, event: TransportEvent<M>) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl<M: Send + 'static> TransportHandler<M> for ChannelHandler<M> {
    fn on_connected(&self, connection: ConnectionId, peer: SocketAddr) {
        self.forward(TransportEvent::Connected { connection, peer });
    }

    fn on_message(&self, connection: ConnectionId, message: M) {
        self.forward(TransportEvent::Message {
            connection,
            message,
        });
    }

    fn on_disconnected(&self, connection: ConnectionId, reason: DisconnectReason) {
        self.forward(TransportEvent::Disconnected { connection, reason });
    }

    fn on_error(&self, connection: ConnectionId, error: ProtocolError) {
        self.forward(TransportEvent::Error { connection, error });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_handler_forwards_in_order() {
        let (handler, mut rx) = ChannelHandler::<u32>::new();
        let id = ConnectionId::new(3);

        handler.on_connected(id, "127.0.0.1:1".parse().unwrap());
        handler.on_message(id, 99);
        handler.on_error(id, ProtocolError::DecryptionFailure);
        handler.on_disconnected(id, DisconnectReason::DecryptionFailure);

        assert!(matches!(rx.recv().await, Some(TransportEvent::Connected { .. })));
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Message { message: 99, .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Error {
                error: ProtocolError::DecryptionFailure,
                ..
            })
        ));
        let last = rx.recv().await.unwrap();
        assert_eq!(last.connection(), id);
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (handler, rx) = ChannelHandler::<()>::new();
        drop(rx);
        handler.on_message(ConnectionId::new(1), ());
    }
}
