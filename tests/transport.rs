//! Integration tests for the connection manager over real TCP sockets

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use framewire::config::{NetworkConfig, TransportConfig};
use framewire::core::codec::FrameCodec;
use framewire::core::pool::ContextPool;
use framewire::core::settings::TransportSettings;
use framewire::core::token::{encode_frame, FrameFormat, MessageToken};
use framewire::error::ProtocolError;
use framewire::protocol::cipher::ChaChaCipher;
use framewire::protocol::payload::{BincodeCodec, PayloadCodec, RawCodec};
use framewire::transport::connection::{ConnectionId, ConnectionState, DisconnectReason};
use framewire::transport::events::{ChannelHandler, TransportEvent};
use framewire::transport::manager::NetworkManager;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

type Events<M> = UnboundedReceiver<TransportEvent<M>>;

fn small_config(receive_count: usize, send_count: usize, buffer_size: usize) -> TransportConfig {
    TransportConfig {
        receive_count,
        send_count,
        buffer_size,
        max_frame_size: 1024,
        ..TransportConfig::default()
    }
}

async fn raw_server(config: TransportConfig) -> (NetworkManager<RawCodec>, Events<Bytes>, SocketAddr) {
    let (handler, events) = ChannelHandler::new();
    let manager = NetworkManager::builder(RawCodec)
        .config(config)
        .handler(handler)
        .build()
        .unwrap();
    let addr = manager.start("127.0.0.1:0").await.unwrap();
    (manager, events, addr)
}

async fn next_event<M>(events: &mut Events<M>) -> TransportEvent<M> {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn expect_connected<M: std::fmt::Debug>(events: &mut Events<M>) -> ConnectionId {
    match next_event(events).await {
        TransportEvent::Connected { connection, .. } => connection,
        other => panic!("expected Connected, got {other:?}"),
    }
}

/// Skip events until the connection's disconnect, returning what came before.
async fn until_disconnected<M>(
    events: &mut Events<M>,
    id: ConnectionId,
) -> (DisconnectReason, Vec<TransportEvent<M>>) {
    let mut seen = Vec::new();
    loop {
        match next_event(events).await {
            TransportEvent::Disconnected { connection, reason } if connection == id => {
                return (reason, seen)
            }
            other => seen.push(other),
        }
    }
}

fn frame(body: &[u8]) -> Bytes {
    encode_frame(&FrameFormat::new(Default::default(), Default::default(), 1024), body).unwrap()
}

// ============================================================================
// Receive path
// ============================================================================

#[tokio::test]
async fn frame_split_across_three_receives_yields_one_message() {
    let (server, mut events, addr) = raw_server(small_config(2, 2, 8)).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    let id = expect_connected(&mut events).await;

    // 4-byte header + 16-byte body = 20 bytes on the wire
    let body: Vec<u8> = (0u8..16).collect();
    let wire = frame(&body);
    assert_eq!(wire.len(), 20);

    client.write_all(&wire[..8]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.write_all(&wire[8..16]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err(), "no message before the last completion");

    client.write_all(&wire[16..]).await.unwrap();
    match next_event(&mut events).await {
        TransportEvent::Message {
            connection,
            message,
        } => {
            assert_eq!(connection, id);
            assert_eq!(&message[..], &body[..]);
        }
        other => panic!("expected Message, got {other:?}"),
    }

    let pool = server.settings().receive_pool();
    let stats = pool.stats();
    assert_eq!(pool.available(), 2);
    assert!(stats.high_water <= 2);
    assert!(stats.checkouts >= 3);
    assert_eq!(stats.checkouts, stats.releases);
    assert_eq!(server.metrics().snapshot().frames_received, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn several_frames_in_one_write_are_all_delivered() {
    let (server, mut events, addr) = raw_server(small_config(2, 2, 64)).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    expect_connected(&mut events).await;

    let mut wire = Vec::new();
    for body in [&b"one"[..], b"", b"three"] {
        wire.extend_from_slice(&frame(body));
    }
    client.write_all(&wire).await.unwrap();

    let mut received = Vec::new();
    for _ in 0..3 {
        match next_event(&mut events).await {
            TransportEvent::Message { message, .. } => received.push(message),
            other => panic!("expected Message, got {other:?}"),
        }
    }
    assert_eq!(
        received,
        vec![
            Bytes::from_static(b"one"),
            Bytes::new(),
            Bytes::from_static(b"three")
        ]
    );

    server.shutdown().await;
}

#[tokio::test]
async fn close_mid_frame_drops_partial_frame() {
    let (server, mut events, addr) = raw_server(small_config(2, 2, 8)).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    let id = expect_connected(&mut events).await;

    let wire = frame(&[7u8; 16]);
    client.write_all(&wire[..7]).await.unwrap();

    tokio::time::timeout(WAIT, async {
        while server.metrics().snapshot().bytes_received < 7 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    server.close(id).await.unwrap();
    let (reason, before) = until_disconnected(&mut events, id).await;
    assert_eq!(reason, DisconnectReason::LocalClose);
    assert!(before
        .iter()
        .all(|e| !matches!(e, TransportEvent::Message { .. })));

    let stats = server.settings().receive_pool().stats();
    assert_eq!(stats.available, 2);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.checkouts, stats.releases);
    assert_eq!(server.connection_count(), 0);
    assert_eq!(server.connection_state(id), None);

    // The rest of the frame arriving later changes nothing.
    let _ = client.write_all(&wire[7..]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());

    server.shutdown().await;
}

#[tokio::test]
async fn frame_before_oversized_header_is_delivered() {
    let (server, mut events, addr) = raw_server(small_config(2, 2, 64)).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    let id = expect_connected(&mut events).await;

    let mut wire = frame(b"complete").to_vec();
    wire.extend_from_slice(&1_000_000u32.to_be_bytes());
    client.write_all(&wire).await.unwrap();

    let (reason, before) = until_disconnected(&mut events, id).await;
    assert_eq!(reason, DisconnectReason::FrameError);

    let message_at = before
        .iter()
        .position(|e| matches!(e, TransportEvent::Message { message, .. } if &message[..] == b"complete"))
        .expect("complete frame delivered");
    let error_at = before
        .iter()
        .position(|e| matches!(
            e,
            TransportEvent::Error {
                error: ProtocolError::FrameSize { declared: 1_000_000, max: 1024 },
                ..
            }
        ))
        .expect("framing error reported");
    assert!(message_at < error_at);
    assert_eq!(server.metrics().snapshot().frames_received, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn oversized_frame_closes_only_that_connection() {
    let (server, mut events, addr) = raw_server(small_config(2, 2, 16)).await;

    let mut bad = TcpStream::connect(addr).await.unwrap();
    let bad_id = expect_connected(&mut events).await;
    let mut good = TcpStream::connect(addr).await.unwrap();
    let good_id = expect_connected(&mut events).await;

    bad.write_all(&1_000_000u32.to_be_bytes()).await.unwrap();

    let (reason, before) = until_disconnected(&mut events, bad_id).await;
    assert_eq!(reason, DisconnectReason::FrameError);
    assert!(before.iter().any(|e| matches!(
        e,
        TransportEvent::Error {
            error: ProtocolError::FrameSize { declared: 1_000_000, max: 1024 },
            ..
        }
    )));

    // The offending socket sees EOF.
    let mut buf = [0u8; 4];
    let n = tokio::time::timeout(WAIT, bad.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0);

    good.write_all(&frame(b"still here")).await.unwrap();
    match next_event(&mut events).await {
        TransportEvent::Message {
            connection,
            message,
        } => {
            assert_eq!(connection, good_id);
            assert_eq!(&message[..], b"still here");
        }
        other => panic!("expected Message, got {other:?}"),
    }
    assert_eq!(server.connection_state(good_id), Some(ConnectionState::Connected));
    assert_eq!(server.metrics().snapshot().frame_errors, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn peer_close_is_reported() {
    let (server, mut events, addr) = raw_server(small_config(2, 2, 64)).await;
    let client = TcpStream::connect(addr).await.unwrap();
    let id = expect_connected(&mut events).await;

    drop(client);
    let (reason, _) = until_disconnected(&mut events, id).await;
    assert_eq!(reason, DisconnectReason::PeerClosed);
    assert_eq!(server.settings().receive_pool().available(), 2);

    server.shutdown().await;
}

#[tokio::test]
async fn idle_connection_times_out_without_holding_contexts() {
    let config = TransportConfig {
        idle_timeout: Duration::from_millis(200),
        ..small_config(1, 1, 64)
    };
    let (server, mut events, addr) = raw_server(config).await;
    let _client = TcpStream::connect(addr).await.unwrap();
    let id = expect_connected(&mut events).await;

    // Idle connections hold no receive context.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.settings().receive_pool().in_use(), 0);

    let (reason, _) = until_disconnected(&mut events, id).await;
    assert_eq!(reason, DisconnectReason::IdleTimeout);

    server.shutdown().await;
}

// ============================================================================
// Cancellation while a receive context is held
// ============================================================================

/// Wait until `pool` has exactly `n` contexts checked out.
async fn until_in_use(pool: &ContextPool, n: usize) {
    tokio::time::timeout(WAIT, async {
        while pool.in_use() != n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

fn assert_reclaimed_once(pool: &ContextPool) {
    let stats = pool.stats();
    assert_eq!(stats.checkouts, 1);
    assert_eq!(stats.releases, 1);
    assert_eq!(stats.reclaimed, 1);
    assert_eq!(stats.in_use, 0);
    assert_eq!(pool.available(), pool.capacity());

    // Every context comes back clean and none is handed out twice.
    let owner = ConnectionId::new(2);
    let held: Vec<_> = (0..pool.capacity())
        .map(|_| pool.try_checkout(owner).unwrap())
        .collect();
    assert!(held.iter().all(|ctx| ctx.token().is_none()));
    assert!(held.iter().all(|ctx| ctx.owner() == Some(owner)));
    assert_ne!(held[0].slot(), held[1].slot());
    assert!(matches!(
        pool.try_checkout(owner),
        Err(ProtocolError::PoolExhausted(_))
    ));
}

#[tokio::test]
async fn cancelling_pending_receive_reclaims_context() {
    let settings = TransportSettings::new(2, 1, 32).unwrap();
    let pool = settings.receive_pool().clone();
    let cancel = CancellationToken::new();
    // The peer half stays open and never writes, so the read never completes.
    let (mut reader, _peer) = tokio::io::duplex(64);

    let task = tokio::spawn({
        let pool = pool.clone();
        let cancel = cancel.clone();
        async move {
            let mut ctx = pool.checkout(ConnectionId::new(1)).await.unwrap();
            ctx.attach_token(MessageToken::new(FrameFormat::default()));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                read = ctx.receive_from(&mut reader) => Some(read.unwrap()),
            }
        }
    });

    until_in_use(&pool, 1).await;
    cancel.cancel();
    assert_eq!(tokio::time::timeout(WAIT, task).await.unwrap().unwrap(), None);

    assert_reclaimed_once(&pool);
}

#[tokio::test]
async fn aborting_receive_task_reclaims_context() {
    let settings = TransportSettings::new(2, 1, 32).unwrap();
    let pool = settings.receive_pool().clone();
    let (mut reader, _peer) = tokio::io::duplex(64);

    let task = tokio::spawn({
        let pool = pool.clone();
        async move {
            let mut ctx = pool.checkout(ConnectionId::new(1)).await.unwrap();
            ctx.attach_token(MessageToken::new(FrameFormat::default()));
            ctx.receive_from(&mut reader).await
        }
    });

    until_in_use(&pool, 1).await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert_reclaimed_once(&pool);
}

// ============================================================================
// Send path
// ============================================================================

#[tokio::test]
async fn concurrent_sends_arrive_in_call_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client = NetworkManager::builder(RawCodec)
        .config(small_config(1, 1, 8))
        .build()
        .unwrap();
    let id = client.connect(addr).await.unwrap();
    let (socket, _) = listener.accept().await.unwrap();

    let a = Bytes::from(vec![b'a'; 20]);
    let b = Bytes::from(vec![b'b'; 20]);
    let c = Bytes::from(vec![b'c'; 20]);

    let (ra, rb, rc) = tokio::join!(client.send(id, &a), client.send(id, &b), client.send(id, &c));
    ra.unwrap();
    rb.unwrap();
    rc.unwrap();

    let mut frames = FramedRead::new(socket, FrameCodec::new(*client.frame_format()));
    for expected in [&a, &b, &c] {
        let frame = tokio::time::timeout(WAIT, frames.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&frame, expected);
    }

    let stats = client.settings().send_pool().stats();
    assert_eq!(stats.high_water, 1);
    assert_eq!(stats.available, 1);
    // 24 bytes per frame in 8-byte chunks
    assert_eq!(stats.checkouts, 9);
    assert_eq!(client.metrics().snapshot().frames_sent, 3);

    client.shutdown().await;
}

#[tokio::test]
async fn send_to_unknown_or_closed_connection_fails() {
    let (server, mut events, addr) = raw_server(small_config(2, 2, 64)).await;
    let client = NetworkManager::builder(RawCodec)
        .config(small_config(1, 1, 64))
        .build()
        .unwrap();

    let missing = ConnectionId::new(999);
    assert!(matches!(
        client.send(missing, &Bytes::from_static(b"x")).await,
        Err(ProtocolError::NotConnected(id)) if id == missing
    ));

    let id = client.connect(addr).await.unwrap();
    expect_connected(&mut events).await;
    client.close(id).await.unwrap();

    assert!(matches!(
        client.enqueue(id, &Bytes::from_static(b"late")),
        Err(ProtocolError::NotConnected(_))
    ));
    assert!(client.close(id).await.is_err());

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn full_send_queue_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = TransportConfig {
        send_queue_limit: 1,
        ..small_config(1, 1, 64)
    };
    let client = NetworkManager::builder(RawCodec).config(config).build().unwrap();
    let id = client.connect(addr).await.unwrap();
    let _socket = listener.accept().await.unwrap();

    // Both enqueues happen before the send task gets to run.
    let first = client.enqueue(id, &Bytes::from_static(b"first")).unwrap();
    assert!(matches!(
        client.enqueue(id, &Bytes::from_static(b"second")),
        Err(ProtocolError::SendQueueFull(_))
    ));
    first.await.unwrap();

    client.shutdown().await;
}

#[tokio::test]
async fn oversized_send_is_rejected_without_closing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client = NetworkManager::builder(RawCodec)
        .config(small_config(1, 1, 64))
        .build()
        .unwrap();
    let id = client.connect(addr).await.unwrap();
    let (socket, _) = listener.accept().await.unwrap();

    let result = client.send(id, &Bytes::from(vec![0u8; 4096])).await;
    assert!(matches!(result, Err(ProtocolError::MessageTooLarge { .. })));
    assert_eq!(client.connection_state(id), Some(ConnectionState::Connected));

    client.send(id, &Bytes::from_static(b"small")).await.unwrap();
    let mut frames = FramedRead::new(socket, FrameCodec::new(*client.frame_format()));
    let frame = tokio::time::timeout(WAIT, frames.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(&frame[..], b"small");

    client.shutdown().await;
}

// ============================================================================
// Cipher and codec collaborators
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum GameMessage {
    Login { user: String },
    Ack(u32),
}

const KEY: [u8; 32] = [0x5A; 32];

#[tokio::test]
async fn encrypted_bincode_round_trip() {
    let (server_handler, mut server_events) = ChannelHandler::new();
    let server = NetworkManager::builder(BincodeCodec::<GameMessage>::new())
        .config(small_config(2, 2, 16))
        .cipher_factory(ChaChaCipher::factory(KEY))
        .handler(server_handler)
        .build()
        .unwrap();
    let addr = server.start("127.0.0.1:0").await.unwrap();

    let (client_handler, mut client_events) = ChannelHandler::new();
    let client = NetworkManager::builder(BincodeCodec::<GameMessage>::new())
        .config(small_config(2, 2, 16))
        .cipher_factory(ChaChaCipher::factory(KEY))
        .handler(client_handler)
        .build()
        .unwrap();

    let client_id = client.connect(addr).await.unwrap();
    expect_connected(&mut client_events).await;
    let server_id = expect_connected(&mut server_events).await;
    assert_eq!(client.peer_addr(client_id), Some(addr));

    let login = GameMessage::Login {
        user: "barbarian-king".into(),
    };
    client.send(client_id, &login).await.unwrap();

    match next_event(&mut server_events).await {
        TransportEvent::Message { message, .. } => assert_eq!(message, login),
        other => panic!("expected Message, got {other:?}"),
    }

    server.send(server_id, &GameMessage::Ack(1)).await.unwrap();
    match next_event(&mut client_events).await {
        TransportEvent::Message { message, .. } => assert_eq!(message, GameMessage::Ack(1)),
        other => panic!("expected Message, got {other:?}"),
    }

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn decryption_failure_closes_connection() {
    let (handler, mut events) = ChannelHandler::new();
    let server = NetworkManager::builder(RawCodec)
        .config(small_config(2, 2, 64))
        .cipher_factory(ChaChaCipher::factory(KEY))
        .handler(handler)
        .build()
        .unwrap();
    let addr = server.start("127.0.0.1:0").await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let id = expect_connected(&mut events).await;
    client.write_all(&frame(&[0u8; 64])).await.unwrap();

    let (reason, before) = until_disconnected(&mut events, id).await;
    assert_eq!(reason, DisconnectReason::DecryptionFailure);
    assert!(before.iter().any(|e| matches!(
        e,
        TransportEvent::Error {
            error: ProtocolError::DecryptionFailure,
            ..
        }
    )));

    server.shutdown().await;
}

#[tokio::test]
async fn decode_failure_keeps_connection_open() {
    let (handler, mut events) = ChannelHandler::new();
    let server = NetworkManager::builder(BincodeCodec::<GameMessage>::new())
        .config(small_config(2, 2, 64))
        .handler(handler)
        .build()
        .unwrap();
    let addr = server.start("127.0.0.1:0").await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let id = expect_connected(&mut events).await;

    client.write_all(&frame(&[0xFF; 8])).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Error {
            error: ProtocolError::DeserializeError(_),
            ..
        }
    ));

    let valid = BincodeCodec::<GameMessage>::new()
        .encode(&GameMessage::Ack(7))
        .unwrap();
    client.write_all(&frame(&valid)).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Message {
            message: GameMessage::Ack(7),
            ..
        }
    ));
    assert_eq!(server.connection_state(id), Some(ConnectionState::Connected));

    server.shutdown().await;
}

// ============================================================================
// Configured addresses
// ============================================================================

#[tokio::test]
async fn configured_addresses_drive_start_and_connect() {
    let mut config = NetworkConfig::default();
    config.server.address = "127.0.0.1:0".to_string();
    config.transport = small_config(2, 2, 64);

    let (handler, mut events) = ChannelHandler::new();
    let server = NetworkManager::builder(RawCodec)
        .network_config(&config)
        .handler(handler)
        .build()
        .unwrap();
    let addr = server.start_configured().await.unwrap();
    assert!(addr.ip().is_loopback());
    assert_ne!(addr.port(), 0);

    config.client.address = addr.to_string();
    let client = NetworkManager::builder(RawCodec)
        .network_config(&config)
        .build()
        .unwrap();
    let id = client.connect_configured().await.unwrap();
    expect_connected(&mut events).await;
    assert_eq!(client.peer_addr(id), Some(addr));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn configured_start_without_network_config_fails() {
    let manager = NetworkManager::builder(RawCodec)
        .config(small_config(1, 1, 16))
        .build()
        .unwrap();

    assert!(matches!(
        manager.start_configured().await,
        Err(ProtocolError::ConfigError(_))
    ));
    assert!(matches!(
        manager.connect_configured().await,
        Err(ProtocolError::ConfigError(_))
    ));
    manager.shutdown().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn shutdown_closes_everything_and_releases_arena() {
    let (server, mut events, addr) = raw_server(small_config(2, 2, 32)).await;
    let _a = TcpStream::connect(addr).await.unwrap();
    let _b = TcpStream::connect(addr).await.unwrap();
    let first = expect_connected(&mut events).await;
    let second = expect_connected(&mut events).await;
    assert_eq!(server.connection_count(), 2);

    let report = server.shutdown().await;
    assert!(report.is_clean());
    assert_eq!(server.connection_count(), 0);
    assert!(server.settings().arena_released());

    let mut reasons = Vec::new();
    for _ in 0..2 {
        match next_event(&mut events).await {
            TransportEvent::Disconnected { connection, reason } => {
                assert!(connection == first || connection == second);
                reasons.push(reason);
            }
            other => panic!("expected Disconnected, got {other:?}"),
        }
    }
    assert!(reasons.iter().all(|r| *r == DisconnectReason::Shutdown));

    // Idempotent, and the manager refuses new work.
    assert!(server.shutdown().await.is_clean());
    assert!(server.is_shut_down());
    assert!(server.connect(addr).await.is_err());
    assert!(TcpStream::connect(addr).await.is_err());
}
