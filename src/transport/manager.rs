//! # Connection Manager
//!
//! Accepts and opens TCP connections and drives their receive and send loops
//! over the shared context pools.
//!
//! ## Per-connection tasks
//! - **Receive task**: waits for socket readiness, checks out a receive
//!   context, reads one segment's worth of bytes, feeds the connection's
//!   message token, returns the context, then decrypts, decodes and dispatches
//!   every completed frame in wire order.
//! - **Send task**: drains the connection's FIFO send queue; each message is
//!   encrypted, framed and written as segment-sized chunks, one send context
//!   per chunk.
//! - **Supervisor**: waits for both loops, marks the connection `Closed`, and
//!   fires `on_disconnected` once every context the connection held is back.
//!
//! ## Example
//! ```rust,no_run
//! use framewire::config::TransportConfig;
//! use framewire::protocol::payload::RawCodec;
//! use framewire::transport::events::ChannelHandler;
//! use framewire::transport::manager::NetworkManager;
//!
//! # async fn run() -> framewire::error::Result<()> {
//! let (handler, mut events) = ChannelHandler::new();
//! let manager = NetworkManager::builder(RawCodec)
//!     .config(TransportConfig::default())
//!     .handler(handler)
//!     .build()?;
//!
//! let addr = manager.start("127.0.0.1:0").await?;
//! println!("listening on {addr}");
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{NetworkConfig, TransportConfig, DEFAULT_CONNECT_TIMEOUT};
use crate::core::context::OperationKind;
use crate::core::pool::{ContextPool, PooledContext};
use crate::core::settings::{ShutdownReport, TransportSettings};
use crate::core::token::{encode_frame, FrameFormat, MessageToken, SendChunks};
use crate::error::{ErrorClass, ProtocolError, Result};
use crate::protocol::cipher::{CipherFactory, PlainCipherFactory};
use crate::protocol::payload::PayloadCodec;
use crate::transport::connection::{
    Connection, ConnectionId, ConnectionState, DisconnectReason, SendReceipt, SendRequest,
};
use crate::transport::events::{NoopHandler, TransportHandler};
use crate::utils::metrics::{Metrics, Timer};
use crate::utils::timeout::with_timeout_error;

/// Default time to wait for connections and contexts during shutdown
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Builder for [`NetworkManager`]
pub struct ManagerBuilder<C: PayloadCodec> {
    codec: C,
    config: TransportConfig,
    handler: Arc<dyn TransportHandler<C::Message>>,
    cipher_factory: Box<dyn CipherFactory>,
    connect_timeout: Duration,
    shutdown_timeout: Duration,
    max_connections: Option<usize>,
    listen_address: Option<String>,
    remote_address: Option<String>,
}

impl<C: PayloadCodec> ManagerBuilder<C> {
    fn new(codec: C) -> Self {
        Self {
            codec,
            config: TransportConfig::default(),
            handler: Arc::new(NoopHandler),
            cipher_factory: Box::new(PlainCipherFactory),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            max_connections: None,
            listen_address: None,
            remote_address: None,
        }
    }

    /// Transport settings: pool sizes, segment size, framing, timeouts.
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Take transport, client and server settings from a full configuration.
    pub fn network_config(mut self, config: &NetworkConfig) -> Self {
        self.config = config.transport.clone();
        self.connect_timeout = config.client.connection_timeout;
        self.shutdown_timeout = config.server.shutdown_timeout;
        self.max_connections = Some(config.server.max_connections);
        self.listen_address = Some(config.server.address.clone());
        self.remote_address = Some(config.client.address.clone());
        self
    }

    pub fn handler<H>(mut self, handler: H) -> Self
    where
        H: TransportHandler<C::Message>,
    {
        self.handler = Arc::new(handler);
        self
    }

    pub fn cipher_factory<F: CipherFactory>(mut self, factory: F) -> Self {
        self.cipher_factory = Box::new(factory);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Refuse accepted connections beyond this count.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Validate the configuration and allocate the arena and both pools.
    ///
    /// # Errors
    /// `ConfigError` for an invalid configuration, `Capacity` if the arena
    /// cannot be allocated.
    pub fn build(self) -> Result<NetworkManager<C>> {
        self.config.validate_strict()?;
        let settings = TransportSettings::from_config(&self.config)?;
        let format = self.config.frame_format();

        Ok(NetworkManager {
            inner: Arc::new(ManagerInner {
                format,
                idle_timeout: self.config.idle_timeout,
                send_queue_limit: self.config.send_queue_limit,
                connect_timeout: self.connect_timeout,
                shutdown_timeout: self.shutdown_timeout,
                max_connections: self.max_connections,
                listen_address: self.listen_address,
                remote_address: self.remote_address,
                settings,
                codec: self.codec,
                cipher_factory: self.cipher_factory,
                handler: self.handler,
                connections: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                root: CancellationToken::new(),
                shut_down: AtomicBool::new(false),
                metrics: Metrics::new(),
            }),
        })
    }
}

/// Owns the context pools and every live connection.
///
/// Cloning yields another handle to the same manager.
pub struct NetworkManager<C: PayloadCodec> {
    inner: Arc<ManagerInner<C>>,
}

impl<C: PayloadCodec> Clone for NetworkManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ManagerInner<C: PayloadCodec> {
    format: FrameFormat,
    idle_timeout: Duration,
    send_queue_limit: usize,
    connect_timeout: Duration,
    shutdown_timeout: Duration,
    max_connections: Option<usize>,
    listen_address: Option<String>,
    remote_address: Option<String>,
    settings: TransportSettings,
    codec: C,
    cipher_factory: Box<dyn CipherFactory>,
    handler: Arc<dyn TransportHandler<C::Message>>,
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    root: CancellationToken,
    shut_down: AtomicBool,
    metrics: Metrics,
}

impl<C: PayloadCodec> NetworkManager<C> {
    pub fn builder(codec: C) -> ManagerBuilder<C> {
        ManagerBuilder::new(codec)
    }

    /// Bind a listener and accept connections until shutdown.
    ///
    /// Returns the bound address, which resolves port `0` to the real port.
    #[instrument(skip(self, addr))]
    pub async fn start<A: ToSocketAddrs>(&self, addr: A) -> Result<SocketAddr> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(ProtocolError::PoolClosed);
        }

        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(address = %local, "Listening");

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(accept_loop(inner, listener));
        self.inner
            .listeners
            .lock()
            .map_err(|_| ProtocolError::Custom("Listener registry lock poisoned".into()))?
            .push(handle);

        Ok(local)
    }

    /// Listen on the server address taken from [`ManagerBuilder::network_config`].
    ///
    /// # Errors
    /// `ConfigError` when no server address is configured or it does not parse.
    pub async fn start_configured(&self) -> Result<SocketAddr> {
        let addr = configured_address(self.inner.listen_address.as_deref(), "server")?;
        self.start(addr).await
    }

    /// Connect to the client address taken from [`ManagerBuilder::network_config`].
    ///
    /// # Errors
    /// `ConfigError` when no client address is configured or it does not parse.
    pub async fn connect_configured(&self) -> Result<ConnectionId> {
        let addr = configured_address(self.inner.remote_address.as_deref(), "client")?;
        self.connect(addr).await
    }

    /// Open a connection to `addr`; resolves once it is `Connected`.
    #[instrument(skip(self), fields(peer = %addr))]
    pub async fn connect(&self, addr: SocketAddr) -> Result<ConnectionId> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(ProtocolError::PoolClosed);
        }

        let stream = with_timeout_error(
            async { TcpStream::connect(addr).await.map_err(ProtocolError::from) },
            self.inner.connect_timeout,
        )
        .await
        .map_err(|e| {
            self.inner.metrics.connection_error();
            e
        })?;

        self.inner.register(stream, addr)
    }

    /// Queue `message` and wait until its frame has been fully written.
    ///
    /// The message is queued before the first suspension point, so sends
    /// started in order on one connection are written in that order.
    pub async fn send(&self, connection: ConnectionId, message: &C::Message) -> Result<()> {
        self.enqueue(connection, message)?.await
    }

    /// Queue `message` without waiting for it to be written.
    ///
    /// # Errors
    /// `NotConnected` unless the connection is `Connected`; `SendQueueFull`
    /// when its queue is at the configured limit.
    pub fn enqueue(&self, connection: ConnectionId, message: &C::Message) -> Result<SendReceipt> {
        let conn = self
            .inner
            .connection(connection)
            .filter(|c| c.state() == ConnectionState::Connected)
            .ok_or(ProtocolError::NotConnected(connection))?;

        let payload = self.inner.codec.encode(message)?;
        let (done, rx) = oneshot::channel();

        match conn.sender().try_send(SendRequest { payload, done }) {
            Ok(()) => Ok(SendReceipt::new(rx)),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(conn_id = %connection, "Send queue full");
                Err(ProtocolError::SendQueueFull(connection))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ProtocolError::NotConnected(connection)),
        }
    }

    /// Close a connection and wait until it is `Closed`.
    ///
    /// Closing a connection that is already closing just waits for it.
    #[instrument(skip_all, fields(conn_id = %connection))]
    pub async fn close(&self, connection: ConnectionId) -> Result<()> {
        let conn = self
            .inner
            .connection(connection)
            .ok_or(ProtocolError::NotConnected(connection))?;

        conn.begin_close(DisconnectReason::LocalClose);
        conn.wait_closed().await;
        Ok(())
    }

    /// Stop listening, close every connection and tear down the pools.
    ///
    /// Idempotent; later calls return the report of what is still checked out.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> ShutdownReport {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::AcqRel) {
            return inner.settings.shutdown();
        }

        let _timer = Timer::start("transport_shutdown");
        info!(connections = inner.connection_count(), "Shutting down transport");

        let connections: Vec<Arc<Connection>> = inner
            .connections
            .lock()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default();

        for conn in &connections {
            conn.begin_close(DisconnectReason::Shutdown);
        }
        inner.root.cancel();

        let listeners: Vec<JoinHandle<()>> = inner
            .listeners
            .lock()
            .map(|mut handles| handles.drain(..).collect())
            .unwrap_or_default();
        for handle in listeners {
            let _ = handle.await;
        }

        let closing = futures::future::join_all(connections.iter().map(|c| c.wait_closed()));
        if tokio::time::timeout(inner.shutdown_timeout, closing).await.is_err() {
            warn!(
                timeout_ms = inner.shutdown_timeout.as_millis() as u64,
                "Connections still closing at shutdown timeout"
            );
        }

        let report = inner.settings.shutdown();
        if !report.is_clean()
            && tokio::time::timeout(inner.shutdown_timeout, inner.settings.shutdown_and_drain())
                .await
                .is_err()
        {
            warn!(
                receive_outstanding = inner.settings.receive_pool().in_use(),
                send_outstanding = inner.settings.send_pool().in_use(),
                "Contexts not returned before shutdown timeout"
            );
        }

        inner.metrics.log_metrics();
        info!(arena_released = inner.settings.arena_released(), "Transport shut down");
        report
    }

    /// `None` once the connection is closed and forgotten.
    pub fn connection_state(&self, connection: ConnectionId) -> Option<ConnectionState> {
        self.inner.connection(connection).map(|c| c.state())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connection_count()
    }

    pub fn peer_addr(&self, connection: ConnectionId) -> Option<SocketAddr> {
        self.inner.connection(connection).map(|c| c.peer())
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.inner.settings
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn frame_format(&self) -> &FrameFormat {
        &self.inner.format
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }
}

impl<C: PayloadCodec> std::fmt::Debug for NetworkManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("settings", &self.inner.settings)
            .field("connections", &self.inner.connection_count())
            .finish()
    }
}

impl<C: PayloadCodec> ManagerInner<C> {
    fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .ok()
            .and_then(|map| map.get(&id).cloned())
    }

    fn connection_count(&self) -> usize {
        self.connections.lock().map(|map| map.len()).unwrap_or(0)
    }

    /// Track a fresh socket, announce it and spawn its tasks.
    fn register(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<ConnectionId> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (send_tx, send_rx) = mpsc::channel(self.send_queue_limit);
        let conn = Arc::new(Connection::new(
            id,
            peer,
            self.root.child_token(),
            self.cipher_factory.create(id),
            send_tx,
        ));

        self.connections
            .lock()
            .map_err(|_| ProtocolError::Custom("Connection registry lock poisoned".into()))?
            .insert(id, Arc::clone(&conn));

        conn.transition(ConnectionState::Connecting, ConnectionState::Connected);
        self.metrics.connection_established();
        info!(conn_id = %id, peer = %peer, "Connection established");
        self.handler.on_connected(id, peer);

        let (reader, writer) = stream.into_split();
        tokio::spawn(supervise(Arc::clone(self), conn, reader, writer, send_rx));
        Ok(id)
    }

    /// Report `err`, returning the disconnect reason when it ends the connection.
    fn fail(&self, id: ConnectionId, err: ProtocolError) -> Option<DisconnectReason> {
        if err.class() == ErrorClass::Defect {
            error!(conn_id = %id, error = %err, "Context lifecycle violation");
        }
        let reason = err
            .is_fatal_to_connection()
            .then(|| DisconnectReason::for_error(&err));
        self.report(id, err);
        reason
    }

    fn report(&self, id: ConnectionId, err: ProtocolError) {
        match &err {
            ProtocolError::FrameSize { .. } | ProtocolError::MessageTooLarge { .. } => {
                self.metrics.frame_error()
            }
            ProtocolError::DecryptionFailure | ProtocolError::EncryptionFailure => {
                self.metrics.cipher_error()
            }
            ProtocolError::DeserializeError(_) => self.metrics.decode_error(),
            ProtocolError::Io(_) => self.metrics.connection_error(),
            _ => {}
        }
        self.handler.on_error(id, err);
    }
}

fn configured_address(address: Option<&str>, section: &str) -> Result<SocketAddr> {
    let address = address
        .ok_or_else(|| ProtocolError::ConfigError(format!("No {section} address configured")))?;
    address.parse().map_err(|e| {
        ProtocolError::ConfigError(format!("Invalid {section} address '{address}': {e}"))
    })
}

async fn accept_loop<C: PayloadCodec>(inner: Arc<ManagerInner<C>>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = inner.root.cancelled() => {
                debug!("Accept loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Some(max) = inner.max_connections {
                        if inner.connection_count() >= max {
                            warn!(peer = %peer, max, "Connection limit reached, refusing");
                            continue;
                        }
                    }
                    if let Err(e) = inner.register(stream, peer) {
                        error!(peer = %peer, error = %e, "Failed to register connection");
                    }
                }
                Err(e) => {
                    inner.metrics.connection_error();
                    warn!(error = %e, "Accept failed");
                }
            }
        }
    }
}

/// Run both loops of a connection, then finish the close.
async fn supervise<C: PayloadCodec>(
    inner: Arc<ManagerInner<C>>,
    conn: Arc<Connection>,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    send_rx: mpsc::Receiver<SendRequest>,
) {
    let receive = tokio::spawn(receive_loop(Arc::clone(&inner), Arc::clone(&conn), reader));
    let send = tokio::spawn(send_loop(Arc::clone(&inner), Arc::clone(&conn), writer, send_rx));

    let (received, sent) = tokio::join!(receive, send);
    for outcome in [received, sent] {
        if let Err(e) = outcome {
            error!(conn_id = %conn.id(), error = %e, "Connection task failed");
            conn.begin_close(DisconnectReason::TransportError);
        }
    }

    let id = conn.id();
    let reason = conn.reason();
    if let Ok(mut map) = inner.connections.lock() {
        map.remove(&id);
    }
    conn.mark_closed();
    inner.metrics.connection_closed();

    info!(conn_id = %id, peer = %conn.peer(), reason = %reason, "Connection closed");
    inner.handler.on_disconnected(id, reason);
}

/// Wait for a context, giving up when the connection is cancelled.
///
/// `None` means the connection is closing or the pool is shut down.
async fn checkout_context<C: PayloadCodec>(
    inner: &ManagerInner<C>,
    conn: &Connection,
    pool: &ContextPool,
) -> Option<PooledContext> {
    let ctx = match pool.try_checkout(conn.id()) {
        Ok(ctx) => ctx,
        Err(ProtocolError::PoolExhausted(kind)) => {
            inner.metrics.pool_exhausted();
            debug!(conn_id = %conn.id(), kind = %kind, "Pool exhausted, waiting for a context");
            tokio::select! {
                biased;
                _ = conn.cancel_token().cancelled() => return None,
                checked = pool.checkout(conn.id()) => checked.ok()?,
            }
        }
        Err(_) => return None,
    };
    inner.metrics.context_checkout(pool.kind());
    Some(ctx)
}

#[instrument(skip_all, fields(conn_id = %conn.id()))]
async fn receive_loop<C: PayloadCodec>(
    inner: Arc<ManagerInner<C>>,
    conn: Arc<Connection>,
    reader: OwnedReadHalf,
) {
    let reason = receive_until_closed(&inner, &conn, reader).await;
    if let Some(reason) = reason {
        conn.begin_close(reason);
    }
}

async fn receive_until_closed<C: PayloadCodec>(
    inner: &ManagerInner<C>,
    conn: &Connection,
    mut reader: OwnedReadHalf,
) -> Option<DisconnectReason> {
    let id = conn.id();
    let pool = inner.settings.receive_pool();
    let mut token = MessageToken::new(inner.format);

    loop {
        // No context is held while the socket is idle.
        let idle_left = inner.idle_timeout.saturating_sub(conn.idle_for());
        tokio::select! {
            biased;
            _ = conn.cancel_token().cancelled() => return None,
            ready = reader.readable() => {
                if let Err(e) = ready {
                    if let Some(reason) = inner.fail(id, e.into()) {
                        return Some(reason);
                    }
                    continue;
                }
            }
            _ = tokio::time::sleep(idle_left) => {
                if conn.idle_for() >= inner.idle_timeout {
                    debug!(idle_ms = conn.idle_for().as_millis() as u64, "Idle timeout");
                    if let Some(reason) = inner.fail(id, ProtocolError::ConnectionTimeout) {
                        return Some(reason);
                    }
                }
                continue;
            }
        }

        let mut ctx = checkout_context(inner, conn, pool).await?;
        ctx.attach_token(token);

        let read = tokio::select! {
            biased;
            _ = conn.cancel_token().cancelled() => return None,
            read = ctx.receive_from(&mut reader) => read,
        };

        let completed = match read {
            Ok(n) if n > 0 => {
                conn.touch();
                inner.metrics.bytes_read(n as u64);
                debug!(bytes = n, slot = ctx.slot(), "Receive completed");
                Some(ctx.complete_receive())
            }
            _ => None,
        };

        token = match ctx.detach_token() {
            Some(token) => token,
            None => {
                inner.report(id, ProtocolError::Custom("Message token missing from context".into()));
                return Some(DisconnectReason::TransportError);
            }
        };
        if let Err(e) = ctx.release() {
            error!(error = %e, "Receive context release failed");
        }

        let frames = match (read, completed) {
            (_, Some(Ok(frames))) => frames,
            (_, Some(Err(e))) => {
                warn!(error = %e, "Framing error");
                if let Some(reason) = inner.fail(id, e) {
                    return Some(reason);
                }
                Vec::new()
            }
            (Err(e), None) => {
                if let Some(reason) = inner.fail(id, e.into()) {
                    return Some(reason);
                }
                Vec::new()
            }
            (Ok(_), None) => {
                if token.has_partial_frame() {
                    debug!(buffered = token.buffered(), "Peer closed in the middle of a frame");
                }
                return Some(DisconnectReason::PeerClosed);
            }
        };

        for frame in frames {
            inner.metrics.frame_received();

            let plaintext = match conn.decrypt(&frame) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(error = %e, bytes = frame.len(), "Failed to decrypt frame");
                    if let Some(reason) = inner.fail(id, e) {
                        return Some(reason);
                    }
                    continue;
                }
            };

            match inner.codec.decode(&plaintext) {
                Ok(message) => inner.handler.on_message(id, message),
                Err(e) => {
                    debug!(error = %e, "Failed to decode payload");
                    if let Some(reason) = inner.fail(id, e) {
                        return Some(reason);
                    }
                }
            }

            if conn.cancel_token().is_cancelled() {
                return None;
            }
        }

        // Frames completed ahead of a framing error are dispatched first.
        if let Some(e) = token.take_error() {
            warn!(error = %e, "Framing error");
            if let Some(reason) = inner.fail(id, e) {
                return Some(reason);
            }
        }
    }
}

#[instrument(skip_all, fields(conn_id = %conn.id()))]
async fn send_loop<C: PayloadCodec>(
    inner: Arc<ManagerInner<C>>,
    conn: Arc<Connection>,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<SendRequest>,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = conn.cancel_token().cancelled() => break,
            request = queue.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let written = tokio::select! {
            biased;
            _ = conn.cancel_token().cancelled() => break,
            written = write_message(&inner, &conn, &mut writer, &request.payload) => written,
        };

        match written {
            Ok(()) => {
                let _ = request.done.send(Ok(()));
            }
            Err(e) if e.is_fatal_to_connection() => {
                warn!(error = %e, "Write failed");
                let _ = request.done.send(Err(ProtocolError::ConnectionClosed));
                let reason = DisconnectReason::for_error(&e);
                inner.report(conn.id(), e);
                conn.begin_close(reason);
                break;
            }
            // Nothing reached the socket, the stream is still aligned.
            Err(e) => {
                debug!(error = %e, "Message rejected before write");
                let _ = request.done.send(Err(e));
            }
        }
    }

    // Queued requests are dropped here; their receipts resolve to ConnectionClosed.
    queue.close();
    let _ = writer.shutdown().await;
}

/// Encrypt, frame and write one message chunk by chunk.
async fn write_message<C: PayloadCodec>(
    inner: &ManagerInner<C>,
    conn: &Connection,
    writer: &mut OwnedWriteHalf,
    payload: &[u8],
) -> Result<()> {
    let body = conn.encrypt(payload)?;
    let frame = encode_frame(&inner.format, &body)?;
    let pool = inner.settings.send_pool();

    for chunk in SendChunks::new(frame, pool.segment_size()) {
        let mut ctx = checkout_context(inner, conn, pool)
            .await
            .ok_or(ProtocolError::ConnectionClosed)?;

        ctx.load(&chunk);
        let n = ctx.transmit_to(writer).await?;
        if let Err(e) = ctx.release() {
            error!(kind = %OperationKind::Send, error = %e, "Send context release failed");
        }

        conn.touch();
        inner.metrics.bytes_written(n as u64);
    }

    inner.metrics.frame_sent();
    Ok(())
}
