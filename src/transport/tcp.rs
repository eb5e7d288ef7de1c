//! Reference byte-stream driver: TCP client and server wiring.
//!
//! Shows how a concrete transport drives the engine. Each connection gets
//! two workers tied to the transport's lifetime:
//!
//! - a **reader** that turns LF-terminated lines into typed messages using
//!   the current state's marshaller and hands them to the transport;
//! - a **writer** that drains the transport's FIFO send queue, serialising
//!   each message through the same marshaller.
//!
//! The workers are detached tokio tasks; [`StatefulTransport::close`]
//! cancels them at their next suspension point, and either worker closes
//! the transport on its way out, so a failure on one side tears down the
//! whole connection.
//!
//! [`attach`] is generic over any split byte channel, which is also how
//! the tests drive the real worker code with in-memory duplex streams.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::StratumResult;
use crate::message::Message;

use super::state::ConnectionState;
use super::{DeliveryMode, StatefulTransport};

/// How long the writer blocks on the send queue before re-checking whether
/// the transport has closed.
const QUEUE_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a connection's marshaller is swept for ignored requests.
const IGNORED_REQUEST_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Bind a transport to the halves of a connected byte channel, enter the
/// post-connect state, and spawn the reader and writer workers.
///
/// Generic over the channel so any full-duplex byte stream can drive the
/// engine; the TCP client and server both go through here with split
/// `TcpStream` halves.
pub fn attach<R, W>(
    transport: &Arc<StatefulTransport>,
    post_connect: Arc<ConnectionState>,
    read_half: R,
    write_half: W,
) -> StratumResult<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    transport.bind(outbound_tx, DeliveryMode::Direct)?;

    // The state must be active before the first line is read, so the
    // post-connect vocabulary is what parses it.
    transport.set_state(post_connect);

    tokio::spawn(read_worker(Arc::clone(transport), read_half));
    tokio::spawn(write_worker(Arc::clone(transport), write_half, outbound_rx));
    tokio::spawn(expiry_worker(Arc::clone(transport)));

    Ok(())
}

/// Read LF-terminated lines and dispatch them until the connection ends.
async fn read_worker<R>(transport: Arc<StatefulTransport>, read_half: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    use tokio::io::AsyncBufReadExt;

    let shutdown = transport.closed_token();
    let mut reader = BufReader::new(read_half);
    let mut line = String::with_capacity(4096);

    loop {
        line.clear();

        let read = tokio::select! {
            read = reader.read_line(&mut line) => read,
            _ = shutdown.cancelled() => break,
        };

        match read {
            Ok(0) => {
                info!("connection closed by remote end");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                trace!(rx = %trimmed, "received line");

                // Snapshot the marshaller through the transport lock, so a
                // state set before this read is the one that parses it.
                let Some(state) = transport.current_state() else {
                    warn!("line received while disconnected; dropping");
                    continue;
                };

                match state.marshaller().marshal_messages(trimmed) {
                    Ok(messages) => transport.receive_messages(messages),
                    Err(err) => {
                        // Resynchronising a line stream after garbage is
                        // unsafe; drop the connection.
                        error!(error = %err, "failed to interpret incoming line; closing connection");
                        break;
                    }
                }
            }
            Err(err) => {
                error!(error = %err, "read error on connection");
                break;
            }
        }
    }

    transport.close();
    trace!("reader worker exiting");
}

/// Drain the send queue, writing one line per message, until closed.
async fn write_worker<W>(
    transport: Arc<StatefulTransport>,
    write_half: W,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let shutdown = transport.closed_token();
    let mut writer = BufWriter::new(write_half);

    loop {
        let polled = tokio::select! {
            polled = tokio::time::timeout(QUEUE_POLL_TIMEOUT, outbound.recv()) => polled,
            _ = shutdown.cancelled() => break,
        };

        match polled {
            // Bounded wait, so closure is observed even without the token.
            Err(_elapsed) => {
                if transport.is_closed() {
                    break;
                }
            }
            // The transport dropped the queue on close.
            Ok(None) => break,
            Ok(Some(message)) => {
                let Some(state) = transport.current_state() else {
                    warn!("outbound message while disconnected; dropping");
                    continue;
                };

                let line = state.marshaller().unmarshal(&message);
                trace!(tx = %line, "sending line");

                if let Err(err) = write_line(&mut writer, &line).await {
                    error!(error = %err, "write error on connection");
                    break;
                }
            }
        }
    }

    transport.close();
    trace!("writer worker exiting");
}

async fn write_line<W>(writer: &mut BufWriter<W>, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Periodically sweep the active state's marshaller for pending requests
/// that have outlived the ignored-request window.
async fn expiry_worker(transport: Arc<StatefulTransport>) {
    let shutdown = transport.closed_token();
    let mut interval = tokio::time::interval(IGNORED_REQUEST_SWEEP_INTERVAL);
    interval.tick().await; // the first tick is immediate

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Some(state) = transport.current_state() {
                    state.marshaller().expire_ignored_requests();
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

/// A TCP Stratum client.
///
/// Single-shot: a client drives one connection, and once that connection
/// closes the client cannot be used to connect again.
pub struct TcpClient {
    transport: Arc<StatefulTransport>,
}

impl TcpClient {
    /// Create a disconnected client.
    pub fn new() -> Self {
        Self {
            transport: StatefulTransport::new(),
        }
    }

    /// The client's transport, for sending and listener registration.
    pub fn transport(&self) -> &Arc<StatefulTransport> {
        &self.transport
    }

    /// Connect to `addr` and enter `post_connect`.
    pub async fn connect(
        &self,
        addr: &str,
        post_connect: Arc<ConnectionState>,
    ) -> StratumResult<()> {
        let stream = TcpStream::connect(addr).await?;
        debug!(addr, "connected");
        self.open(stream, post_connect)
    }

    /// Wrap an already-connected stream.
    pub fn open(&self, stream: TcpStream, post_connect: Arc<ConnectionState>) -> StratumResult<()> {
        let (read_half, write_half) = stream.into_split();
        attach(&self.transport, post_connect, read_half, write_half)
    }
}

impl Default for TcpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque identifier assigned to each accepted server-side connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct ConnectionEntry {
    transport: Arc<StatefulTransport>,
    last_active: tokio::time::Instant,
}

/// Server-side registry of live connections with idle eviction.
///
/// Every inbound message on a connection resets its inactivity timer (the
/// server installs listeners that call [`touch`](Self::touch)); a sweep
/// evicts connections that have sat idle longer than the configured
/// maximum, handing them back so the caller can close them.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
    next_id: AtomicU64,
    max_idle_time: Duration,
}

impl ConnectionRegistry {
    /// A registry evicting connections idle longer than `max_idle_time`.
    pub fn new(max_idle_time: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_idle_time,
        }
    }

    /// Track a connection, assigning it an identifier.
    pub fn insert(&self, transport: Arc<StatefulTransport>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.connections.lock().insert(
            id,
            ConnectionEntry {
                transport,
                last_active: tokio::time::Instant::now(),
            },
        );

        id
    }

    /// Reset the inactivity timer for a connection.
    pub fn touch(&self, id: ConnectionId) {
        if let Some(entry) = self.connections.lock().get_mut(&id) {
            entry.last_active = tokio::time::Instant::now();
        }
    }

    /// Stop tracking a connection.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<StatefulTransport>> {
        self.connections.lock().remove(&id).map(|entry| entry.transport)
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Whether the registry tracks no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Drop connections that have already closed and remove and return
    /// those that have exceeded the idle limit.
    pub fn sweep(&self) -> Vec<(ConnectionId, Arc<StatefulTransport>)> {
        let now = tokio::time::Instant::now();
        let mut evicted = Vec::new();

        self.connections.lock().retain(|id, entry| {
            if entry.transport.is_closed() {
                return false;
            }

            if now.saturating_duration_since(entry.last_active) >= self.max_idle_time {
                evicted.push((*id, Arc::clone(&entry.transport)));
                return false;
            }

            true
        });

        evicted
    }
}

/// Configuration for [`TcpServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long a connection may sit without inbound traffic before it is
    /// closed.
    pub max_idle_time: Duration,

    /// How often the registry is swept for idle connections.
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_idle_time: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Factory producing the post-connect state for each accepted connection.
pub type StateFactory = Arc<dyn Fn(&Arc<StatefulTransport>) -> Arc<ConnectionState> + Send + Sync>;

/// A TCP Stratum server.
///
/// Accepts connections, wraps each in a fresh stateful transport entered
/// through the supplied state factory, and evicts connections that sit
/// idle past the configured limit.
pub struct TcpServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
}

impl TcpServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.max_idle_time));

        Self {
            config,
            registry,
            shutdown: CancellationToken::new(),
        }
    }

    /// The registry of live connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Token that stops [`listen`](Self::listen) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections on `listener` until shut down.
    pub async fn listen(&self, listener: TcpListener, state_factory: StateFactory) -> StratumResult<()> {
        tokio::spawn(idle_worker(
            Arc::clone(&self.registry),
            self.config.sweep_interval,
            self.shutdown.clone(),
        ));

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.shutdown.cancelled() => {
                    debug!("server shutting down");
                    return Ok(());
                }
            };

            let (socket, peer) = accepted?;

            if let Err(err) = self.accept_connection(socket, &state_factory) {
                warn!(%peer, error = %err, "failed to service accepted connection");
            } else {
                debug!(%peer, "connection accepted");
            }
        }
    }

    fn accept_connection(&self, socket: TcpStream, state_factory: &StateFactory) -> StratumResult<()> {
        let transport = StatefulTransport::new();
        let id = self.registry.insert(Arc::clone(&transport));

        // Inbound traffic of either flavour marks the connection active.
        let registry = Arc::clone(&self.registry);
        transport.register_request_listener(Arc::new(move |_req| registry.touch(id)));
        let registry = Arc::clone(&self.registry);
        transport.register_response_listener(Arc::new(move |_res| registry.touch(id)));

        let post_connect = state_factory(&transport);
        let (read_half, write_half) = socket.into_split();
        attach(&transport, post_connect, read_half, write_half)
    }
}

/// Close connections the registry evicts for inactivity.
async fn idle_worker(
    registry: Arc<ConnectionRegistry>,
    sweep_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(sweep_interval);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                for (id, transport) in registry.sweep() {
                    debug!(%id, "idle connection timed out");
                    transport.close();
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
