//! tagwire Server
//!
//! The server owns the listening socket and the registry of live
//! connections, and connects them to the application through four channels.

use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::connection::{Connection, ConnectionError, ConnectionResult, ConnectionStats, Outlets};
use super::transport::Listener;
use super::{NetworkConfig, TransportKind};
use crate::protocol::{Address, ByteMessage, Codec, CodecError, Encoder, Message, BUFFER_SIZE, CHANNEL_CAPACITY};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Server already started")]
    AlreadyStarted,

    #[error("Server has been shut down")]
    ShutDown,
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Delay before retrying after a socket error in the accept loop
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Lifecycle of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Bound, not accepting yet
    Unstarted,
    /// Accept and dispatch loops running
    Running,
    /// Terminal
    ShutDown,
}

/// The application's ends of the server channels
#[derive(Debug)]
pub struct Channels<P> {
    /// Remote endpoints of newly accepted connections
    pub new_connections: mpsc::Receiver<SocketAddr>,
    /// Remote endpoints of closed connections
    pub closed_connections: mpsc::Receiver<SocketAddr>,
    /// Decoded messages from all connections
    pub inbound: mpsc::Receiver<Message<P>>,
    /// Messages to send; [`Address::Broadcast`] reaches every connection
    pub outbound: mpsc::Sender<Message<P>>,
}

type ConnectionMap<C> = HashMap<SocketAddr, Arc<Connection<C>>>;

/// State shared with the accept, dispatch and read tasks
struct Shared<C: Codec> {
    codec: Arc<C>,
    encoder: Encoder<C>,
    connections: RwLock<ConnectionMap<C>>,
    shutdown_tx: watch::Sender<bool>,
}

/// tagwire Server
pub struct Server<C: Codec> {
    shared: Arc<Shared<C>>,
    /// Bound address
    local_addr: SocketAddr,
    transport: TransportKind,
    /// Listening socket until the accept loop takes it
    listener: Mutex<Option<Listener>>,
    state: RwLock<ServerState>,
    /// Accept and dispatch loops
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Codec> Server<C> {
    /// Bind the listening socket. No connections are accepted until [`Server::start`].
    pub async fn bind(config: &NetworkConfig, codec: C) -> ServerResult<Self> {
        let bind_addr = config.bind_addr();
        let listener = Listener::bind(config.transport, bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: bind_addr,
                source,
            })?;

        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, transport = %config.transport, "Server listening");

        let codec = Arc::new(codec);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(Shared {
                encoder: Encoder::new(codec.clone()),
                codec,
                connections: RwLock::new(HashMap::new()),
                shutdown_tx,
            }),
            local_addr,
            transport: config.transport,
            listener: Mutex::new(Some(listener)),
            state: RwLock::new(ServerState::Unstarted),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Start accepting connections and dispatching outbound messages.
    ///
    /// Creates the four channels and returns the application's ends. The
    /// accept loop and the dispatch loop each run on their own task.
    pub async fn start(&self) -> ServerResult<Channels<C::Payload>> {
        let mut state = self.state.write().await;
        match *state {
            ServerState::Unstarted => {}
            ServerState::Running => return Err(ServerError::AlreadyStarted),
            ServerState::ShutDown => return Err(ServerError::ShutDown),
        }

        let listener = self.listener.lock().await.take().ok_or(ServerError::ShutDown)?;

        let (new_tx, new_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (closed_tx, closed_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let outlets = Outlets {
            inbound: inbound_tx,
            closed: closed_tx,
        };

        let accept = tokio::spawn(accept_loop(self.shared.clone(), listener, new_tx, outlets));
        let dispatch = tokio::spawn(dispatch_loop(self.shared.clone(), outbound_rx));
        self.tasks.lock().await.extend([accept, dispatch]);

        *state = ServerState::Running;
        tracing::info!(addr = %self.local_addr, "Server started");

        Ok(Channels {
            new_connections: new_rx,
            closed_connections: closed_rx,
            inbound: inbound_rx,
            outbound: outbound_tx,
        })
    }

    /// Send a message to one connection, reporting encoding errors.
    ///
    /// A message for an address with no connection is dropped.
    pub async fn send_to(&self, addr: SocketAddr, tag: u32, payload: &C::Payload) -> ServerResult<()> {
        self.shared.send_to(addr, tag, payload).await
    }

    /// Send a message to every connection. Returns how many were written.
    pub async fn broadcast(&self, tag: u32, payload: &C::Payload) -> ServerResult<usize> {
        self.shared.broadcast(tag, payload).await
    }

    /// Remote endpoints of all registered connections
    pub async fn connections(&self) -> Vec<SocketAddr> {
        self.shared.connections.read().await.keys().copied().collect()
    }

    pub async fn is_connected(&self, addr: SocketAddr) -> bool {
        self.shared.connections.read().await.contains_key(&addr)
    }

    pub async fn connection_count(&self) -> usize {
        self.shared.connections.read().await.len()
    }

    pub async fn connection_stats(&self, addr: SocketAddr) -> Option<ConnectionStats> {
        let connections = self.shared.connections.read().await;
        connections.get(&addr).map(|conn| conn.stats())
    }

    /// Close the connection to `addr`, if there is one
    pub async fn close_connection(&self, addr: SocketAddr) -> ServerResult<()> {
        let removed = self.shared.connections.write().await.remove(&addr);
        if let Some(conn) = removed {
            conn.close().await?;
        }
        Ok(())
    }

    /// Shut the server down.
    ///
    /// Stops the accept and dispatch loops, releases the listening socket and
    /// closes every connection. The application's channels close once the
    /// last task holding them has finished. The server cannot be restarted.
    pub async fn shutdown(&self) -> ServerResult<()> {
        let mut state = self.state.write().await;
        if *state == ServerState::ShutDown {
            return Err(ServerError::ShutDown);
        }
        *state = ServerState::ShutDown;

        self.shared.shutdown_tx.send_replace(true);
        drop(self.listener.lock().await.take());

        // Closing first releases a dispatch loop stuck writing to a peer
        self.shared.close_all().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Server task failed");
            }
        }

        // Connections admitted while the accept loop was winding down
        self.shared.close_all().await;

        tracing::info!(addr = %self.local_addr, "Server shut down");
        Ok(())
    }
}

impl<C: Codec> Shared<C> {
    async fn lookup(&self, addr: SocketAddr) -> Option<Arc<Connection<C>>> {
        self.connections.read().await.get(&addr).cloned()
    }

    async fn send_to(&self, addr: SocketAddr, tag: u32, payload: &C::Payload) -> ServerResult<()> {
        let frame = self.encoder.encode(tag, payload)?;

        let Some(conn) = self.lookup(addr).await else {
            tracing::debug!(%addr, tag, "No connection for outbound message");
            return Ok(());
        };

        self.write(&conn, &frame).await
    }

    async fn broadcast(&self, tag: u32, payload: &C::Payload) -> ServerResult<usize> {
        let frame = self.encoder.encode(tag, payload)?;

        let targets: Vec<Arc<Connection<C>>> = self.connections.read().await.values().cloned().collect();
        let mut written = 0;
        for conn in &targets {
            if self.write(conn, &frame).await.is_ok() {
                written += 1;
            }
        }
        tracing::trace!(tag, written, "Broadcast sent");
        Ok(written)
    }

    /// Write a frame; a failed write closes the connection
    async fn write(&self, conn: &Arc<Connection<C>>, frame: &Bytes) -> ServerResult<()> {
        if let Err(e) = conn.send_frame(frame).await {
            tracing::warn!(addr = %conn.remote_addr(), error = %e, "Write failed, closing connection");
            if let Err(close_err) = self.release(conn).await {
                tracing::debug!(addr = %conn.remote_addr(), error = %close_err, "Error closing connection");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Unregister and close every connection
    async fn close_all(&self) {
        let connections: Vec<Arc<Connection<C>>> =
            self.connections.write().await.drain().map(|(_, conn)| conn).collect();
        for conn in connections {
            if let Err(e) = conn.abort().await {
                tracing::debug!(addr = %conn.remote_addr(), error = %e, "Error closing connection");
            }
        }
    }

    /// Unregister `conn` (unless already replaced) and close it
    async fn release(&self, conn: &Arc<Connection<C>>) -> ConnectionResult<()> {
        let addr = conn.remote_addr();
        {
            let mut connections = self.connections.write().await;
            if connections.get(&addr).is_some_and(|c| Arc::ptr_eq(c, conn)) {
                connections.remove(&addr);
            }
        }
        conn.close().await
    }

    /// Register a new connection, announce it and start its read loop.
    ///
    /// Returns `false` if shutdown started while announcing.
    async fn admit(
        self: &Arc<Self>,
        conn: Arc<Connection<C>>,
        new_tx: &mpsc::Sender<SocketAddr>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        let addr = conn.remote_addr();
        let replaced = self.connections.write().await.insert(addr, conn.clone());
        if let Some(old) = replaced {
            if let Err(e) = old.abort().await {
                tracing::debug!(%addr, error = %e, "Error closing replaced connection");
            }
        }

        tokio::select! {
            _ = shutdown_rx.changed() => return false,
            result = new_tx.send(addr) => {
                if result.is_err() {
                    tracing::debug!(%addr, "New-connection channel closed");
                }
            }
        }

        let shared = self.clone();
        tokio::spawn(async move {
            conn.read_loop().await;
            if let Err(e) = shared.release(&conn).await {
                tracing::debug!(addr = %conn.remote_addr(), error = %e, "Error closing connection");
            }
        });
        true
    }
}

async fn accept_loop<C: Codec>(
    shared: Arc<Shared<C>>,
    listener: Listener,
    new_tx: mpsc::Sender<SocketAddr>,
    outlets: Outlets<C::Payload>,
) {
    let shutdown_rx = shared.shutdown_tx.subscribe();
    match listener {
        Listener::Stream(listener) => accept_streams(shared, listener, new_tx, outlets, shutdown_rx).await,
        Listener::Datagram(socket) => receive_datagrams(shared, socket, new_tx, outlets, shutdown_rx).await,
    }
    tracing::info!("Accept loop stopped");
}

async fn accept_streams<C: Codec>(
    shared: Arc<Shared<C>>,
    listener: TcpListener,
    new_tx: mpsc::Sender<SocketAddr>,
    outlets: Outlets<C::Payload>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let result = tokio::select! {
            _ = shutdown_rx.changed() => break,
            result = listener.accept() => result,
        };
        let (stream, addr) = match result {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!("Accept error: {}", e);
                if back_off(&mut shutdown_rx).await {
                    continue;
                }
                break;
            }
        };

        tracing::info!(%addr, "New connection");
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let conn = Arc::new(Connection::stream(stream, addr, shared.codec.clone(), outlets.clone()));
        if !shared.admit(conn, &new_tx, &mut shutdown_rx).await {
            break;
        }
    }
}

/// Demultiplex the shared datagram socket into one connection per peer
async fn receive_datagrams<C: Codec>(
    shared: Arc<Shared<C>>,
    socket: Arc<UdpSocket>,
    new_tx: mpsc::Sender<SocketAddr>,
    outlets: Outlets<C::Payload>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let result = tokio::select! {
            _ = shutdown_rx.changed() => break,
            result = socket.recv_from(&mut buf) => result,
        };
        let (n, peer) = match result {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!(error = %e, "Datagram receive error");
                if back_off(&mut shutdown_rx).await {
                    continue;
                }
                break;
            }
        };
        let record = ByteMessage::new(peer, Bytes::copy_from_slice(&buf[..n]));

        let conn = match shared.lookup(peer).await {
            Some(conn) => conn,
            None => {
                tracing::info!(addr = %peer, "New datagram peer");
                let conn = Arc::new(Connection::datagram(socket.clone(), peer, shared.codec.clone(), outlets.clone()));
                if !shared.admit(conn.clone(), &new_tx, &mut shutdown_rx).await {
                    break;
                }
                conn
            }
        };

        tokio::select! {
            _ = shutdown_rx.changed() => break,
            delivered = conn.deliver(record) => {
                if !delivered {
                    tracing::trace!(addr = %peer, "Dropped datagram for closed connection");
                }
            }
        }
    }
}

/// Pause after a failed accept or receive. Returns `false` if shutdown
/// started in the meantime.
async fn back_off(shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown_rx.changed() => false,
        _ = tokio::time::sleep(RETRY_DELAY) => true,
    }
}

async fn dispatch_loop<C: Codec>(shared: Arc<Shared<C>>, mut outbound_rx: mpsc::Receiver<Message<C::Payload>>) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let message = tokio::select! {
            _ = shutdown_rx.changed() => break,
            message = outbound_rx.recv() => match message {
                Some(message) => message,
                None => break,
            }
        };

        let (address, tag, payload) = message.into_parts();
        let result = match address {
            Address::Broadcast => shared.broadcast(tag, &payload).await.map(|_| ()),
            Address::Peer(addr) => shared.send_to(addr, tag, &payload).await,
        };
        if let Err(e) = result {
            tracing::warn!(%address, tag, error = %e, "Outbound message not delivered");
        }
    }

    outbound_rx.close();
    tracing::info!("Dispatch loop stopped");
}
