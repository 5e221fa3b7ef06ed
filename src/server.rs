//! TCP listener for forward protocol connections.
//!
//! Accepts connections one at a time, spawns a handler per connection and
//! keeps a registry of live handlers for shutdown and metrics.

use crate::config::Config;
use crate::error::ServerError;
use crate::metrics::{MetricTopic, Scoreboard};
use crate::protocols::forward::Handler;
use crate::sink::Sink;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// What the caller should do after one call to [`ProtocolServer::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A connection was accepted; call `run` again.
    Continue,
    /// The server has been shut down.
    Stopped,
}

/// A protocol server driven by its host.
pub trait ProtocolServer {
    /// Address the listener is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Accept a single connection and start its handler.
    fn run(&self) -> impl Future<Output = Result<Step, ServerError>> + Send;

    /// Close every registered connection, then the listener.
    fn shutdown(&self) -> Result<(), ServerError>;

    /// Total entries decoded so far, as text.
    fn entry_count(&self) -> String;

    /// Live connections, as text.
    fn connection_count(&self) -> String;

    /// Call `run` until the server stops or accept fails.
    fn serve(&self) -> impl Future<Output = Result<(), ServerError>> + Send
    where
        Self: Sync,
    {
        async move {
            loop {
                if self.run().await? == Step::Stopped {
                    return Ok(());
                }
            }
        }
    }
}

struct RegistryEntry {
    peer: SocketAddr,
    token: CancellationToken,
}

/// Registry of live connection handlers.
///
/// All access goes through one mutex, so counts and shutdown iteration
/// never observe a half-applied registration.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<u64, RegistryEntry>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, RegistryEntry>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection. It stays registered until the returned guard drops.
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.lock().insert(
            id,
            RegistryEntry {
                peer,
                token: token.clone(),
            },
        );
        debug!(conn_id = id, %peer, "Registered connection");

        Registration {
            registry: Arc::clone(self),
            id,
            token,
        }
    }

    fn deregister(&self, id: u64) -> bool {
        match self.lock().remove(&id) {
            Some(entry) => {
                debug!(conn_id = id, peer = %entry.peer, "Deregistered connection");
                true
            }
            None => false,
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal every registered handler to close. Returns how many were signalled.
    ///
    /// Entries are removed by the handlers themselves as they exit.
    pub fn close_all(&self) -> usize {
        let connections = self.lock();
        for (id, entry) in connections.iter() {
            debug!(conn_id = id, peer = %entry.peer, "Closing connection");
            entry.token.cancel();
        }
        connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Membership of one handler in the registry; removes itself on drop.
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: u64,
    token: CancellationToken,
}

impl Registration {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancelled when the listener closes this connection.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

/// Forward protocol listener.
pub struct ForwardServer {
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    sink: Arc<dyn Sink>,
    entries: Arc<AtomicU64>,
    registry: Arc<ConnectionRegistry>,
    connection_limit: Arc<Semaphore>,
    max_frame_size: usize,
    stopped: CancellationToken,
}

impl ForwardServer {
    /// Bind the configured address. Must be called within a Tokio runtime.
    pub fn bind(config: &Config, sink: Arc<dyn Sink>) -> Result<Self, ServerError> {
        let addr = resolve(&config.bind_address())?;
        let listener = TcpListener::from_std(create_listener(addr)?)?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Server listening");

        Ok(Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            sink,
            entries: Arc::new(AtomicU64::new(0)),
            registry: Arc::new(ConnectionRegistry::new()),
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            max_frame_size: config.max_frame_size,
            stopped: CancellationToken::new(),
        })
    }

    /// Total entries decoded across all connections.
    pub fn total_entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    /// Number of registered connections.
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    /// Register the `entries` and `connections` topics.
    pub fn register_metrics(&self, board: &mut Scoreboard) {
        let entries = Arc::clone(&self.entries);
        board.add_topic(MetricTopic::new(
            "entries",
            "Total number of entries",
            "Total number of entries received so far",
            move || entries.load(Ordering::Relaxed).to_string(),
        ));

        let registry = Arc::clone(&self.registry);
        board.add_topic(MetricTopic::new(
            "connections",
            "Connections",
            "Number of connections currently handled",
            move || registry.len().to_string(),
        ));
    }

    fn current_listener(&self) -> Option<Arc<TcpListener>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ProtocolServer for ForwardServer {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn run(&self) -> Result<Step, ServerError> {
        let Some(listener) = self.current_listener() else {
            return Ok(Step::Stopped);
        };

        // Wait for a connection slot
        let permit = tokio::select! {
            permit = Arc::clone(&self.connection_limit).acquire_owned() => {
                permit.map_err(|_| ServerError::AlreadyClosed)?
            }
            _ = self.stopped.cancelled() => return Ok(Step::Stopped),
        };

        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = self.stopped.cancelled() => return Ok(Step::Stopped),
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                return Err(e.into());
            }
        };
        debug!(%peer, "New connection");
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let registration = self.registry.register(peer);
        if self.stopped.is_cancelled() {
            // Raced with shutdown after close_all ran
            debug!(%peer, "Dropping connection accepted during shutdown");
            return Ok(Step::Stopped);
        }
        let handler = Handler::new(
            stream,
            peer,
            registration,
            Arc::clone(&self.sink),
            Arc::clone(&self.entries),
            self.max_frame_size,
        );
        tokio::spawn(async move {
            handler.run().await;
            drop(permit);
        });

        Ok(Step::Continue)
    }

    fn shutdown(&self) -> Result<(), ServerError> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(listener) = listener else {
            return Err(ServerError::AlreadyClosed);
        };

        // Stop accepting first so no handler registers after close_all
        self.stopped.cancel();
        let closed = self.registry.close_all();
        info!(connections = closed, "Closing connections");

        drop(listener);
        info!(address = %self.local_addr, "Listener closed");
        Ok(())
    }

    fn entry_count(&self) -> String {
        self.total_entries().to_string()
    }

    fn connection_count(&self) -> String {
        self.active_connections().to_string()
    }
}

/// Resolve `host:port`, accepting host names as well as literal addresses.
fn resolve(address: &str) -> Result<SocketAddr, ServerError> {
    if let Ok(addr) = address.parse() {
        return Ok(addr);
    }
    address
        .to_socket_addrs()
        .map_err(|_| ServerError::InvalidAddress(address.to_string()))?
        .next()
        .ok_or_else(|| ServerError::InvalidAddress(address.to_string()))
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}
