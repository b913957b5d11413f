//! Broker Core
//!
//! Accepts client connections, runs one task per connection and owns the
//! router task that all of them publish through.

mod connection;
mod dispatch;
mod router;

pub use connection::{Connection, ConnectionError, ConnectionState};
pub use dispatch::{Delivery, Dispatcher};
pub use router::{Router, RouterHandle};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::hooks::{DefaultHooks, Hooks};
use crate::protocol::DEFAULT_MAX_PAYLOAD;
use crate::topic::ConnectionId;

/// Default TCP port
pub const DEFAULT_PORT: u16 = 7400;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Largest PUB payload accepted, advertised in INFO
    pub max_payload: u32,
    /// How long to wait for any frame after a server PING
    pub keep_alive: Duration,
    /// Interval between server PINGs
    pub ping_interval: Duration,
    /// How long a new connection may take to send CONNECT
    pub connect_timeout: Duration,
    pub server_id: String,
    pub server_name: String,
    /// Reject CONNECT frames without credentials
    pub auth_required: bool,
    /// Per-connection MSG queue length; deliveries beyond it are dropped
    pub outbound_channel_capacity: usize,
    /// Router command queue length
    pub router_channel_capacity: usize,
    /// Number of runtime worker threads
    pub num_workers: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: 100_000,
            max_payload: DEFAULT_MAX_PAYLOAD,
            keep_alive: Duration::from_secs(30),
            ping_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            server_id: "ocypode".to_string(),
            server_name: "ocypode".to_string(),
            auth_required: false,
            outbound_channel_capacity: 1024,
            router_channel_capacity: 4096,
            num_workers: num_cpus::get(),
        }
    }
}

// Helper to get number of CPUs
mod num_cpus {
    pub fn get() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

/// Broker events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Handshake completed
    ClientConnected {
        connection: ConnectionId,
        username: Option<String>,
    },
    /// A connection that completed the handshake was torn down
    ClientDisconnected { connection: ConnectionId },
    SubscriptionAdded {
        connection: ConnectionId,
        subscription_id: String,
        pattern: String,
    },
    /// Removed by UNSUB or by teardown
    SubscriptionRemoved {
        connection: ConnectionId,
        subscription_id: String,
        pattern: String,
    },
}

/// The Broker
///
/// Must be created inside a tokio runtime: construction spawns the router.
pub struct Broker {
    config: Arc<BrokerConfig>,
    router: RouterHandle,
    /// Shutdown signal
    shutdown: broadcast::Sender<()>,
    /// Event channel
    events: broadcast::Sender<BrokerEvent>,
    /// Hooks for auth/ACL and events
    hooks: Arc<dyn Hooks>,
    next_connection_id: AtomicU64,
    active_connections: Arc<AtomicUsize>,
}

impl Broker {
    /// Create a new broker with default hooks (allows everything)
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a new broker with custom hooks
    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (events, _) = broadcast::channel(1024);

        let (router, handle) = Router::new(config.router_channel_capacity, events.clone());
        tokio::spawn(router.run(shutdown.subscribe()));

        Self {
            config: Arc::new(config),
            router: handle,
            shutdown,
            events,
            hooks,
            next_connection_id: AtomicU64::new(1),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Bind the configured address and accept connections until shutdown
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve_listener(listener).await
    }

    /// Accept connections from an already bound listener until shutdown
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        info!("Ocypode/TCP listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Accept loop stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                        }
                        self.serve(stream, Some(addr));
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                    }
                },
            }
        }
    }

    /// Run the protocol over any byte stream on its own task.
    ///
    /// Returns the id assigned to the connection, or `None` when the
    /// connection limit is reached and the stream was dropped.
    pub fn serve<S>(&self, stream: S, peer: Option<SocketAddr>) -> Option<ConnectionId>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let active = self.active_connections.fetch_add(1, Ordering::AcqRel);
        if active >= self.config.max_connections {
            self.active_connections.fetch_sub(1, Ordering::AcqRel);
            warn!(peer = ?peer, "Connection limit reached, dropping connection");
            return None;
        }

        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let mut conn = Connection::new(
            stream,
            id,
            peer,
            self.config.clone(),
            self.router.clone(),
            self.hooks.clone(),
            self.events.clone(),
        );
        let mut shutdown_rx = self.shutdown.subscribe();
        let active_connections = self.active_connections.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    debug!(connection = %id, "Connection shutting down");
                    Err(ConnectionError::Shutdown)
                }
                result = conn.run() => result,
            };

            match result {
                Ok(()) => {}
                Err(ConnectionError::Shutdown) => {}
                Err(e) => debug!(connection = %id, "Connection closed: {}", e),
            }

            conn.teardown().await;
            active_connections.fetch_sub(1, Ordering::AcqRel);
        });

        Some(id)
    }

    /// Shutdown the broker
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Subscribe to broker events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }
}
