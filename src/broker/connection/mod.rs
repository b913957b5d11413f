//! Connection Handler
//!
//! Drives one client through the handshake and the ready loop:
//! `Connecting -> AwaitingConnect -> Ready -> Closing -> Closed`.
//!
//! A connection is generic over the stream so tests can drive it through
//! in-memory duplex pipes. Inbound frames are handled strictly in arrival
//! order; MSG frames for this client arrive from the router on a bounded
//! channel and are written in batches.

mod connect;
mod publish;
mod subscribe;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::router::RouterHandle;
use super::{BrokerConfig, BrokerEvent};
use crate::codec::{Decoder, Encoder};
use crate::hooks::Hooks;
use crate::protocol::{EncodeError, Frame, Msg, ProtocolError};
use crate::topic::{ConnectionId, Privilege, TopicError};

/// Initial capacity of the read and write buffers
const BUFFER_CAPACITY: usize = 8 * 1024;

/// Stop batching queued MSG frames once this much is waiting to be written
const WRITE_BATCH_BYTES: usize = 64 * 1024;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    Encode(EncodeError),
    /// No CONNECT within the handshake timeout
    Timeout,
    Shutdown,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Encode(e) => write!(f, "Encode error: {}", e),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

impl From<TopicError> for ConnectionError {
    fn from(e: TopicError) -> Self {
        ConnectionError::Protocol(e.into())
    }
}

impl From<EncodeError> for ConnectionError {
    fn from(e: EncodeError) -> Self {
        ConnectionError::Encode(e)
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, INFO not yet sent
    Connecting,
    /// INFO sent, waiting for CONNECT
    AwaitingConnect,
    /// Handshake complete
    Ready,
    /// Shutting down after an error, timeout or peer close
    Closing,
    /// Torn down; subscriptions removed
    Closed,
}

/// Connection handler - generic over the stream type
pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) id: ConnectionId,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) state: ConnectionState,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    pub(crate) config: Arc<BrokerConfig>,
    pub(crate) router: RouterHandle,
    pub(crate) hooks: Arc<dyn Hooks>,
    pub(crate) events: broadcast::Sender<BrokerEvent>,
    /// Client asked for OK acknowledgements
    pub(crate) verbose: bool,
    /// Username from CONNECT (for ACL checks)
    pub(crate) username: Option<String>,
    pub(crate) privilege: Privilege,
    /// Outbox registered with the router
    pub(crate) registered: bool,
    pub(crate) outbox: Option<mpsc::Receiver<Msg>>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        id: ConnectionId,
        peer: Option<SocketAddr>,
        config: Arc<BrokerConfig>,
        router: RouterHandle,
        hooks: Arc<dyn Hooks>,
        events: broadcast::Sender<BrokerEvent>,
    ) -> Self {
        Self {
            stream,
            id,
            peer,
            state: ConnectionState::Connecting,
            decoder: Decoder::server().with_max_payload(config.max_payload),
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(BUFFER_CAPACITY),
            write_buf: BytesMut::with_capacity(BUFFER_CAPACITY),
            config,
            router,
            hooks,
            events,
            verbose: false,
            username: None,
            privilege: Privilege::Standard,
            registered: false,
            outbox: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Run the handshake and then the ready loop.
    ///
    /// Returns `Ok(())` when the peer closes the stream. The caller must
    /// call [`Connection::teardown`] afterwards, whatever the outcome.
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        self.handshake().await?;
        self.run_ready().await
    }

    async fn run_ready(&mut self) -> Result<(), ConnectionError> {
        let Some(mut outbox) = self.outbox.take() else {
            return Err(ProtocolError::Internal("connection not registered").into());
        };

        let keep_alive = self.config.keep_alive;
        let ping_interval = self.config.ping_interval;
        let mut ping_ticker = interval_at(Instant::now() + ping_interval, ping_interval);
        ping_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Set while a server PING is unanswered
        let mut pong_deadline: Option<Instant> = None;

        // Frames that arrived in the same read as CONNECT
        self.process_buffered(&mut pong_deadline).await?;

        loop {
            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    if result? == 0 {
                        debug!(connection = %self.id, "Connection closed by peer");
                        self.state = ConnectionState::Closing;
                        return Ok(());
                    }
                    self.process_buffered(&mut pong_deadline).await?;
                }

                msg = outbox.recv() => {
                    let Some(msg) = msg else {
                        // The router dropped our outbox: it has stopped
                        self.state = ConnectionState::Closing;
                        return Err(ConnectionError::Shutdown);
                    };
                    self.write_buf.clear();
                    self.encoder.encode(&Frame::Msg(msg), &mut self.write_buf)?;
                    while self.write_buf.len() < WRITE_BATCH_BYTES {
                        match outbox.try_recv() {
                            Ok(msg) => self.encoder.encode(&Frame::Msg(msg), &mut self.write_buf)?,
                            Err(_) => break,
                        }
                    }
                    self.stream.write_all(&self.write_buf).await?;
                }

                _ = ping_ticker.tick() => {
                    if pong_deadline.is_none() {
                        self.send(&Frame::Ping).await?;
                        pong_deadline = Some(Instant::now() + keep_alive);
                    }
                }

                _ = sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                    info!(connection = %self.id, "Keep alive timeout - disconnecting");
                    self.state = ConnectionState::Closing;
                    return Err(ProtocolError::KeepAliveTimeout.into());
                }
            }
        }
    }

    /// Decode and handle every complete frame in the read buffer
    async fn process_buffered(
        &mut self,
        pong_deadline: &mut Option<Instant>,
    ) -> Result<(), ConnectionError> {
        loop {
            let frame = match self.decoder.decode(&mut self.read_buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => return Err(self.reject(e.into()).await),
            };
            // Any inbound frame proves the peer is alive
            *pong_deadline = None;
            self.handle_frame(frame).await?;
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        debug!(connection = %self.id, command = %frame.command(), "frame received");
        let result = match frame {
            Frame::Pub(publish) => self.handle_publish(publish).await,
            Frame::Sub(subscribe) => self.handle_subscribe(subscribe).await,
            Frame::Unsub(unsubscribe) => self.handle_unsubscribe(unsubscribe).await,
            Frame::Ping => self.send(&Frame::Pong).await,
            Frame::Pong => Ok(()),
            other => Err(ProtocolError::UnexpectedCommand(other.command()).into()),
        };

        match result {
            Err(ConnectionError::Protocol(e)) => self.report(e).await,
            other => other,
        }
    }

    /// Encode and write a single frame
    pub(crate) async fn send(&mut self, frame: &Frame) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder.encode(frame, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }

    /// OK acknowledgement for verbose clients
    pub(crate) async fn ack(&mut self) -> Result<(), ConnectionError> {
        if self.verbose {
            self.send(&Frame::Ok).await?;
        }
        Ok(())
    }

    /// Report an error to the peer. Recoverable errors leave the connection
    /// Ready; fatal ones move it to Closing and are returned.
    pub(crate) async fn report(&mut self, error: ProtocolError) -> Result<(), ConnectionError> {
        if error.is_fatal() {
            return Err(self.reject(error).await);
        }
        warn!(connection = %self.id, "{}", error);
        if let Some(frame) = error.to_frame() {
            self.send(&Frame::Err(frame)).await?;
        }
        Ok(())
    }

    /// Send ERR for a fatal error and move to Closing
    pub(crate) async fn reject(&mut self, error: ProtocolError) -> ConnectionError {
        debug!(connection = %self.id, "Closing after fatal error: {}", error);
        self.state = ConnectionState::Closing;
        if let Some(frame) = error.to_frame() {
            if let Err(e) = self.send(&Frame::Err(frame)).await {
                return e;
            }
            let _ = self.stream.flush().await;
        }
        ConnectionError::Protocol(error)
    }

    /// Remove everything this connection owns. Safe to call more than once
    /// and at any point of the lifecycle.
    pub async fn teardown(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;

        if self.registered {
            self.registered = false;
            match self.router.disconnect(self.id).await {
                Ok(removed) => {
                    debug!(connection = %self.id, subscriptions = removed, "subscriptions removed")
                }
                Err(e) => debug!(connection = %self.id, "router unavailable during teardown: {}", e),
            }
            self.hooks.on_client_disconnected(self.id).await;
            let _ = self
                .events
                .send(BrokerEvent::ClientDisconnected { connection: self.id });
        }

        let _ = self.stream.shutdown().await;
        self.state = ConnectionState::Closed;
        info!(
            connection = %self.id,
            peer = ?self.peer,
            "Client disconnected"
        );
    }
}

#[cfg(test)]
mod tests;
