//! INFO / CONNECT handshake

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Connection, ConnectionError, ConnectionState};
use crate::broker::BrokerEvent;
use crate::protocol::{Connect, Frame, Info, ProtocolError, PROTOCOL_VERSION};
use crate::topic::Privilege;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send INFO and wait for a CONNECT within the connect timeout
    pub(crate) async fn handshake(&mut self) -> Result<(), ConnectionError> {
        let info = Info {
            version: PROTOCOL_VERSION,
            max_payload: self.config.max_payload,
            server_id: Bytes::from(self.config.server_id.clone()),
            server_name: Bytes::from(self.config.server_name.clone()),
            auth_required: self.config.auth_required,
            headers_supported: true,
        };
        self.send(&Frame::Info(info)).await?;
        self.state = ConnectionState::AwaitingConnect;

        match tokio::time::timeout(self.config.connect_timeout, self.read_connect()).await {
            Ok(result) => result,
            Err(_) => {
                debug!(connection = %self.id, peer = ?self.peer, "CONNECT timeout");
                self.state = ConnectionState::Closing;
                Err(ConnectionError::Timeout)
            }
        }
    }

    /// Read until a CONNECT arrives. PING is answered; anything else is a
    /// protocol violation.
    async fn read_connect(&mut self) -> Result<(), ConnectionError> {
        loop {
            loop {
                let frame = match self.decoder.decode(&mut self.read_buf) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => return Err(self.reject(e.into()).await),
                };

                match frame {
                    Frame::Connect(connect) => return self.handle_connect(connect).await,
                    Frame::Ping => self.send(&Frame::Pong).await?,
                    Frame::Pong => {}
                    other => {
                        debug!(
                            connection = %self.id,
                            command = %other.command(),
                            "First frame was not CONNECT"
                        );
                        let error = ProtocolError::UnexpectedCommand(other.command());
                        return Err(self.reject(error).await);
                    }
                }
            }

            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                self.state = ConnectionState::Closing;
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before CONNECT",
                )));
            }
        }
    }

    async fn handle_connect(&mut self, connect: Connect) -> Result<(), ConnectionError> {
        if connect.version != PROTOCOL_VERSION {
            let error = ProtocolError::UnsupportedVersion(connect.version);
            return Err(self.reject(error).await);
        }

        if self.config.auth_required && connect.auth.is_none() {
            debug!(connection = %self.id, "CONNECT without credentials");
            return Err(self.reject(ProtocolError::AuthRequired).await);
        }

        match self
            .hooks
            .on_authenticate(self.id, connect.auth.as_ref())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(connection = %self.id, "Authentication rejected");
                return Err(self.reject(ProtocolError::AuthFailed).await);
            }
            Err(e) => {
                warn!(connection = %self.id, "Authentication hook failed: {}", e);
                return Err(self.reject(ProtocolError::AuthFailed).await);
            }
        }

        self.verbose = connect.verbose;
        self.username = connect
            .auth
            .as_ref()
            .and_then(|auth| auth.username())
            .map(|name| String::from_utf8_lossy(name).into_owned());
        self.privilege = if self
            .hooks
            .is_privileged(self.id, self.username.as_deref())
            .await
        {
            Privilege::System
        } else {
            Privilege::Standard
        };

        let (tx, rx) = mpsc::channel(self.config.outbound_channel_capacity.max(1));
        self.router.register(self.id, tx).await?;
        self.registered = true;
        self.outbox = Some(rx);
        self.state = ConnectionState::Ready;

        self.hooks
            .on_client_connected(self.id, self.username.as_deref())
            .await;
        let _ = self.events.send(BrokerEvent::ClientConnected {
            connection: self.id,
            username: self.username.clone(),
        });

        info!(
            connection = %self.id,
            peer = ?self.peer,
            username = ?self.username,
            verbose = self.verbose,
            privileged = self.privilege == Privilege::System,
            "Client connected"
        );
        Ok(())
    }
}
