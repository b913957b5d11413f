//! Hooks Module
//!
//! Extension points for authentication, authorization and connection
//! lifecycle events. The broker only enforces the decisions made here.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::Auth;
use crate::topic::ConnectionId;


/// A hook could not reach a decision. The broker treats this as a denial.
#[derive(Debug)]
pub enum HookError {
    Internal(String),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Broker hooks trait
///
/// All methods have default implementations that allow everything and grant
/// no privilege.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Called with the credentials carried by CONNECT
    ///
    /// # Returns
    /// * `Ok(true)` - Authentication successful
    /// * `Ok(false)` - Authentication failed (ERR AuthFailed, connection closed)
    /// * `Err(_)` - Internal error occurred, treated as a failure
    async fn on_authenticate(
        &self,
        _connection: ConnectionId,
        _auth: Option<&Auth>,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Whether the connection may publish and subscribe under `$SYS`
    async fn is_privileged(&self, _connection: ConnectionId, _username: Option<&str>) -> bool {
        false
    }

    /// Called before a PUB is routed
    async fn on_publish_check(
        &self,
        _connection: ConnectionId,
        _username: Option<&str>,
        _topic: &[u8],
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Called before a SUB is registered
    async fn on_subscribe_check(
        &self,
        _connection: ConnectionId,
        _username: Option<&str>,
        _pattern: &[u8],
        _queue_group: Option<&[u8]>,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Called once the connection reached Ready
    async fn on_client_connected(&self, _connection: ConnectionId, _username: Option<&str>) {}

    /// Called during teardown of a connection that completed the handshake
    async fn on_client_disconnected(&self, _connection: ConnectionId) {}
}

/// Default hooks implementation that allows everything
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {}

/// Arc-wrapped providers can be used directly
#[async_trait]
impl<T: Hooks + ?Sized> Hooks for Arc<T> {
    async fn on_authenticate(
        &self,
        connection: ConnectionId,
        auth: Option<&Auth>,
    ) -> HookResult<bool> {
        (**self).on_authenticate(connection, auth).await
    }

    async fn is_privileged(&self, connection: ConnectionId, username: Option<&str>) -> bool {
        (**self).is_privileged(connection, username).await
    }

    async fn on_publish_check(
        &self,
        connection: ConnectionId,
        username: Option<&str>,
        topic: &[u8],
    ) -> HookResult<bool> {
        (**self).on_publish_check(connection, username, topic).await
    }

    async fn on_subscribe_check(
        &self,
        connection: ConnectionId,
        username: Option<&str>,
        pattern: &[u8],
        queue_group: Option<&[u8]>,
    ) -> HookResult<bool> {
        (**self)
            .on_subscribe_check(connection, username, pattern, queue_group)
            .await
    }

    async fn on_client_connected(&self, connection: ConnectionId, username: Option<&str>) {
        (**self).on_client_connected(connection, username).await;
    }

    async fn on_client_disconnected(&self, connection: ConnectionId) {
        (**self).on_client_disconnected(connection).await;
    }
}

/// Composite hooks that chains multiple hook implementations
///
/// For authentication and authorization every provider must return
/// `Ok(true)`. A connection is privileged if any provider says so. Events
/// are delivered to every provider in order.
#[derive(Default)]
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    /// Add a hooks implementation and return self for chaining
    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn on_authenticate(
        &self,
        connection: ConnectionId,
        auth: Option<&Auth>,
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.on_authenticate(connection, auth).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn is_privileged(&self, connection: ConnectionId, username: Option<&str>) -> bool {
        for hooks in &self.hooks {
            if hooks.is_privileged(connection, username).await {
                return true;
            }
        }
        false
    }

    async fn on_publish_check(
        &self,
        connection: ConnectionId,
        username: Option<&str>,
        topic: &[u8],
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.on_publish_check(connection, username, topic).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_subscribe_check(
        &self,
        connection: ConnectionId,
        username: Option<&str>,
        pattern: &[u8],
        queue_group: Option<&[u8]>,
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks
                .on_subscribe_check(connection, username, pattern, queue_group)
                .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_client_connected(&self, connection: ConnectionId, username: Option<&str>) {
        for hooks in &self.hooks {
            hooks.on_client_connected(connection, username).await;
        }
    }

    async fn on_client_disconnected(&self, connection: ConnectionId) {
        for hooks in &self.hooks {
            hooks.on_client_disconnected(connection).await;
        }
    }
}
