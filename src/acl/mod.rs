//! ACL (Access Control List) Module
//!
//! Provides topic-based authorization with support for:
//! - `+` and `#` wildcards, using the same matcher rules as subscriptions
//! - Variable substitution (%c = connection id, %u = username)
//! - Role-based permissions

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::auth::AuthProvider;
use crate::config::AclConfig;
use crate::hooks::{HookResult, Hooks};
use crate::topic::{topic_matches_pattern, ConnectionId};


/// ACL provider
pub struct AclProvider {
    /// Whether ACL is enabled
    enabled: bool,
    /// Role definitions (name -> role)
    roles: HashMap<String, AclRoleEntry>,
    /// Permissions for users without a role, including anonymous ones
    default_publish: Vec<String>,
    default_subscribe: Vec<String>,
    /// Reference to auth provider for username and role lookups
    auth_provider: Arc<AuthProvider>,
}

struct AclRoleEntry {
    publish: Vec<String>,
    subscribe: Vec<String>,
}

impl AclProvider {
    /// Create a new ACL provider from configuration
    pub fn new(config: &AclConfig, auth_provider: Arc<AuthProvider>) -> Self {
        let roles = config
            .roles
            .iter()
            .map(|role| {
                (
                    role.name.clone(),
                    AclRoleEntry {
                        publish: role.publish.clone(),
                        subscribe: role.subscribe.clone(),
                    },
                )
            })
            .collect();

        Self {
            enabled: config.enabled,
            roles,
            default_publish: config.default.publish.clone(),
            default_subscribe: config.default.subscribe.clone(),
            auth_provider,
        }
    }

    /// Check if ACL is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check if topic matches pattern after variable substitution
    fn matches_pattern(
        pattern: &str,
        topic: &[u8],
        connection: ConnectionId,
        username: Option<&str>,
    ) -> bool {
        let pattern = pattern
            .replace("%c", &connection.to_string())
            .replace("%u", username.unwrap_or(""));

        topic_matches_pattern(pattern.as_bytes(), topic)
    }

    fn check_patterns(
        patterns: &[String],
        topic: &[u8],
        connection: ConnectionId,
        username: Option<&str>,
    ) -> bool {
        patterns
            .iter()
            .any(|p| Self::matches_pattern(p, topic, connection, username))
    }

    fn get_role_permissions(&self, username: Option<&str>) -> Option<&AclRoleEntry> {
        let role_name = self.auth_provider.get_user_role(username?)?;
        self.roles.get(role_name)
    }

    fn check(
        &self,
        connection: ConnectionId,
        username: Option<&str>,
        topic: &[u8],
        select: fn(&AclRoleEntry) -> &[String],
        defaults: &[String],
    ) -> bool {
        // The name the auth provider verified wins over the one claimed
        let verified = self.auth_provider.get_client_username(connection);
        let username = verified.as_deref().or(username);

        if let Some(role) = self.get_role_permissions(username) {
            if Self::check_patterns(select(role), topic, connection, username) {
                return true;
            }
        }

        if Self::check_patterns(defaults, topic, connection, username) {
            return true;
        }

        debug!(
            %connection,
            topic = %String::from_utf8_lossy(topic),
            "ACL denied"
        );
        false
    }
}

#[async_trait]
impl Hooks for AclProvider {
    async fn on_publish_check(
        &self,
        connection: ConnectionId,
        username: Option<&str>,
        topic: &[u8],
    ) -> HookResult<bool> {
        if !self.enabled {
            return Ok(true);
        }
        Ok(self.check(
            connection,
            username,
            topic,
            |role| role.publish.as_slice(),
            &self.default_publish,
        ))
    }

    async fn on_subscribe_check(
        &self,
        connection: ConnectionId,
        username: Option<&str>,
        pattern: &[u8],
        _queue_group: Option<&[u8]>,
    ) -> HookResult<bool> {
        if !self.enabled {
            return Ok(true);
        }
        // A subscription is allowed when an ACL pattern covers it as a whole
        Ok(self.check(
            connection,
            username,
            pattern,
            |role| role.subscribe.as_slice(),
            &self.default_subscribe,
        ))
    }
}
