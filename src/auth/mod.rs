//! Authentication Module
//!
//! Static users from configuration, with plaintext or argon2 PHC passwords,
//! plus a static token list standing in for an external JWT validator.

use std::collections::HashMap;
use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::hooks::{HookResult, Hooks};
use crate::protocol::Auth;
use crate::topic::ConnectionId;


/// Authentication provider
pub struct AuthProvider {
    /// Whether auth is enabled
    enabled: bool,
    /// Allow connections without credentials
    allow_anonymous: bool,
    /// username -> entry
    users: HashMap<String, UserEntry>,
    /// token -> username
    tokens: HashMap<String, String>,
    /// Authenticated username per live connection (for ACL lookups)
    connection_usernames: Arc<RwLock<HashMap<ConnectionId, Option<String>>>>,
}

enum Credential {
    Plaintext(String),
    /// argon2 PHC string
    Hash(String),
}

struct UserEntry {
    credential: Credential,
    /// ACL role (if any)
    role: Option<String>,
    /// May use `$SYS` topics
    system: bool,
}

impl AuthProvider {
    /// Create a new auth provider from configuration
    pub fn new(config: &AuthConfig) -> Self {
        let mut users = HashMap::new();

        for user in &config.users {
            let credential = match (&user.password, &user.password_hash) {
                (_, Some(hash)) => Credential::Hash(hash.clone()),
                (Some(password), None) => Credential::Plaintext(password.clone()),
                // Rejected by Config::validate; never matches
                (None, None) => Credential::Hash(String::new()),
            };
            users.insert(
                user.username.clone(),
                UserEntry {
                    credential,
                    role: user.role.clone(),
                    system: user.system,
                },
            );
        }

        let tokens = config
            .tokens
            .iter()
            .map(|t| (t.token.clone(), t.username.clone()))
            .collect();

        Self {
            enabled: config.enabled,
            allow_anonymous: config.allow_anonymous,
            users,
            tokens,
            connection_usernames: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Check if auth is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Get the ACL role for a username
    pub fn get_user_role(&self, username: &str) -> Option<&str> {
        self.users.get(username).and_then(|u| u.role.as_deref())
    }

    /// Whether `username` is configured with system privilege
    pub fn is_system_user(&self, username: &str) -> bool {
        self.users.get(username).is_some_and(|u| u.system)
    }

    /// Get the username a live connection authenticated as
    pub fn get_client_username(&self, connection: ConnectionId) -> Option<String> {
        self.connection_usernames
            .read()
            .get(&connection)
            .and_then(|u| u.clone())
    }

    fn verify_password(password: &[u8], credential: &Credential) -> bool {
        match credential {
            Credential::Plaintext(stored) => password == stored.as_bytes(),
            Credential::Hash(phc) => match PasswordHash::new(phc) {
                Ok(parsed) => Argon2::default()
                    .verify_password(password, &parsed)
                    .is_ok(),
                Err(e) => {
                    warn!("Unusable password hash in configuration: {}", e);
                    false
                }
            },
        }
    }

    fn store_client_username(&self, connection: ConnectionId, username: Option<&str>) {
        self.connection_usernames
            .write()
            .insert(connection, username.map(|s| s.to_string()));
    }

    /// Remove a connection's username mapping
    pub fn remove_client_username(&self, connection: ConnectionId) {
        self.connection_usernames.write().remove(&connection);
    }

    fn authenticate_password(&self, connection: ConnectionId, username: &[u8], password: &[u8]) -> bool {
        let Ok(username) = std::str::from_utf8(username) else {
            return false;
        };
        let Some(user) = self.users.get(username) else {
            debug!(%connection, "Unknown user '{}'", username);
            return false;
        };
        if Self::verify_password(password, &user.credential) {
            self.store_client_username(connection, Some(username));
            true
        } else {
            debug!(%connection, "Wrong password for '{}'", username);
            false
        }
    }

    fn authenticate_token(&self, connection: ConnectionId, token: &[u8]) -> bool {
        let username = std::str::from_utf8(token)
            .ok()
            .and_then(|token| self.tokens.get(token));
        match username {
            Some(username) => {
                self.store_client_username(connection, Some(username));
                true
            }
            None => {
                debug!(%connection, "Unknown token");
                false
            }
        }
    }
}

#[async_trait]
impl Hooks for AuthProvider {
    async fn on_authenticate(
        &self,
        connection: ConnectionId,
        auth: Option<&Auth>,
    ) -> HookResult<bool> {
        // If auth is disabled, allow all and remember the claimed name
        if !self.enabled {
            let username = auth
                .and_then(Auth::username)
                .and_then(|u| std::str::from_utf8(u).ok());
            self.store_client_username(connection, username);
            return Ok(true);
        }

        let accepted = match auth {
            None if self.allow_anonymous => {
                self.store_client_username(connection, None);
                true
            }
            None => false,
            Some(Auth::Password { username, password }) => {
                self.authenticate_password(connection, username, password)
            }
            Some(Auth::Jwt { token }) => self.authenticate_token(connection, token),
        };
        Ok(accepted)
    }

    async fn is_privileged(&self, connection: ConnectionId, username: Option<&str>) -> bool {
        // Unverified names never carry privilege
        if !self.enabled {
            return false;
        }
        let stored = self.get_client_username(connection);
        stored
            .as_deref()
            .or(username)
            .is_some_and(|u| self.is_system_user(u))
    }

    async fn on_client_disconnected(&self, connection: ConnectionId) {
        self.remove_client_username(connection);
    }
}
