//! Configuration Module
//!
//! Provides TOML-based configuration for Ocypode with support for:
//! - Server settings (bind address, workers, identity sent in INFO)
//! - Payload and connection limits
//! - Handshake and keep-alive timers
//! - Authentication and ACL
//! - Environment variable overrides (OCYPODE_* prefix)

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::DEFAULT_PORT;
use crate::codec::MAX_VARINT;
use crate::protocol::DEFAULT_MAX_PAYLOAD;


const ENV_VAR_PATTERN: &str = r"\$\{([^}:]+)(?::-([^}]*))?\}";

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(ENV_VAR_PATTERN)?;
    let substituted = re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    });
    Ok(substituted.into_owned())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Substitution pattern error
    Pattern(regex::Error),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Pattern(e) => write!(f, "Pattern error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl From<regex::Error> for ConfigError {
    fn from(e: regex::Error) -> Self {
        ConfigError::Pattern(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub auth: AuthConfig,
    pub acl: AclConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
    /// Number of worker threads (0 = auto)
    pub workers: usize,
    /// Identity advertised in INFO
    pub server_id: String,
    pub server_name: String,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            workers: 0,
            server_id: "ocypode".to_string(),
            server_name: "ocypode".to_string(),
        }
    }
}

/// Payload and connection limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest PUB payload accepted, advertised in INFO
    pub max_payload: u32,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Per-connection outbound MSG channel capacity. A subscriber whose
    /// channel is full loses messages instead of slowing the publisher.
    pub outbound_channel_capacity: usize,
    /// Router command channel capacity
    pub router_channel_capacity: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_connections: 100_000,
            outbound_channel_capacity: 1024,
            router_channel_capacity: 4096,
        }
    }
}

/// Handshake and keep-alive timers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a PONG may take after the server's PING
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    /// How often the server PINGs a ready connection
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    /// How long a client may take to send CONNECT
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(30),
            ping_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether credentials are checked
    pub enabled: bool,
    /// Whether CONNECT must carry credentials (advertised in INFO)
    pub required: bool,
    /// Allow connections without credentials when auth is enabled
    pub allow_anonymous: bool,
    /// Static user list
    pub users: Vec<UserConfig>,
    /// Static token list accepted as JWT credentials
    pub tokens: Vec<TokenConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            required: false,
            allow_anonymous: true,
            users: Vec::new(),
            tokens: Vec::new(),
        }
    }
}

/// User configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    /// Password (plaintext) - use password_hash for production
    #[serde(default)]
    pub password: Option<String>,
    /// Password hash (argon2 PHC format: $argon2id$v=19$...)
    #[serde(default)]
    pub password_hash: Option<String>,
    /// Role name for ACL permissions
    #[serde(default)]
    pub role: Option<String>,
    /// May publish and subscribe under `$SYS`
    #[serde(default)]
    pub system: bool,
}

/// Token credential mapped to a username
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub token: String,
    pub username: String,
}

/// ACL configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclConfig {
    /// Whether ACL is enabled
    pub enabled: bool,
    pub roles: Vec<AclRole>,
    /// Permissions for users without explicit role (including anonymous)
    pub default: AclPermissions,
}

/// ACL role
#[derive(Debug, Clone, Deserialize)]
pub struct AclRole {
    pub name: String,
    /// Topic patterns this role can publish to
    #[serde(default)]
    pub publish: Vec<String>,
    /// Topic patterns this role can subscribe to
    #[serde(default)]
    pub subscribe: Vec<String>,
}

/// ACL permissions
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclPermissions {
    pub publish: Vec<String>,
    pub subscribe: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `OCYPODE__` prefix with double underscores for nesting:
    ///    - `OCYPODE__SERVER__BIND=0.0.0.0:7401` overrides `server.bind`
    ///    - `OCYPODE__LIMITS__MAX_PAYLOAD=65536` overrides `limits.max_payload`
    ///    - `OCYPODE__SESSION__KEEP_ALIVE=45s` overrides `session.keep_alive`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", default_bind().to_string())?
            .set_default("server.workers", 0)?
            .set_default("server.server_id", "ocypode")?
            .set_default("server.server_name", "ocypode")?
            .set_default("limits.max_payload", DEFAULT_MAX_PAYLOAD)?
            .set_default("limits.max_connections", 100_000)?
            .set_default("limits.outbound_channel_capacity", 1024)?
            .set_default("limits.router_channel_capacity", 4096)?
            .set_default("session.keep_alive", "30s")?
            .set_default("session.ping_interval", "60s")?
            .set_default("session.connect_timeout", "10s")?
            .set_default("auth.enabled", false)?
            .set_default("auth.required", false)?
            .set_default("auth.allow_anonymous", true)?
            .set_default("acl.enabled", false)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("OCYPODE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_payload == 0 {
            return Err(ConfigError::Validation(
                "max_payload must be greater than 0".to_string(),
            ));
        }
        if self.limits.max_payload > MAX_VARINT {
            return Err(ConfigError::Validation(format!(
                "max_payload must not exceed {} bytes",
                MAX_VARINT
            )));
        }
        if self.session.ping_interval.is_zero() {
            return Err(ConfigError::Validation(
                "ping_interval must be greater than 0".to_string(),
            ));
        }
        if self.session.keep_alive.is_zero() {
            return Err(ConfigError::Validation(
                "keep_alive must be greater than 0".to_string(),
            ));
        }

        if self.auth.enabled {
            for user in &self.auth.users {
                match (&user.password, &user.password_hash) {
                    (None, None) => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' must have either 'password' or 'password_hash'",
                            user.username
                        )));
                    }
                    (Some(_), Some(_)) => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' cannot have both 'password' and 'password_hash'",
                            user.username
                        )));
                    }
                    (Some(pwd), None) if pwd.is_empty() => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' has empty password",
                            user.username
                        )));
                    }
                    (None, Some(hash)) if !hash.starts_with("$argon2") => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' has invalid password_hash format (must be argon2 PHC format)",
                            user.username
                        )));
                    }
                    _ => {}
                }
            }
        } else if self.auth.required {
            return Err(ConfigError::Validation(
                "auth.required needs auth.enabled".to_string(),
            ));
        }

        if self.auth.enabled && self.acl.enabled {
            let role_names: HashSet<_> = self.acl.roles.iter().map(|r| &r.name).collect();

            for user in &self.auth.users {
                if let Some(ref role) = user.role {
                    if !role_names.contains(role) {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' references unknown role '{}'",
                            user.username, role
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}
