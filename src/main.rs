//! Ocypode - binary-framed pub/sub broker
//!
//! Usage:
//!   ocypode [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>        Configuration file path
//!   -b, --bind <ADDR>          Bind address (default: 0.0.0.0:7400)
//!   -w, --workers <N>          Number of worker threads (default: CPU count)
//!   --max-connections <N>      Maximum connections (default: 100000)
//!   --max-payload <N>          Maximum PUB payload in bytes (default: 1MiB)
//!   -l, --log-level            Log level (error, warn, info, debug, trace)
//!   -h, --help                 Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use ocypode::acl::AclProvider;
use ocypode::auth::AuthProvider;
use ocypode::broker::{Broker, BrokerConfig};
use ocypode::config::Config;
use ocypode::hooks::CompositeHooks;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// Ocypode - binary-framed pub/sub broker
#[derive(Parser, Debug)]
#[command(name = "ocypode")]
#[command(author = "Ocypode Contributors")]
#[command(version)]
#[command(about = "Binary-framed pub/sub message broker with wildcard topic dispatch")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Number of worker threads (0 = auto)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Maximum connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum PUB payload in bytes
    #[arg(long)]
    max_payload: Option<u32>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise defaults and environment
    let mut file_config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    // CLI overrides config, config overrides default (info)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&file_config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    if let Some(bind) = args.bind {
        file_config.server.bind = bind;
    }
    if let Some(workers) = args.workers {
        file_config.server.workers = workers;
    }
    if let Some(max_connections) = args.max_connections {
        file_config.limits.max_connections = max_connections;
    }
    if let Some(max_payload) = args.max_payload {
        file_config.limits.max_payload = max_payload;
    }
    // Overrides go through the same checks as the file
    file_config.validate()?;

    let broker_config = broker_config(&file_config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(broker_config.num_workers)
        .thread_name("ocypode-worker")
        .enable_all()
        .build()?;

    runtime.block_on(run(file_config, broker_config))
}

fn broker_config(config: &Config) -> BrokerConfig {
    let defaults = BrokerConfig::default();
    let num_workers = if config.server.workers == 0 {
        defaults.num_workers
    } else {
        config.server.workers
    };

    BrokerConfig {
        bind_addr: config.server.bind,
        max_connections: config.limits.max_connections,
        max_payload: config.limits.max_payload,
        keep_alive: config.session.keep_alive,
        ping_interval: config.session.ping_interval,
        connect_timeout: config.session.connect_timeout,
        server_id: config.server.server_id.clone(),
        server_name: config.server.server_name.clone(),
        auth_required: config.auth.enabled && config.auth.required,
        outbound_channel_capacity: config.limits.outbound_channel_capacity,
        router_channel_capacity: config.limits.router_channel_capacity,
        num_workers,
    }
}

async fn run(config: Config, broker_config: BrokerConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting Ocypode broker");
    info!("  Bind address: {}", broker_config.bind_addr);
    info!("  Workers: {}", broker_config.num_workers);
    info!("  Max connections: {}", broker_config.max_connections);
    info!("  Max payload: {} bytes", broker_config.max_payload);
    info!(
        "  Keep alive: {:?} (ping every {:?})",
        broker_config.keep_alive, broker_config.ping_interval
    );

    // Log auth/ACL status
    if config.auth.enabled {
        info!(
            "  Authentication: enabled ({} users, {} tokens, required={})",
            config.auth.users.len(),
            config.auth.tokens.len(),
            config.auth.required
        );
    } else {
        info!("  Authentication: disabled");
    }
    if config.acl.enabled {
        info!("  ACL: enabled ({} roles configured)", config.acl.roles.len());
    } else {
        info!("  ACL: disabled");
    }

    // Create auth and ACL providers
    let auth_provider = Arc::new(AuthProvider::new(&config.auth));
    let acl_provider = Arc::new(AclProvider::new(&config.acl, auth_provider.clone()));

    // Compose hooks: auth first, then ACL
    let hooks = Arc::new(CompositeHooks::new().with(auth_provider).with(acl_provider));

    let broker = Arc::new(Broker::with_hooks(broker_config, hooks));

    let signal_broker = broker.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down");
                signal_broker.shutdown();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    broker.run().await?;

    // Give connection tasks a moment to tear down
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    Ok(())
}

