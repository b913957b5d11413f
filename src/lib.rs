//! Ocypode - binary-framed pub/sub message broker
//!
//! A compact broker core: a length-prefixed binary wire protocol, validated
//! hierarchical topics with `+` and `#` wildcards, and fan-out dispatch with
//! queue-group load balancing.

pub mod acl;
pub mod auth;
pub mod broker;
pub mod codec;
pub mod config;
pub mod hooks;
pub mod protocol;
pub mod topic;

pub use acl::AclProvider;
pub use auth::AuthProvider;
pub use broker::{Broker, BrokerConfig, BrokerEvent};
pub use config::Config;
pub use hooks::{CompositeHooks, DefaultHooks, Hooks};
pub use protocol::{Frame, ProtocolError, PROTOCOL_VERSION};
pub use topic::ConnectionId;
