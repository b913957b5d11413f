//! Frame Definitions
//!
//! Byte-string fields are `Bytes` slices of the buffer the frame was decoded
//! from, so holding a frame keeps that buffer alive and copies nothing.

use bytes::Bytes;

use super::{Command, ErrorCode, HeaderBlock};

/// Flag bits in the low nibble of the first frame byte
pub mod flags {
    /// CONNECT: client wants OK acknowledgements
    pub const VERBOSE: u8 = 0x01;
    /// CONNECT: an auth section follows the version byte
    pub const HAS_AUTH: u8 = 0x02;
    /// PUB / MSG: a reply-to topic follows the subscription id (MSG) or topic (PUB)
    pub const HAS_REPLY_TO: u8 = 0x01;
    /// PUB / MSG: a header block precedes the payload
    pub const HAS_HEADER: u8 = 0x02;
    /// SUB: a queue group name follows the subscription id
    pub const HAS_QUEUE_GROUP: u8 = 0x01;
}

/// Capability bits in INFO
pub mod capabilities {
    pub const AUTH_REQUIRED: u8 = 0x01;
    pub const HEADERS: u8 = 0x02;
}

/// Auth type discriminants inside CONNECT
pub mod auth_type {
    pub const PASSWORD: u8 = 1;
    pub const JWT: u8 = 2;
}

/// A single protocol frame, in either direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Info(Info),
    Connect(Connect),
    Pub(Publish),
    Sub(Subscribe),
    Unsub(Unsubscribe),
    Msg(Msg),
    Ping,
    Pong,
    Ok,
    Err(ErrorFrame),
}

impl Frame {
    pub fn command(&self) -> Command {
        match self {
            Frame::Info(_) => Command::Info,
            Frame::Connect(_) => Command::Connect,
            Frame::Pub(_) => Command::Pub,
            Frame::Sub(_) => Command::Sub,
            Frame::Unsub(_) => Command::Unsub,
            Frame::Msg(_) => Command::Msg,
            Frame::Ping => Command::Ping,
            Frame::Pong => Command::Pong,
            Frame::Ok => Command::Ok,
            Frame::Err(_) => Command::Err,
        }
    }

    /// Low-nibble flags implied by the optional sections present
    pub fn flags(&self) -> u8 {
        match self {
            Frame::Connect(c) => {
                let mut f = 0;
                if c.verbose {
                    f |= flags::VERBOSE;
                }
                if c.auth.is_some() {
                    f |= flags::HAS_AUTH;
                }
                f
            }
            Frame::Pub(p) => optional_section_flags(p.reply_to.is_some(), p.header.is_some()),
            Frame::Msg(m) => optional_section_flags(m.reply_to.is_some(), m.header.is_some()),
            Frame::Sub(s) => {
                if s.queue_group.is_some() {
                    flags::HAS_QUEUE_GROUP
                } else {
                    0
                }
            }
            _ => 0,
        }
    }
}

fn optional_section_flags(reply_to: bool, header: bool) -> u8 {
    let mut f = 0;
    if reply_to {
        f |= flags::HAS_REPLY_TO;
    }
    if header {
        f |= flags::HAS_HEADER;
    }
    f
}

/// INFO frame (server -> client), sent immediately after accept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub version: u8,
    /// Largest payload the server accepts in a PUB
    pub max_payload: u32,
    pub server_id: Bytes,
    pub server_name: Bytes,
    pub auth_required: bool,
    pub headers_supported: bool,
}

/// Credentials carried by CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    Password { username: Bytes, password: Bytes },
    Jwt { token: Bytes },
}

impl Auth {
    pub fn auth_type(&self) -> u8 {
        match self {
            Auth::Password { .. } => auth_type::PASSWORD,
            Auth::Jwt { .. } => auth_type::JWT,
        }
    }

    /// Username, when the credential carries one
    pub fn username(&self) -> Option<&Bytes> {
        match self {
            Auth::Password { username, .. } => Some(username),
            Auth::Jwt { .. } => None,
        }
    }
}

/// CONNECT frame (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub version: u8,
    /// Client wants OK acknowledgements for PUB, SUB and UNSUB
    pub verbose: bool,
    pub auth: Option<Auth>,
}

/// PUB frame (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: Bytes,
    pub reply_to: Option<Bytes>,
    pub header: Option<HeaderBlock>,
    pub payload: Bytes,
}

/// SUB frame (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    /// Topic pattern, may contain wildcards
    pub topic: Bytes,
    /// Client-chosen id, unique per connection
    pub subscription_id: Bytes,
    pub queue_group: Option<Bytes>,
}

/// UNSUB frame (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub subscription_id: Bytes,
}

/// MSG frame (server -> client), one per matching subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    /// Concrete topic the message was published on
    pub topic: Bytes,
    /// Recipient's subscription id
    pub subscription_id: Bytes,
    pub reply_to: Option<Bytes>,
    pub header: Option<HeaderBlock>,
    pub payload: Bytes,
}

/// ERR frame (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub code: ErrorCode,
    pub message: Bytes,
}
