//! Ocypode protocol definitions and types
//!
//! Defines the ten wire commands, the typed frames they carry, and the
//! error taxonomy shared by the codec and the broker.

mod error;
mod frame;
mod headers;

pub use error::{DecodeError, EncodeError, ErrorCode, ProtocolError};
pub use frame::*;
pub use headers::{HeaderBlock, HeaderEntries};

/// Protocol version spoken by this implementation
pub const PROTOCOL_VERSION: u8 = 1;

/// Default maximum payload size advertised in INFO (1 MiB)
pub const DEFAULT_MAX_PAYLOAD: u32 = 1024 * 1024;

/// Command identifier carried in the high nibble of the first frame byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Info = 0x1,
    Connect = 0x2,
    Pub = 0x3,
    Sub = 0x4,
    Unsub = 0x5,
    Msg = 0x6,
    Ping = 0x7,
    Pong = 0x8,
    Ok = 0x9,
    Err = 0xA,
}

impl Command {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x1 => Some(Command::Info),
            0x2 => Some(Command::Connect),
            0x3 => Some(Command::Pub),
            0x4 => Some(Command::Sub),
            0x5 => Some(Command::Unsub),
            0x6 => Some(Command::Msg),
            0x7 => Some(Command::Ping),
            0x8 => Some(Command::Pong),
            0x9 => Some(Command::Ok),
            0xA => Some(Command::Err),
            _ => None,
        }
    }

    /// Flag bits this command defines. Any other bit set in the low nibble
    /// is a reserved-flag violation.
    pub fn flag_mask(self) -> u8 {
        match self {
            Command::Connect => frame::flags::VERBOSE | frame::flags::HAS_AUTH,
            Command::Pub | Command::Msg => frame::flags::HAS_REPLY_TO | frame::flags::HAS_HEADER,
            Command::Sub => frame::flags::HAS_QUEUE_GROUP,
            Command::Info
            | Command::Unsub
            | Command::Ping
            | Command::Pong
            | Command::Ok
            | Command::Err => 0,
        }
    }

    /// Commands a client may send to the server
    pub fn is_client_command(self) -> bool {
        matches!(
            self,
            Command::Connect
                | Command::Pub
                | Command::Sub
                | Command::Unsub
                | Command::Ping
                | Command::Pong
        )
    }

    /// Commands the server may send to a client
    pub fn is_server_command(self) -> bool {
        matches!(
            self,
            Command::Info
                | Command::Msg
                | Command::Ping
                | Command::Pong
                | Command::Ok
                | Command::Err
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Info => "INFO",
            Command::Connect => "CONNECT",
            Command::Pub => "PUB",
            Command::Sub => "SUB",
            Command::Unsub => "UNSUB",
            Command::Msg => "MSG",
            Command::Ping => "PING",
            Command::Pong => "PONG",
            Command::Ok => "OK",
            Command::Err => "ERR",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
