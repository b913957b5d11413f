//! Protocol error types

use std::fmt;

use bytes::Bytes;

use super::{Command, ErrorFrame};
use crate::topic::TopicError;

/// Errors that can occur during frame decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data in buffer
    InsufficientData,
    /// Varint is over-long or runs past four bytes
    MalformedVarint,
    /// Declared field lengths do not add up to remaining_length
    FrameLengthMismatch,
    /// A reserved flag bit is set
    ReservedFlagSet,
    /// Command nibble outside the defined set
    UnknownCommand(u8),
    /// Well-formed command sent in the wrong direction
    UnexpectedCommand(Command),
    /// CONNECT auth type outside the defined set
    UnknownAuthType(u8),
    /// ERR code outside the defined set
    UnknownErrorCode(u8),
    /// Frame or payload exceeds the negotiated maximum
    PayloadTooLarge,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::MalformedVarint => write!(f, "malformed variable-length integer"),
            Self::FrameLengthMismatch => write!(f, "frame length mismatch"),
            Self::ReservedFlagSet => write!(f, "reserved flag bit set"),
            Self::UnknownCommand(c) => write!(f, "unknown command: {:#x}", c),
            Self::UnexpectedCommand(c) => write!(f, "unexpected command: {}", c),
            Self::UnknownAuthType(t) => write!(f, "unknown auth type: {}", t),
            Self::UnknownErrorCode(c) => write!(f, "unknown error code: {:#x}", c),
            Self::PayloadTooLarge => write!(f, "payload too large"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur during frame encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Value does not fit in a four-byte varint
    VarintOverflow(u64),
    /// Length-prefixed field longer than its prefix allows
    FieldTooLong(&'static str),
    /// Payload larger than the encoder's configured maximum
    PayloadTooLarge,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VarintOverflow(v) => write!(f, "value {} exceeds varint maximum", v),
            Self::FieldTooLong(field) => write!(f, "{} too long", field),
            Self::PayloadTooLarge => write!(f, "payload too large"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Wire code carried by ERR frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    MalformedVarint = 0x01,
    FrameLengthMismatch = 0x02,
    ReservedFlagSet = 0x03,
    InvalidTopic = 0x04,
    ReservedTopic = 0x05,
    DuplicateSubscriptionId = 0x06,
    UnknownSubscriptionId = 0x07,
    PayloadTooLarge = 0x08,
    AuthRequired = 0x09,
    AuthFailed = 0x0A,
    UnknownCommand = 0x0B,
    UnexpectedCommand = 0x0C,
    PermissionDenied = 0x0D,
    UnsupportedVersion = 0x0E,
    Internal = 0xFF,
}

impl ErrorCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(ErrorCode::MalformedVarint),
            0x02 => Some(ErrorCode::FrameLengthMismatch),
            0x03 => Some(ErrorCode::ReservedFlagSet),
            0x04 => Some(ErrorCode::InvalidTopic),
            0x05 => Some(ErrorCode::ReservedTopic),
            0x06 => Some(ErrorCode::DuplicateSubscriptionId),
            0x07 => Some(ErrorCode::UnknownSubscriptionId),
            0x08 => Some(ErrorCode::PayloadTooLarge),
            0x09 => Some(ErrorCode::AuthRequired),
            0x0A => Some(ErrorCode::AuthFailed),
            0x0B => Some(ErrorCode::UnknownCommand),
            0x0C => Some(ErrorCode::UnexpectedCommand),
            0x0D => Some(ErrorCode::PermissionDenied),
            0x0E => Some(ErrorCode::UnsupportedVersion),
            0xFF => Some(ErrorCode::Internal),
            _ => None,
        }
    }
}

/// Errors reported to a peer, with the severity that decides whether the
/// connection survives them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    MalformedVarint,
    FrameLengthMismatch,
    ReservedFlagSet,
    InvalidTopic(TopicError),
    ReservedTopic,
    DuplicateSubscriptionId,
    UnknownSubscriptionId,
    PayloadTooLarge,
    AuthRequired,
    AuthFailed,
    KeepAliveTimeout,
    UnknownCommand(u8),
    UnexpectedCommand(Command),
    UnsupportedVersion(u8),
    PermissionDenied,
    Internal(&'static str),
}

impl ProtocolError {
    /// Wire code for the ERR frame. `None` means no ERR is sent.
    pub fn code(&self) -> Option<ErrorCode> {
        let code = match self {
            Self::MalformedVarint => ErrorCode::MalformedVarint,
            Self::FrameLengthMismatch => ErrorCode::FrameLengthMismatch,
            Self::ReservedFlagSet => ErrorCode::ReservedFlagSet,
            Self::InvalidTopic(_) => ErrorCode::InvalidTopic,
            Self::ReservedTopic => ErrorCode::ReservedTopic,
            Self::DuplicateSubscriptionId => ErrorCode::DuplicateSubscriptionId,
            Self::UnknownSubscriptionId => ErrorCode::UnknownSubscriptionId,
            Self::PayloadTooLarge => ErrorCode::PayloadTooLarge,
            Self::AuthRequired => ErrorCode::AuthRequired,
            Self::AuthFailed => ErrorCode::AuthFailed,
            Self::KeepAliveTimeout => return None,
            Self::UnknownCommand(_) => ErrorCode::UnknownCommand,
            Self::UnexpectedCommand(_) => ErrorCode::UnexpectedCommand,
            Self::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            Self::PermissionDenied => ErrorCode::PermissionDenied,
            Self::Internal(_) => ErrorCode::Internal,
        };
        Some(code)
    }

    /// Whether the connection moves to Closing after reporting this error
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::InvalidTopic(_)
                | Self::ReservedTopic
                | Self::DuplicateSubscriptionId
                | Self::UnknownSubscriptionId
                | Self::PermissionDenied
        )
    }

    /// ERR frame reporting this error, if one is sent
    pub fn to_frame(&self) -> Option<ErrorFrame> {
        self.code().map(|code| ErrorFrame {
            code,
            message: Bytes::from(self.to_string()),
        })
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedVarint => write!(f, "malformed varint"),
            Self::FrameLengthMismatch => write!(f, "frame length mismatch"),
            Self::ReservedFlagSet => write!(f, "reserved flag set"),
            Self::InvalidTopic(e) => write!(f, "invalid topic: {}", e),
            Self::ReservedTopic => write!(f, "reserved topic"),
            Self::DuplicateSubscriptionId => write!(f, "duplicate subscription id"),
            Self::UnknownSubscriptionId => write!(f, "unknown subscription id"),
            Self::PayloadTooLarge => write!(f, "payload too large"),
            Self::AuthRequired => write!(f, "authentication required"),
            Self::AuthFailed => write!(f, "authentication failed"),
            Self::KeepAliveTimeout => write!(f, "keep alive timeout"),
            Self::UnknownCommand(c) => write!(f, "unknown command: {:#x}", c),
            Self::UnexpectedCommand(c) => write!(f, "unexpected command: {}", c),
            Self::UnsupportedVersion(v) => write!(f, "unsupported protocol version: {}", v),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::MalformedVarint => ProtocolError::MalformedVarint,
            // A short read inside a complete frame is a length mismatch
            DecodeError::InsufficientData | DecodeError::FrameLengthMismatch => {
                ProtocolError::FrameLengthMismatch
            }
            DecodeError::ReservedFlagSet => ProtocolError::ReservedFlagSet,
            DecodeError::UnknownCommand(c) => ProtocolError::UnknownCommand(c),
            DecodeError::UnexpectedCommand(c) => ProtocolError::UnexpectedCommand(c),
            DecodeError::UnknownAuthType(_) => ProtocolError::AuthFailed,
            DecodeError::UnknownErrorCode(_) => ProtocolError::Internal("unknown error code"),
            DecodeError::PayloadTooLarge => ProtocolError::PayloadTooLarge,
        }
    }
}

impl From<TopicError> for ProtocolError {
    fn from(e: TopicError) -> Self {
        match e {
            TopicError::Reserved => ProtocolError::ReservedTopic,
            other => ProtocolError::InvalidTopic(other),
        }
    }
}
