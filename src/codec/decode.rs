//! Ocypode Frame Decoder
//!
//! Decodes frames incrementally. A fixed header that has been parsed but
//! whose body has not fully arrived is kept across calls, so a partial read
//! never re-parses or loses bytes.

use bytes::{Buf, Bytes, BytesMut};

use super::{read_variable_int, BodyReader, FixedHeader, FRAME_OVERHEAD, MAX_VARINT};
use crate::protocol::{
    auth_type, capabilities, flags, Auth, Command, Connect, DecodeError, ErrorCode, ErrorFrame,
    Frame, HeaderBlock, Info, Msg, Publish, Subscribe, Unsubscribe, DEFAULT_MAX_PAYLOAD,
};

/// Which side of the connection a decoder runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Server side: accepts client-originated commands
    Server,
    /// Client side: accepts server-originated commands
    Client,
}

impl Direction {
    fn accepts(self, command: Command) -> bool {
        match self {
            Direction::Server => command.is_client_command(),
            Direction::Client => command.is_server_command(),
        }
    }
}

/// Ocypode Frame Decoder
#[derive(Debug)]
pub struct Decoder {
    direction: Direction,
    /// Maximum payload size accepted in PUB / MSG
    max_payload: u32,
    /// Fixed header of a frame whose body is still incomplete
    pending: Option<FixedHeader>,
}

impl Decoder {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            max_payload: DEFAULT_MAX_PAYLOAD,
            pending: None,
        }
    }

    /// Decoder for frames a server receives
    pub fn server() -> Self {
        Self::new(Direction::Server)
    }

    /// Decoder for frames a client receives
    pub fn client() -> Self {
        Self::new(Direction::Client)
    }

    pub fn with_max_payload(mut self, max_payload: u32) -> Self {
        self.max_payload = max_payload.min(MAX_VARINT);
        self
    }

    /// Clients adopt the limit advertised in INFO
    pub fn set_max_payload(&mut self, max_payload: u32) {
        self.max_payload = max_payload.min(MAX_VARINT);
    }

    pub fn max_payload(&self) -> u32 {
        self.max_payload
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// True while a fixed header is parsed but its body has not arrived
    pub fn has_pending_header(&self) -> bool {
        self.pending.is_some()
    }

    fn max_remaining_length(&self) -> u32 {
        (self.max_payload as u64 + FRAME_OVERHEAD as u64).min(MAX_VARINT as u64) as u32
    }

    /// Decode the next frame, consuming its bytes from `buf`.
    ///
    /// Returns `Ok(None)` when more data is needed. The returned frame's
    /// fields are slices of the consumed bytes.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        let header = match self.pending {
            Some(header) => header,
            None => match self.parse_fixed_header(buf)? {
                Some((header, header_len)) => {
                    buf.advance(header_len);
                    self.pending = Some(header);
                    header
                }
                None => return Ok(None),
            },
        };

        let body_len = header.remaining_length as usize;
        if buf.len() < body_len {
            buf.reserve(body_len - buf.len());
            return Ok(None);
        }

        self.pending = None;
        let body = buf.split_to(body_len).freeze();
        self.decode_body(header, body).map(Some)
    }

    /// Decode one frame from the start of `src` without consuming it.
    ///
    /// Returns the frame and the number of bytes it occupied, or `Ok(None)`
    /// when `src` does not yet hold a complete frame.
    pub fn decode_frame(&self, src: &Bytes) -> Result<Option<(Frame, usize)>, DecodeError> {
        let Some((header, header_len)) = self.parse_fixed_header(src)? else {
            return Ok(None);
        };

        let total_len = header_len + header.remaining_length as usize;
        if src.len() < total_len {
            return Ok(None);
        }

        let body = src.slice(header_len..total_len);
        let frame = self.decode_body(header, body)?;
        Ok(Some((frame, total_len)))
    }

    fn parse_fixed_header(&self, buf: &[u8]) -> Result<Option<(FixedHeader, usize)>, DecodeError> {
        let Some(&first_byte) = buf.first() else {
            return Ok(None);
        };

        let nibble = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let command = Command::from_u8(nibble).ok_or(DecodeError::UnknownCommand(nibble))?;
        if !self.direction.accepts(command) {
            return Err(DecodeError::UnexpectedCommand(command));
        }
        if flags & !command.flag_mask() != 0 {
            return Err(DecodeError::ReservedFlagSet);
        }

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length > self.max_remaining_length() {
            return Err(DecodeError::PayloadTooLarge);
        }

        Ok(Some((
            FixedHeader {
                command,
                flags,
                remaining_length,
            },
            1 + len_bytes,
        )))
    }

    fn decode_body(&self, header: FixedHeader, body: Bytes) -> Result<Frame, DecodeError> {
        let flags = header.flags;
        let mut r = BodyReader::new(body);

        let frame = match header.command {
            Command::Info => Frame::Info(decode_info(&mut r)?),
            Command::Connect => Frame::Connect(decode_connect(flags, &mut r)?),
            Command::Pub => Frame::Pub(self.decode_publish(flags, &mut r)?),
            Command::Sub => Frame::Sub(decode_subscribe(flags, &mut r)?),
            Command::Unsub => Frame::Unsub(Unsubscribe {
                subscription_id: r.lp16()?,
            }),
            Command::Msg => Frame::Msg(self.decode_msg(flags, &mut r)?),
            Command::Ping => Frame::Ping,
            Command::Pong => Frame::Pong,
            Command::Ok => Frame::Ok,
            Command::Err => Frame::Err(decode_err(&mut r)?),
        };

        r.finish()?;
        Ok(frame)
    }

    fn decode_publish(&self, flags: u8, r: &mut BodyReader) -> Result<Publish, DecodeError> {
        let topic = r.lp16()?;
        let reply_to = optional(flags & flags::HAS_REPLY_TO != 0, || r.lp16())?;
        let header = self.decode_header_block(flags, r)?;
        let payload = self.decode_payload(r)?;

        Ok(Publish {
            topic,
            reply_to,
            header,
            payload,
        })
    }

    fn decode_msg(&self, flags: u8, r: &mut BodyReader) -> Result<Msg, DecodeError> {
        let topic = r.lp16()?;
        let subscription_id = r.lp16()?;
        let reply_to = optional(flags & flags::HAS_REPLY_TO != 0, || r.lp16())?;
        let header = self.decode_header_block(flags, r)?;
        let payload = self.decode_payload(r)?;

        Ok(Msg {
            topic,
            subscription_id,
            reply_to,
            header,
            payload,
        })
    }

    fn decode_header_block(
        &self,
        flags: u8,
        r: &mut BodyReader,
    ) -> Result<Option<HeaderBlock>, DecodeError> {
        if flags & flags::HAS_HEADER == 0 {
            return Ok(None);
        }
        let raw = r.lp16()?;
        HeaderBlock::from_raw(raw).map(Some)
    }

    fn decode_payload(&self, r: &mut BodyReader) -> Result<Bytes, DecodeError> {
        let payload_size = r.varint()?;
        if payload_size > self.max_payload {
            return Err(DecodeError::PayloadTooLarge);
        }
        r.bytes(payload_size as usize)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::server()
    }
}

#[inline]
fn optional<T>(
    present: bool,
    read: impl FnOnce() -> Result<T, DecodeError>,
) -> Result<Option<T>, DecodeError> {
    if present {
        read().map(Some)
    } else {
        Ok(None)
    }
}

fn decode_info(r: &mut BodyReader) -> Result<Info, DecodeError> {
    let version = r.u8()?;
    let max_payload = r.u32()?;
    let server_id = r.lp8()?;
    let server_name = r.lp8()?;
    let caps = r.u8()?;
    if caps & !(capabilities::AUTH_REQUIRED | capabilities::HEADERS) != 0 {
        return Err(DecodeError::ReservedFlagSet);
    }

    Ok(Info {
        version,
        max_payload,
        server_id,
        server_name,
        auth_required: caps & capabilities::AUTH_REQUIRED != 0,
        headers_supported: caps & capabilities::HEADERS != 0,
    })
}

fn decode_connect(flags: u8, r: &mut BodyReader) -> Result<Connect, DecodeError> {
    let version = r.u8()?;

    let auth = if flags & flags::HAS_AUTH != 0 {
        let kind = r.u8()?;
        let auth_len = r.varint()? as usize;
        if auth_len > r.remaining() {
            return Err(DecodeError::FrameLengthMismatch);
        }
        // The auth section is parsed on its own so its declared length is
        // checked independently of the frame length
        let mut auth = BodyReader::new(r.bytes(auth_len)?);
        let parsed = match kind {
            auth_type::PASSWORD => Auth::Password {
                username: auth.lp8()?,
                password: auth.lp8()?,
            },
            auth_type::JWT => Auth::Jwt {
                token: auth.lp16()?,
            },
            other => return Err(DecodeError::UnknownAuthType(other)),
        };
        auth.finish()?;
        Some(parsed)
    } else {
        None
    };

    Ok(Connect {
        version,
        verbose: flags & flags::VERBOSE != 0,
        auth,
    })
}

fn decode_subscribe(flags: u8, r: &mut BodyReader) -> Result<Subscribe, DecodeError> {
    let topic = r.lp16()?;
    let subscription_id = r.lp16()?;
    let queue_group = optional(flags & flags::HAS_QUEUE_GROUP != 0, || r.lp8())?;

    Ok(Subscribe {
        topic,
        subscription_id,
        queue_group,
    })
}

fn decode_err(r: &mut BodyReader) -> Result<ErrorFrame, DecodeError> {
    let raw = r.u8()?;
    let code = ErrorCode::from_u8(raw).ok_or(DecodeError::UnknownErrorCode(raw))?;
    let message = r.lp16()?;
    Ok(ErrorFrame { code, message })
}
