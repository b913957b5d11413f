//! Ocypode Frame Encoder
//!
//! The body length is computed before anything is written, so every frame
//! goes straight into the output buffer in one pass.

use bytes::{BufMut, Bytes, BytesMut};

use super::{variable_int_len, write_lp16, write_lp8, write_variable_int, MAX_VARINT};
use crate::protocol::{
    capabilities, Auth, Connect, EncodeError, ErrorFrame, Frame, HeaderBlock, Info, Msg, Publish,
    Subscribe,
};

/// Ocypode Frame Encoder
#[derive(Debug, Clone)]
pub struct Encoder {
    /// Largest payload this encoder will write in PUB / MSG
    max_payload: u32,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            max_payload: MAX_VARINT,
        }
    }

    pub fn with_max_payload(mut self, max_payload: u32) -> Self {
        self.max_payload = max_payload.min(MAX_VARINT);
        self
    }

    /// Encode a frame to the buffer
    pub fn encode(&self, frame: &Frame, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let body_len = self.body_len(frame)?;
        if body_len > MAX_VARINT as usize {
            return Err(EncodeError::VarintOverflow(body_len as u64));
        }

        let start = buf.len();
        buf.reserve(1 + variable_int_len(body_len as u32) + body_len);
        buf.put_u8(((frame.command() as u8) << 4) | frame.flags());
        write_variable_int(buf, body_len as u32)?;

        // An oversized field leaves no partial frame behind
        let result = self.encode_body(frame, buf);
        if result.is_err() {
            buf.truncate(start);
        }
        result
    }

    fn encode_body(&self, frame: &Frame, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match frame {
            Frame::Info(info) => encode_info(info, buf),
            Frame::Connect(connect) => encode_connect(connect, buf),
            Frame::Pub(publish) => encode_publish(publish, buf),
            Frame::Sub(subscribe) => encode_subscribe(subscribe, buf),
            Frame::Unsub(unsub) => write_lp16(buf, &unsub.subscription_id, "subscription id"),
            Frame::Msg(msg) => encode_msg(msg, buf),
            Frame::Ping | Frame::Pong | Frame::Ok => Ok(()),
            Frame::Err(err) => encode_err(err, buf),
        }
    }

    /// Encode a frame into a fresh buffer
    pub fn encode_to_bytes(&self, frame: &Frame) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::new();
        self.encode(frame, &mut buf)?;
        Ok(buf.freeze())
    }

    fn body_len(&self, frame: &Frame) -> Result<usize, EncodeError> {
        let len = match frame {
            // version + max_payload + capabilities
            Frame::Info(info) => 1 + 4 + 1 + lp8_len(&info.server_id) + lp8_len(&info.server_name),
            Frame::Connect(connect) => {
                let mut len = 1;
                if let Some(auth) = &connect.auth {
                    let auth_len = auth_payload_len(auth);
                    len += 1 + variable_int_len(auth_len as u32) + auth_len;
                }
                len
            }
            Frame::Pub(p) => {
                lp16_len(&p.topic)
                    + p.reply_to.as_ref().map_or(0, lp16_len)
                    + p.header.as_ref().map_or(0, header_len)
                    + self.payload_len(&p.payload)?
            }
            Frame::Sub(s) => {
                lp16_len(&s.topic)
                    + lp16_len(&s.subscription_id)
                    + s.queue_group.as_ref().map_or(0, lp8_len)
            }
            Frame::Unsub(u) => lp16_len(&u.subscription_id),
            Frame::Msg(m) => {
                lp16_len(&m.topic)
                    + lp16_len(&m.subscription_id)
                    + m.reply_to.as_ref().map_or(0, lp16_len)
                    + m.header.as_ref().map_or(0, header_len)
                    + self.payload_len(&m.payload)?
            }
            Frame::Ping | Frame::Pong | Frame::Ok => 0,
            Frame::Err(e) => 1 + lp16_len(&e.message),
        };
        Ok(len)
    }

    fn payload_len(&self, payload: &Bytes) -> Result<usize, EncodeError> {
        if payload.len() > self.max_payload as usize {
            return Err(EncodeError::PayloadTooLarge);
        }
        Ok(variable_int_len(payload.len() as u32) + payload.len())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn lp8_len(data: &Bytes) -> usize {
    1 + data.len()
}

#[inline]
fn lp16_len(data: &Bytes) -> usize {
    2 + data.len()
}

#[inline]
fn header_len(header: &HeaderBlock) -> usize {
    2 + header.len()
}

fn auth_payload_len(auth: &Auth) -> usize {
    match auth {
        Auth::Password { username, password } => lp8_len(username) + lp8_len(password),
        Auth::Jwt { token } => lp16_len(token),
    }
}

fn encode_info(info: &Info, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(info.version);
    buf.put_u32(info.max_payload);
    write_lp8(buf, &info.server_id, "server id")?;
    write_lp8(buf, &info.server_name, "server name")?;

    let mut caps = 0;
    if info.auth_required {
        caps |= capabilities::AUTH_REQUIRED;
    }
    if info.headers_supported {
        caps |= capabilities::HEADERS;
    }
    buf.put_u8(caps);
    Ok(())
}

fn encode_connect(connect: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(connect.version);

    if let Some(auth) = &connect.auth {
        buf.put_u8(auth.auth_type());
        write_variable_int(buf, auth_payload_len(auth) as u32)?;
        match auth {
            Auth::Password { username, password } => {
                write_lp8(buf, username, "username")?;
                write_lp8(buf, password, "password")?;
            }
            Auth::Jwt { token } => write_lp16(buf, token, "token")?,
        }
    }
    Ok(())
}

fn encode_publish(publish: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
    write_lp16(buf, &publish.topic, "topic")?;
    if let Some(reply_to) = &publish.reply_to {
        write_lp16(buf, reply_to, "reply-to")?;
    }
    if let Some(header) = &publish.header {
        write_lp16(buf, header.as_bytes(), "header block")?;
    }
    write_payload(buf, &publish.payload)
}

fn encode_subscribe(subscribe: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    write_lp16(buf, &subscribe.topic, "topic")?;
    write_lp16(buf, &subscribe.subscription_id, "subscription id")?;
    if let Some(group) = &subscribe.queue_group {
        write_lp8(buf, group, "queue group")?;
    }
    Ok(())
}

fn encode_msg(msg: &Msg, buf: &mut BytesMut) -> Result<(), EncodeError> {
    write_lp16(buf, &msg.topic, "topic")?;
    write_lp16(buf, &msg.subscription_id, "subscription id")?;
    if let Some(reply_to) = &msg.reply_to {
        write_lp16(buf, reply_to, "reply-to")?;
    }
    if let Some(header) = &msg.header {
        write_lp16(buf, header.as_bytes(), "header block")?;
    }
    write_payload(buf, &msg.payload)
}

fn encode_err(err: &ErrorFrame, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(err.code as u8);
    write_lp16(buf, &err.message, "error message")
}

#[inline]
fn write_payload(buf: &mut BytesMut, payload: &Bytes) -> Result<(), EncodeError> {
    write_variable_int(buf, payload.len() as u32)?;
    buf.put_slice(payload);
    Ok(())
}
