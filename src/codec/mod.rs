//! Ocypode Frame Codec
//!
//! Streaming decoder and encoder for the ten protocol commands, plus the
//! varint and length-prefixed field helpers they share.

mod decode;
mod encode;

#[cfg(test)]
mod tests;

pub use decode::{Decoder, Direction};
pub use encode::Encoder;

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::{Command, DecodeError, EncodeError};

/// Largest value a four-byte varint can carry
pub const MAX_VARINT: u32 = 268_435_455;

/// Varints never use more than this many bytes
pub const MAX_VARINT_BYTES: usize = 4;

/// Upper bound on the non-payload part of a frame body: four lp16 fields
/// (topic, subscription id, reply-to, header block) and the payload size varint
pub const FRAME_OVERHEAD: usize = 4 * (2 + u16::MAX as usize) + MAX_VARINT_BYTES;

/// Parsed first byte and remaining length of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub command: Command,
    pub flags: u8,
    pub remaining_length: u32,
}

/// Read a varint from the start of `buf`.
/// Returns (value, bytes_consumed) or error
#[inline]
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut value: u32 = 0;

    for pos in 0..MAX_VARINT_BYTES {
        let Some(&byte) = buf.get(pos) else {
            return Err(DecodeError::InsufficientData);
        };
        value |= ((byte & 0x7F) as u32) << (7 * pos);

        if byte & 0x80 == 0 {
            // A zero terminal byte after the first means the value fit in
            // fewer bytes
            if pos > 0 && byte == 0 {
                return Err(DecodeError::MalformedVarint);
            }
            return Ok((value, pos + 1));
        }
    }

    // Fourth byte still had its continuation bit set
    Err(DecodeError::MalformedVarint)
}

/// Write a varint using the minimal number of bytes.
/// Returns bytes written
#[inline]
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<usize, EncodeError> {
    if value > MAX_VARINT {
        return Err(EncodeError::VarintOverflow(value as u64));
    }

    let mut count = 0;
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        count += 1;
        if value == 0 {
            break;
        }
    }
    Ok(count)
}

/// Calculate the number of bytes needed to encode a varint
#[inline]
pub fn variable_int_len(value: u32) -> usize {
    if value < 128 {
        1
    } else if value < 16_384 {
        2
    } else if value < 2_097_152 {
        3
    } else {
        4
    }
}

/// Zero-copy cursor over a complete frame body.
///
/// Running past the end of the body is always a length mismatch: the fixed
/// header already promised this many bytes.
pub(crate) struct BodyReader {
    body: Bytes,
    pos: usize,
}

impl BodyReader {
    pub(crate) fn new(body: Bytes) -> Self {
        Self { body, pos: 0 }
    }

    #[inline]
    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self
            .body
            .get(self.pos)
            .ok_or(DecodeError::FrameLengthMismatch)?;
        self.pos += 1;
        Ok(byte)
    }

    #[inline]
    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    #[inline]
    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    #[inline]
    pub(crate) fn varint(&mut self) -> Result<u32, DecodeError> {
        match read_variable_int(&self.body[self.pos..]) {
            Ok((value, len)) => {
                self.pos += len;
                Ok(value)
            }
            Err(DecodeError::InsufficientData) => Err(DecodeError::FrameLengthMismatch),
            Err(e) => Err(e),
        }
    }

    /// Slice `len` bytes out of the body without copying
    #[inline]
    pub(crate) fn bytes(&mut self, len: usize) -> Result<Bytes, DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.body.len())
            .ok_or(DecodeError::FrameLengthMismatch)?;
        let slice = self.body.slice(self.pos..end);
        self.pos = end;
        Ok(slice)
    }

    #[inline]
    pub(crate) fn lp8(&mut self) -> Result<Bytes, DecodeError> {
        let len = self.u8()? as usize;
        self.bytes(len)
    }

    #[inline]
    pub(crate) fn lp16(&mut self) -> Result<Bytes, DecodeError> {
        let len = self.u16()? as usize;
        self.bytes(len)
    }

    pub(crate) fn remaining(&self) -> usize {
        self.body.len() - self.pos
    }

    /// Every body byte must be accounted for
    pub(crate) fn finish(self) -> Result<(), DecodeError> {
        if self.pos != self.body.len() {
            return Err(DecodeError::FrameLengthMismatch);
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&[u8], DecodeError> {
        let end = self.pos + len;
        if end > self.body.len() {
            return Err(DecodeError::FrameLengthMismatch);
        }
        let start = self.pos;
        self.pos = end;
        Ok(&self.body[start..end])
    }
}

/// Write a one-byte length prefixed field
#[inline]
pub(crate) fn write_lp8(
    buf: &mut BytesMut,
    data: &[u8],
    field: &'static str,
) -> Result<(), EncodeError> {
    if data.len() > u8::MAX as usize {
        return Err(EncodeError::FieldTooLong(field));
    }
    buf.put_u8(data.len() as u8);
    buf.put_slice(data);
    Ok(())
}

/// Write a two-byte length prefixed field
#[inline]
pub(crate) fn write_lp16(
    buf: &mut BytesMut,
    data: &[u8],
    field: &'static str,
) -> Result<(), EncodeError> {
    if data.len() > u16::MAX as usize {
        return Err(EncodeError::FieldTooLong(field));
    }
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
    Ok(())
}
