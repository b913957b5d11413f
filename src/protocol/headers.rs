//! Header block
//!
//! A header block is a run of `key (lp8) | value (lp16)` entries. The broker
//! forwards blocks opaquely; this type only guarantees the entries are well
//! formed and offers a borrowed iterator over them.

use bytes::{BufMut, Bytes, BytesMut};

use super::{DecodeError, EncodeError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    raw: Bytes,
}

impl HeaderBlock {
    /// Wrap raw header bytes after checking every entry is complete
    pub fn from_raw(raw: Bytes) -> Result<Self, DecodeError> {
        let mut entries = HeaderEntries { raw: &raw, pos: 0 };
        while entries.pos < raw.len() {
            if entries.next_entry().is_none() {
                return Err(DecodeError::FrameLengthMismatch);
            }
        }
        Ok(Self { raw })
    }

    /// Build a block from key/value pairs
    pub fn from_entries<I, K, V>(entries: I) -> Result<Self, EncodeError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut buf = BytesMut::new();
        for (key, value) in entries {
            let key = key.as_ref();
            let value = value.as_ref();
            if key.len() > u8::MAX as usize {
                return Err(EncodeError::FieldTooLong("header key"));
            }
            if value.len() > u16::MAX as usize {
                return Err(EncodeError::FieldTooLong("header value"));
            }
            buf.put_u8(key.len() as u8);
            buf.put_slice(key);
            buf.put_u16(value.len() as u16);
            buf.put_slice(value);
        }
        if buf.len() > u16::MAX as usize {
            return Err(EncodeError::FieldTooLong("header block"));
        }
        Ok(Self { raw: buf.freeze() })
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }

    /// Encoded size in bytes
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn entries(&self) -> HeaderEntries<'_> {
        HeaderEntries {
            raw: &self.raw,
            pos: 0,
        }
    }

    /// First value stored under `key`
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries().find(|(k, _)| *k == key).map(|(_, v)| v)
    }
}

/// Iterator over `(key, value)` pairs of a header block
pub struct HeaderEntries<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> HeaderEntries<'a> {
    fn next_entry(&mut self) -> Option<(&'a [u8], &'a [u8])> {
        let raw = self.raw;
        let key_len = *raw.get(self.pos)? as usize;
        let key_start = self.pos + 1;
        let key = raw.get(key_start..key_start + key_len)?;
        let len_pos = key_start + key_len;
        let len_bytes = raw.get(len_pos..len_pos + 2)?;
        let value_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        let value_start = len_pos + 2;
        let value = raw.get(value_start..value_start + value_len)?;
        self.pos = value_start + value_len;
        Some((key, value))
    }
}

impl<'a> Iterator for HeaderEntries<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.raw.len() {
            return None;
        }
        self.next_entry()
    }
}
