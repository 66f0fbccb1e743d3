//! Record framing.
//!
//! Frame layout, all varints LEB128:
//! - klen: varint
//! - vlen: varint
//! - umlen: varint
//! - meta: u8
//! - version: varint
//! - user_key: bytes[klen]
//! - user_meta: bytes[umlen]
//! - value: bytes[vlen]
//! - crc32c: u32 (little-endian, over everything above)

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, TableError};
use crate::key::{Key, ValueStruct};

/// One decoded record: a versioned key and its value struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Key,
    pub value: ValueStruct,
}

impl Entry {
    pub fn new(key: Key, value: ValueStruct) -> Self {
        Self { key, value }
    }

    /// Appends the encoded frame to `buf`, returning the frame length.
    pub fn encode(&self, buf: &mut BytesMut) -> usize {
        let start = buf.len();
        encode_varint(buf, self.key.user_key.len() as u64);
        encode_varint(buf, self.value.value.len() as u64);
        encode_varint(buf, self.value.user_meta.len() as u64);
        buf.put_u8(self.value.meta);
        encode_varint(buf, self.key.version);
        buf.put_slice(&self.key.user_key);
        buf.put_slice(&self.value.user_meta);
        buf.put_slice(&self.value.value);
        let crc = crc32c::crc32c(&buf[start..]);
        buf.put_u32_le(crc);
        buf.len() - start
    }

    /// Size of the encoded frame without building it.
    pub fn encoded_size(&self) -> usize {
        varint_size(self.key.user_key.len() as u64)
            + varint_size(self.value.value.len() as u64)
            + varint_size(self.value.user_meta.len() as u64)
            + 1
            + varint_size(self.key.version)
            + self.key.user_key.len()
            + self.value.user_meta.len()
            + self.value.value.len()
            + 4
    }

    /// Decodes one frame starting at `offset` in `data`.
    ///
    /// Key and value bytes are zero-copy slices of `data`. Returns the
    /// entry and the total frame length.
    pub fn decode_at(data: &Bytes, offset: usize) -> Result<(Entry, usize)> {
        let buf = &data[offset..];
        let mut pos = 0usize;
        let klen = decode_varint(buf, &mut pos)? as usize;
        let vlen = decode_varint(buf, &mut pos)? as usize;
        let umlen = decode_varint(buf, &mut pos)? as usize;
        if pos >= buf.len() {
            return Err(TableError::Incomplete);
        }
        let meta = buf[pos];
        pos += 1;
        let version = decode_varint(buf, &mut pos)?;
        if buf.len() < pos + klen + umlen + vlen + 4 {
            return Err(TableError::Incomplete);
        }
        let user_key = data.slice(offset + pos..offset + pos + klen);
        pos += klen;
        let user_meta = data.slice(offset + pos..offset + pos + umlen);
        pos += umlen;
        let value = data.slice(offset + pos..offset + pos + vlen);
        pos += vlen;

        let actual = crc32c::crc32c(&buf[..pos]);
        let expected = u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
        if expected != actual {
            return Err(TableError::CrcMismatch { expected, actual });
        }
        pos += 4;

        Ok((
            Entry {
                key: Key { user_key, version },
                value: ValueStruct {
                    meta,
                    user_meta,
                    value,
                    version,
                },
            },
            pos,
        ))
    }
}

fn encode_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn decode_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0;
    loop {
        if shift >= 64 {
            return Err(TableError::InvalidFormat("varint overflow".to_string()));
        }
        if *pos >= buf.len() {
            return Err(TableError::Incomplete);
        }
        let byte = buf[*pos];
        *pos += 1;
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn varint_size(value: u64) -> usize {
    if value == 0 {
        1
    } else {
        ((63 - value.leading_zeros()) / 7 + 1) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(entry: &Entry) -> Entry {
        let mut buf = BytesMut::new();
        let n = entry.encode(&mut buf);
        assert_eq!(n, entry.encoded_size());
        let data = buf.freeze();
        let (decoded, consumed) = Entry::decode_at(&data, 0).unwrap();
        assert_eq!(consumed, n);
        decoded
    }

    #[test]
    fn test_entry_roundtrip() {
        let entry = Entry::new(
            Key::new(&b"user-key"[..], 42),
            ValueStruct {
                meta: 0,
                user_meta: Bytes::from_static(b"um"),
                value: Bytes::from_static(b"payload"),
                version: 42,
            },
        );
        assert_eq!(roundtrip(&entry), entry);
    }

    #[test]
    fn test_tombstone_roundtrip() {
        let entry = Entry::new(Key::new(&b"k"[..], 7), ValueStruct::tombstone(7));
        let decoded = roundtrip(&entry);
        assert!(decoded.value.is_deleted());
        assert!(decoded.value.value.is_empty());
    }

    #[test]
    fn test_crc_detects_corruption() {
        let entry = Entry::new(Key::new(&b"key"[..], 1), ValueStruct::new(&b"value"[..], 1));
        let mut buf = BytesMut::new();
        entry.encode(&mut buf);
        buf[5] ^= 0xFF;
        let data = buf.freeze();
        assert!(matches!(
            Entry::decode_at(&data, 0),
            Err(TableError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_frame() {
        let entry = Entry::new(Key::new(&b"key"[..], 1), ValueStruct::new(&b"value"[..], 1));
        let mut buf = BytesMut::new();
        entry.encode(&mut buf);
        let data = buf.freeze().slice(..8);
        assert!(matches!(
            Entry::decode_at(&data, 0),
            Err(TableError::Incomplete)
        ));
    }
}
