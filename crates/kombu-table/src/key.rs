//! Versioned keys and value structs.
//!
//! A [`Key`] pairs a user key with a commit version. Ordering is
//! `user_key` ascending, then version **descending**, so that the newest
//! version of a user key is encountered first by forward iteration.

use std::cmp::Ordering;

use bytes::Bytes;

bitflags::bitflags! {
    /// Bits carried in [`ValueStruct::meta`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Meta: u8 {
        /// The record is a delete marker (tombstone).
        const DELETE = 0b0000_0001;
    }
}

/// Raw bit value of the tombstone flag.
pub const BIT_DELETE: u8 = Meta::DELETE.bits();

/// Returns true if `meta` carries the tombstone bit.
pub fn is_deleted(meta: u8) -> bool {
    meta & BIT_DELETE != 0
}

/// A user key plus its commit version.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct Key {
    pub user_key: Bytes,
    pub version: u64,
}

impl Key {
    pub fn new(user_key: impl Into<Bytes>, version: u64) -> Self {
        Self {
            user_key: user_key.into(),
            version,
        }
    }

    /// True when both keys refer to the same user key, regardless of version.
    pub fn same_user_key(&self, other: &Key) -> bool {
        self.user_key == other.user_key
    }

    /// An empty key is used as the "unset" sentinel by the compaction loop.
    pub fn is_empty(&self) -> bool {
        self.user_key.is_empty()
    }

    pub fn reset(&mut self) {
        self.user_key = Bytes::new();
        self.version = 0;
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.version.cmp(&self.version))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The value half of a record: metadata bits, user metadata, the value
/// payload, and the commit version it was written at.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValueStruct {
    pub meta: u8,
    pub user_meta: Bytes,
    pub value: Bytes,
    pub version: u64,
}

impl ValueStruct {
    pub fn new(value: impl Into<Bytes>, version: u64) -> Self {
        Self {
            meta: 0,
            user_meta: Bytes::new(),
            value: value.into(),
            version,
        }
    }

    /// A bare delete marker at `version`.
    pub fn tombstone(version: u64) -> Self {
        Self {
            meta: BIT_DELETE,
            user_meta: Bytes::new(),
            value: Bytes::new(),
            version,
        }
    }

    pub fn is_deleted(&self) -> bool {
        is_deleted(self.meta)
    }

    /// Approximate on-disk footprint, used for size accounting.
    pub fn encoded_size(&self) -> usize {
        1 + self.user_meta.len() + self.value.len() + 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_order_user_key_ascending() {
        let a = Key::new(&b"a"[..], 5);
        let b = Key::new(&b"b"[..], 5);
        assert!(a < b);
    }

    #[test]
    fn test_key_order_version_descending() {
        let newer = Key::new(&b"k"[..], 20);
        let older = Key::new(&b"k"[..], 10);
        // Newest version sorts first.
        assert!(newer < older);
    }

    #[test]
    fn test_same_user_key() {
        let a = Key::new(&b"k"[..], 1);
        let b = Key::new(&b"k"[..], 9);
        assert!(a.same_user_key(&b));
        assert!(!a.same_user_key(&Key::new(&b"x"[..], 1)));
    }

    #[test]
    fn test_tombstone_bit() {
        let v = ValueStruct::tombstone(3);
        assert!(v.is_deleted());
        assert!(is_deleted(v.meta));
        assert!(!is_deleted(0));
    }
}
