use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;
use std::fmt;

use crate::storage::error::StorageResult;
use crate::storage::page::utils::slice_at;

/// Composite key of the tree: ordered by `group_id`, then by `position`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeKey {
    pub group_id: i32,
    pub position: i64,
}

impl EdgeKey {
    /// Keys have a fixed encoding: `group_id` (4 bytes) then `position` (8 bytes).
    pub const SERIALIZED_SIZE: usize = 12;

    pub fn new(group_id: i32, position: i64) -> Self {
        Self { group_id, position }
    }

    pub fn serialize(&self) -> [u8; Self::SERIALIZED_SIZE] {
        let mut out = [0u8; Self::SERIALIZED_SIZE];
        self.write_to(&mut out);
        out
    }

    pub fn write_to(&self, out: &mut [u8]) {
        LittleEndian::write_i32(&mut out[0..4], self.group_id);
        LittleEndian::write_i64(&mut out[4..12], self.position);
    }

    pub fn deserialize(buf: &[u8]) -> StorageResult<Self> {
        let bytes = slice_at(buf, 0, Self::SERIALIZED_SIZE)?;
        Ok(Self {
            group_id: LittleEndian::read_i32(&bytes[0..4]),
            position: LittleEndian::read_i64(&bytes[4..12]),
        })
    }
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.group_id, self.position)
    }
}

/// A position in the key space, including the two open ends.
///
/// `AlwaysLess` sorts before every key and `AlwaysGreater` after every key,
/// so range scans can use them as bounds. They are never stored in a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyBound {
    AlwaysLess,
    Key(EdgeKey),
    AlwaysGreater,
}

impl KeyBound {
    /// Compare this bound with a stored key.
    pub fn compare_key(&self, key: &EdgeKey) -> Ordering {
        match self {
            KeyBound::AlwaysLess => Ordering::Less,
            KeyBound::Key(own) => own.cmp(key),
            KeyBound::AlwaysGreater => Ordering::Greater,
        }
    }

    pub fn key(&self) -> Option<&EdgeKey> {
        match self {
            KeyBound::Key(key) => Some(key),
            _ => None,
        }
    }
}

impl From<EdgeKey> for KeyBound {
    fn from(key: EdgeKey) -> Self {
        KeyBound::Key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_then_position_ordering() {
        let a = EdgeKey::new(1, 500);
        let b = EdgeKey::new(2, 0);
        let c = EdgeKey::new(2, 1);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.cmp(&a), Ordering::Equal);
        assert!(EdgeKey::new(-5, i64::MAX) < EdgeKey::new(-4, i64::MIN));
    }

    #[test]
    fn test_sentinels_bound_every_key() {
        let keys = [
            EdgeKey::new(i32::MIN, i64::MIN),
            EdgeKey::new(0, 0),
            EdgeKey::new(i32::MAX, i64::MAX),
        ];
        for key in keys {
            assert_eq!(KeyBound::AlwaysLess.compare_key(&key), Ordering::Less);
            assert_eq!(KeyBound::AlwaysGreater.compare_key(&key), Ordering::Greater);
            assert!(KeyBound::AlwaysLess < KeyBound::Key(key));
            assert!(KeyBound::Key(key) < KeyBound::AlwaysGreater);
        }
        assert!(KeyBound::AlwaysLess < KeyBound::AlwaysGreater);
        assert_eq!(KeyBound::AlwaysLess, KeyBound::AlwaysLess);
    }

    #[test]
    fn test_key_bound_compare() {
        let bound = KeyBound::from(EdgeKey::new(3, 3));
        assert_eq!(bound.compare_key(&EdgeKey::new(3, 3)), Ordering::Equal);
        assert_eq!(bound.compare_key(&EdgeKey::new(3, 4)), Ordering::Less);
        assert_eq!(bound.key(), Some(&EdgeKey::new(3, 3)));
        assert_eq!(KeyBound::AlwaysGreater.key(), None);
    }

    #[test]
    fn test_serialization() -> StorageResult<()> {
        let key = EdgeKey::new(-17, 1 << 40);
        let bytes = key.serialize();
        assert_eq!(bytes.len(), EdgeKey::SERIALIZED_SIZE);
        assert_eq!(EdgeKey::deserialize(&bytes)?, key);
        assert!(EdgeKey::deserialize(&bytes[..5]).is_err());
        Ok(())
    }
}
