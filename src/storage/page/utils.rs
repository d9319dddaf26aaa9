//! Byte-level helpers shared by the page layouts and the WAL record codec.

use crate::storage::error::{StorageError, StorageResult};

/// Longest encoding of a 32-bit varint.
pub const MAX_VARINT_LEN: usize = 5;

fn zigzag(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

fn unzigzag(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

pub fn varint_u32_len(mut v: u32) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

pub fn write_varint_u32(mut v: u32, out: &mut [u8]) -> usize {
    let mut i = 0;
    while v >= 0x80 {
        out[i] = (v as u8) | 0x80;
        v >>= 7;
        i += 1;
    }
    out[i] = v as u8;
    i + 1
}

pub fn read_varint_u32(buf: &[u8]) -> Option<(u32, usize)> {
    let mut v: u32 = 0;
    let mut shift = 0;
    for (i, &b) in buf.iter().enumerate() {
        let chunk = u32::from(b & 0x7F);
        v |= chunk.checked_shl(shift)?;
        if (b & 0x80) == 0 {
            return Some((v, i + 1));
        }
        shift += 7;
        if shift > 28 {
            return None;
        }
    }
    None
}

/// Encode a tree value. Small magnitudes take fewer bytes.
pub fn serialize_value(value: i32) -> Vec<u8> {
    let mut out = [0u8; MAX_VARINT_LEN];
    let len = write_varint_u32(zigzag(value), &mut out);
    out[..len].to_vec()
}

/// Decode a tree value, returning it with the number of bytes consumed.
pub fn deserialize_value(buf: &[u8]) -> StorageResult<(i32, usize)> {
    read_varint_u32(buf)
        .map(|(raw, len)| (unzigzag(raw), len))
        .ok_or_else(|| StorageError::MalformedPage("truncated value encoding".to_string()))
}

/// Number of bytes taken by the encoded value starting at `buf[0]`.
pub fn value_len(buf: &[u8]) -> StorageResult<usize> {
    deserialize_value(buf).map(|(_, len)| len)
}

pub fn serialized_value_len(value: i32) -> usize {
    varint_u32_len(zigzag(value))
}

/// Bounds-checked slice of `len` bytes at `offset`.
pub fn slice_at(buf: &[u8], offset: usize, len: usize) -> StorageResult<&[u8]> {
    buf.get(offset..offset + len).ok_or_else(|| {
        StorageError::MalformedPage(format!(
            "range {}..{} is outside of a {} byte buffer",
            offset,
            offset + len,
            buf.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_widths() {
        assert_eq!(serialize_value(0), vec![0]);
        assert_eq!(serialized_value_len(7), 1);
        assert_eq!(serialized_value_len(-1), 1);
        assert_eq!(serialized_value_len(63), 1);
        assert_eq!(serialized_value_len(64), 2);
        assert_eq!(serialized_value_len(100_000), 3);
        assert_eq!(serialized_value_len(i32::MAX), 5);
        assert_eq!(serialized_value_len(i32::MIN), 5);
    }

    #[test]
    fn test_value_decoding() -> StorageResult<()> {
        for value in [0, 1, -1, 7, 9, 300, -300, i32::MAX, i32::MIN] {
            let bytes = serialize_value(value);
            let (decoded, len) = deserialize_value(&bytes)?;
            assert_eq!(decoded, value);
            assert_eq!(len, bytes.len());
        }
        Ok(())
    }

    #[test]
    fn test_value_ignores_trailing_bytes() -> StorageResult<()> {
        let mut bytes = serialize_value(1234);
        let len = bytes.len();
        bytes.extend_from_slice(&[0xFF, 0xFF]);
        assert_eq!(value_len(&bytes)?, len);
        Ok(())
    }

    #[test]
    fn test_truncated_varint() {
        assert!(deserialize_value(&[0x80, 0x80]).is_err());
        assert!(deserialize_value(&[]).is_err());
    }

    #[test]
    fn test_slice_at_bounds() {
        let buf = [1u8, 2, 3, 4];
        assert_eq!(slice_at(&buf, 1, 2).unwrap(), &[2, 3]);
        assert!(slice_at(&buf, 3, 2).is_err());
    }
}
