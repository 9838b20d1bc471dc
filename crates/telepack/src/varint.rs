//! # Unsigned Varints
//!
//! Little-endian base-128 encoding, seven bits per byte, high bit set on every
//! byte except the last. Byte-compatible with Go's `binary.PutUvarint`.

use crate::Error;
use crate::Result;

/// Longest encoding of a `u64`.
pub const MAX_LEN: usize = 10;

/// Appends `v` to `buf`.
pub fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Reads one varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed.
///
/// # Errors
/// - `Error::UnexpectedEnd` if `buf` ends mid-varint.
/// - `Error::VarintOverflow` if the value does not fit in 64 bits.
pub fn read_uvarint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate() {
        if i == MAX_LEN {
            return Err(Error::VarintOverflow);
        }
        if i == MAX_LEN - 1 && b > 1 {
            return Err(Error::VarintOverflow);
        }
        if b < 0x80 {
            return Ok((value | (u64::from(b) << shift), i + 1));
        }
        value |= u64::from(b & 0x7f) << shift;
        shift += 7;
    }
    Err(Error::UnexpectedEnd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(v: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        put_uvarint(&mut buf, v);
        buf
    }

    #[test]
    fn test_known_encodings() {
        assert_eq!(encode(0), vec![0x00]);
        assert_eq!(encode(1), vec![0x01]);
        assert_eq!(encode(127), vec![0x7f]);
        assert_eq!(encode(128), vec![0x80, 0x01]);
        assert_eq!(encode(300), vec![0xac, 0x02]);
        assert_eq!(encode(u64::MAX).len(), MAX_LEN);
    }

    #[test]
    fn test_read_reports_consumed_length() {
        let mut buf = encode(300);
        buf.extend_from_slice(b"tail");
        let (v, n) = read_uvarint(&buf).unwrap();
        assert_eq!(v, 300);
        assert_eq!(n, 2);
        assert_eq!(&buf[n..], b"tail");
    }

    #[test]
    fn test_max_value() {
        let buf = encode(u64::MAX);
        assert_eq!(read_uvarint(&buf).unwrap(), (u64::MAX, MAX_LEN));
    }

    #[test]
    fn test_truncated() {
        assert!(matches!(read_uvarint(&[]), Err(Error::UnexpectedEnd)));
        assert!(matches!(read_uvarint(&[0x80, 0x80]), Err(Error::UnexpectedEnd)));
    }

    #[test]
    fn test_overflow() {
        let mut buf = vec![0xff; 9];
        buf.push(0x02);
        assert!(matches!(read_uvarint(&buf), Err(Error::VarintOverflow)));

        let buf = vec![0x80; 11];
        assert!(matches!(read_uvarint(&buf), Err(Error::VarintOverflow)));
    }
}
