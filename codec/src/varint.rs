//! Variable-length integer encoding and decoding
//!
//! This module implements Google's Protocol Buffers variable-length integer encoding for
//! `u64`. Each byte uses:
//! - 7 bits for the value
//! - 1 "continuation" bit to indicate if more bytes follow

use crate::Error;
use bytes::{Buf, BufMut};

const DATA_BITS_PER_BYTE: usize = 7;
const DATA_BITS_MASK: u8 = 0x7F;
const CONTINUATION_BIT_MASK: u8 = 0x80;
const MAX_BYTES: usize = 10;

/// Encodes a `u64` as a varint.
pub fn write(value: u64, buf: &mut impl BufMut) {
    let mut val = value;
    while val >= CONTINUATION_BIT_MASK as u64 {
        buf.put_u8((val as u8) | CONTINUATION_BIT_MASK);
        val >>= DATA_BITS_PER_BYTE;
    }
    buf.put_u8(val as u8);
}

/// Decodes a `u64` from a varint.
///
/// Rejects overlong encodings and values that overflow 64 bits.
pub fn read(buf: &mut impl Buf) -> Result<u64, Error> {
    let mut result = 0u64;
    for i in 0..MAX_BYTES {
        if !buf.has_remaining() {
            return Err(Error::EndOfBuffer);
        }
        let byte = buf.get_u8();

        // The tenth byte may only carry the single remaining bit.
        if i == MAX_BYTES - 1 && byte > 1 {
            return Err(Error::InvalidVarint);
        }
        result |= ((byte & DATA_BITS_MASK) as u64) << (i * DATA_BITS_PER_BYTE);
        if byte & CONTINUATION_BIT_MASK == 0 {
            // A trailing zero byte means a shorter encoding existed.
            if i > 0 && byte == 0 {
                return Err(Error::InvalidVarint);
            }
            return Ok(result);
        }
    }
    Err(Error::InvalidVarint)
}

/// Calculates the number of bytes needed to encode a `u64` as a varint.
pub fn size(value: u64) -> usize {
    let data_bits = 64 - value.leading_zeros() as usize;
    usize::max(1, data_bits.div_ceil(DATA_BITS_PER_BYTE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};

    #[test]
    fn test_varint_boundaries() {
        for value in [0u64, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            write(value, &mut buf);
            assert_eq!(buf.len(), size(value));
            let decoded = read(&mut buf.freeze()).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn test_varint_overlong() {
        let mut buf = Bytes::from_static(&[0x80, 0x00]);
        assert!(matches!(read(&mut buf), Err(Error::InvalidVarint)));
    }

    #[test]
    fn test_varint_overflow() {
        let mut buf = Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x02]);
        assert!(matches!(read(&mut buf), Err(Error::InvalidVarint)));
    }

    #[test]
    fn test_varint_truncated() {
        let mut buf = Bytes::from_static(&[0x80]);
        assert!(matches!(read(&mut buf), Err(Error::EndOfBuffer)));
    }
}
