//! Implementations of Codec for byte types.
//!
//! For portability and consistency between architectures, lengths are written as varints
//! and must fit within a [`u32`].

use crate::{
    util::{at_least, read_len},
    varint, EncodeSize, Error, RangeCfg, Read, Write,
};
use bytes::{Buf, BufMut, Bytes};

impl Write for Bytes {
    #[inline]
    fn write(&self, buf: &mut impl BufMut) {
        let len = u32::try_from(self.len()).expect("Bytes length exceeds u32");
        varint::write(len as u64, buf);
        buf.put_slice(self);
    }
}

impl EncodeSize for Bytes {
    #[inline]
    fn encode_size(&self) -> usize {
        varint::size(self.len() as u64) + self.len()
    }
}

impl Read for Bytes {
    type Cfg = RangeCfg;

    #[inline]
    fn read_cfg(buf: &mut impl Buf, range: &RangeCfg) -> Result<Self, Error> {
        let len = read_len(buf, range)?;
        at_least(buf, len)?;
        Ok(buf.copy_to_bytes(len))
    }
}

impl Write for String {
    #[inline]
    fn write(&self, buf: &mut impl BufMut) {
        let len = u32::try_from(self.len()).expect("String length exceeds u32");
        varint::write(len as u64, buf);
        buf.put_slice(self.as_bytes());
    }
}

impl EncodeSize for String {
    #[inline]
    fn encode_size(&self) -> usize {
        varint::size(self.len() as u64) + self.len()
    }
}

impl Read for String {
    type Cfg = RangeCfg;

    #[inline]
    fn read_cfg(buf: &mut impl Buf, range: &RangeCfg) -> Result<Self, Error> {
        let len = read_len(buf, range)?;
        at_least(buf, len)?;
        let mut raw = vec![0u8; len];
        buf.copy_to_slice(&mut raw);
        String::from_utf8(raw).map_err(|_| Error::Invalid("String", "invalid utf-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Decode, Encode};

    #[test]
    fn test_bytes() {
        let values = [
            Bytes::new(),
            Bytes::from_static(&[1, 2, 3]),
            Bytes::from(vec![0; 300]),
        ];
        for value in values {
            let encoded = value.encode();
            assert_eq!(encoded.len(), varint::size(value.len() as u64) + value.len());
            let len = value.len();

            let decoded = Bytes::decode_cfg(encoded, &(len..=len).into()).unwrap();
            assert_eq!(value, decoded);

            assert!(matches!(
                Bytes::decode_cfg(value.encode(), &(len + 1..).into()),
                Err(Error::InvalidLength(_))
            ));
        }
    }

    #[test]
    fn test_string() {
        let value = String::from("halcyon-chain");
        let decoded = String::decode_cfg(value.encode(), &(..=64).into()).unwrap();
        assert_eq!(value, decoded);

        let mut invalid = bytes::BytesMut::new();
        varint::write(2, &mut invalid);
        invalid.put_slice(&[0xC3, 0x28]);
        assert!(matches!(
            String::decode_cfg(invalid.freeze(), &(..).into()),
            Err(Error::Invalid("String", _))
        ));
    }
}
