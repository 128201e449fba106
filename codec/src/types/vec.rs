//! Codec implementation for [`Vec`].

use crate::{util::read_len, varint, EncodeSize, Error, RangeCfg, Read, Write};
use bytes::{Buf, BufMut};

impl<T: Write> Write for Vec<T> {
    #[inline]
    fn write(&self, buf: &mut impl BufMut) {
        let len = u32::try_from(self.len()).expect("Vec length exceeds u32");
        varint::write(len as u64, buf);
        for item in self {
            item.write(buf);
        }
    }
}

impl<T: EncodeSize> EncodeSize for Vec<T> {
    #[inline]
    fn encode_size(&self) -> usize {
        varint::size(self.len() as u64) + self.iter().map(EncodeSize::encode_size).sum::<usize>()
    }
}

impl<T: Read> Read for Vec<T> {
    type Cfg = (RangeCfg, T::Cfg);

    #[inline]
    fn read_cfg(buf: &mut impl Buf, (range, cfg): &Self::Cfg) -> Result<Self, Error> {
        let len = read_len(buf, range)?;

        // Cap the preallocation by what the buffer could possibly hold.
        let mut vec = Vec::with_capacity(len.min(buf.remaining()));
        for _ in 0..len {
            vec.push(T::read_cfg(buf, cfg)?);
        }
        Ok(vec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Decode, Encode};

    #[test]
    fn test_vec() {
        let vec_values = [vec![], vec![1u8], vec![1u8, 2u8, 3u8]];
        for value in vec_values {
            let encoded = value.encode();
            assert_eq!(encoded.len(), value.len() + 1);

            let len = value.len();
            let decoded = Vec::<u8>::decode_cfg(encoded, &((len..=len).into(), ())).unwrap();
            assert_eq!(value, decoded);

            assert!(matches!(
                Vec::<u8>::decode_cfg(value.encode(), &((len + 1..).into(), ())),
                Err(Error::InvalidLength(_))
            ));
        }
    }

    #[test]
    fn test_vec_truncated() {
        let value = vec![1u32, 2, 3];
        let mut encoded = value.encode();
        encoded.truncate(encoded.len() - 1);
        assert!(matches!(
            Vec::<u32>::decode_cfg(encoded, &((..).into(), ())),
            Err(Error::EndOfBuffer)
        ));
    }
}
