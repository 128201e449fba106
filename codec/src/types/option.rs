//! Codec implementation for [`Option`].

use crate::{EncodeSize, Error, Read, ReadExt, Write};
use bytes::{Buf, BufMut};

impl<T: Write> Write for Option<T> {
    #[inline]
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Some(inner) => {
                true.write(buf);
                inner.write(buf);
            }
            None => false.write(buf),
        }
    }
}

impl<T: EncodeSize> EncodeSize for Option<T> {
    #[inline]
    fn encode_size(&self) -> usize {
        1 + self.as_ref().map_or(0, EncodeSize::encode_size)
    }
}

impl<T: Read> Read for Option<T> {
    type Cfg = T::Cfg;

    #[inline]
    fn read_cfg(buf: &mut impl Buf, cfg: &Self::Cfg) -> Result<Self, Error> {
        if bool::read(buf)? {
            Ok(Some(T::read_cfg(buf, cfg)?))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Decode, Encode};

    #[test]
    fn test_option() {
        let some = Some(9u16);
        assert_eq!(some.encode().len(), 3);
        assert_eq!(Option::<u16>::decode_cfg(some.encode(), &()).unwrap(), some);

        let none: Option<u16> = None;
        assert_eq!(none.encode().len(), 1);
        assert_eq!(Option::<u16>::decode_cfg(none.encode(), &()).unwrap(), none);
    }
}
