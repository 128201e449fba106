//! Codec implementations for Rust primitive types.
//!
//! All fixed-size integers are written big-endian to avoid host-endian ambiguity.

use crate::{util::at_least, Error, FixedSize, Read, ReadExt, Write};
use bytes::{Buf, BufMut};

macro_rules! impl_numeric {
    ($type:ty, $read_method:ident, $write_method:ident) => {
        impl Write for $type {
            #[inline]
            fn write(&self, buf: &mut impl BufMut) {
                buf.$write_method(*self);
            }
        }

        impl Read for $type {
            type Cfg = ();

            #[inline]
            fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
                at_least(buf, std::mem::size_of::<$type>())?;
                Ok(buf.$read_method())
            }
        }

        impl FixedSize for $type {
            const SIZE: usize = std::mem::size_of::<$type>();
        }
    };
}

impl_numeric!(u8, get_u8, put_u8);
impl_numeric!(u16, get_u16, put_u16);
impl_numeric!(u32, get_u32, put_u32);
impl_numeric!(u64, get_u64, put_u64);
impl_numeric!(i8, get_i8, put_i8);
impl_numeric!(i16, get_i16, put_i16);
impl_numeric!(i32, get_i32, put_i32);
impl_numeric!(i64, get_i64, put_i64);

impl Write for bool {
    #[inline]
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(u8::from(*self));
    }
}

impl Read for bool {
    type Cfg = ();

    #[inline]
    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        match u8::read(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::InvalidBool),
        }
    }
}

impl FixedSize for bool {
    const SIZE: usize = 1;
}

impl<const N: usize> Write for [u8; N] {
    #[inline]
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self[..]);
    }
}

impl<const N: usize> Read for [u8; N] {
    type Cfg = ();

    #[inline]
    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        at_least(buf, N)?;
        let mut dst = [0; N];
        buf.copy_to_slice(&mut dst);
        Ok(dst)
    }
}

impl<const N: usize> FixedSize for [u8; N] {
    const SIZE: usize = N;
}

#[cfg(test)]
mod tests {
    use crate::{DecodeExt, Encode, Error};
    use bytes::Bytes;

    #[test]
    fn test_integers_big_endian() {
        assert_eq!(&0x0102u16.encode()[..], &[0x01, 0x02]);
        assert_eq!(&(-1i32).encode()[..], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(u64::decode(0x0A0Bu64.encode()).unwrap(), 0x0A0B);
        assert_eq!(i64::decode((-42i64).encode()).unwrap(), -42);
    }

    #[test]
    fn test_bool() {
        assert!(bool::decode(true.encode()).unwrap());
        assert!(!bool::decode(false.encode()).unwrap());
        assert!(matches!(
            bool::decode(Bytes::from_static(&[2])),
            Err(Error::InvalidBool)
        ));
    }

    #[test]
    fn test_array() {
        let value = [7u8; 20];
        assert_eq!(<[u8; 20]>::decode(value.encode()).unwrap(), value);
        assert!(matches!(
            <[u8; 20]>::decode(Bytes::from_static(&[0; 19])),
            Err(Error::EndOfBuffer)
        ));
    }
}
