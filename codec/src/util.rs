//! Codec utility functions

use crate::Error;
use bytes::Buf;

/// Checks that the buffer has at least `len` bytes remaining.
#[inline]
pub fn at_least<B: Buf>(buf: &mut B, len: usize) -> Result<(), Error> {
    let rem = buf.remaining();
    if rem < len {
        return Err(Error::EndOfBuffer);
    }
    Ok(())
}

/// Reads a varint length prefix and checks it against `range`.
#[inline]
pub fn read_len<B: Buf>(buf: &mut B, range: &crate::RangeCfg) -> Result<usize, Error> {
    let len = crate::varint::read(buf)?;
    let len = usize::try_from(len).map_err(|_| Error::InvalidVarint)?;
    if !range.contains(len) {
        return Err(Error::InvalidLength(len));
    }
    Ok(len)
}
