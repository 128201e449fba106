//! SHA-256 hashing.
//!
//! This implementation uses the `sha2` crate to generate SHA-256 digests.
//!
//! # Example
//! ```rust
//! use halcyon_cryptography::sha256::Sha256;
//!
//! let mut hasher = Sha256::new();
//! hasher.update(b"hello,");
//! hasher.update(b"world!");
//! let digest = hasher.finalize();
//! assert_eq!(digest, halcyon_cryptography::sha256::hash(b"hello,world!"));
//! ```

use crate::utils::hex;
use bytes::{Buf, BufMut};
use halcyon_codec::{Error as CodecError, FixedSize, Read, ReadExt, Write};
use sha2::{Digest as _, Sha256 as ISha256};
use std::{
    fmt::{Debug, Display},
    ops::Deref,
};

/// Length of a SHA-256 digest.
pub const DIGEST_LENGTH: usize = 32;

/// Generate a SHA-256 digest from a message.
pub fn hash(message: &[u8]) -> Digest {
    let array: [u8; DIGEST_LENGTH] = ISha256::digest(message).into();
    Digest(array)
}

/// Incremental SHA-256 hasher.
#[derive(Debug, Default)]
pub struct Sha256 {
    hasher: ISha256,
}

impl Sha256 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, message: &[u8]) {
        self.hasher.update(message);
    }

    /// Returns the digest of everything written so far and resets the hasher.
    pub fn finalize(&mut self) -> Digest {
        let array: [u8; DIGEST_LENGTH] = self.hasher.finalize_reset().into();
        Digest(array)
    }
}

/// Digest of a SHA-256 hashing operation.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Digest([u8; DIGEST_LENGTH]);

impl Digest {
    pub const fn new(value: [u8; DIGEST_LENGTH]) -> Self {
        Self(value)
    }

    /// Returns true if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; DIGEST_LENGTH]
    }
}

impl Write for Digest {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.write(buf);
    }
}

impl Read for Digest {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self(<[u8; DIGEST_LENGTH]>::read(buf)?))
    }
}

impl FixedSize for Digest {
    const SIZE: usize = DIGEST_LENGTH;
}

impl From<[u8; DIGEST_LENGTH]> for Digest {
    fn from(value: [u8; DIGEST_LENGTH]) -> Self {
        Self(value)
    }
}

impl From<Digest> for [u8; DIGEST_LENGTH] {
    fn from(value: Digest) -> Self {
        value.0
    }
}

impl TryFrom<&[u8]> for Digest {
    type Error = crate::Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let array: [u8; DIGEST_LENGTH] = value
            .try_into()
            .map_err(|_| crate::Error::InvalidLength(DIGEST_LENGTH, value.len()))?;
        Ok(Self(array))
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Digest {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.0))
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halcyon_codec::{DecodeExt, Encode};

    const HELLO_DIGEST: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_sha256() {
        let mut hasher = Sha256::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        let digest = hasher.finalize();
        assert_eq!(hex(&digest), HELLO_DIGEST);

        // Finalize resets the hasher
        hasher.update(b"hello world");
        assert_eq!(hasher.finalize(), digest);
        assert_eq!(hash(b"hello world"), digest);
    }

    #[test]
    fn test_digest_codec() {
        let digest = hash(b"hello world");
        let encoded = digest.encode();
        assert_eq!(encoded.len(), DIGEST_LENGTH);
        assert_eq!(Digest::decode(encoded).unwrap(), digest);
    }

    #[test]
    fn test_digest_try_from() {
        assert!(Digest::try_from(&[0u8; 31][..]).is_err());
        assert!(Digest::try_from(&[0u8; 32][..]).unwrap().is_zero());
    }
}
