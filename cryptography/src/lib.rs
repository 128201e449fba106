//! Generate keys, sign arbitrary messages, and deterministically verify signatures.
//!
//! Two signature schemes are supported behind the [PrivateKey] and [PublicKey] enums:
//! - [ed25519]: individually verified signatures
//! - [bls12381]: signatures that can be aggregated (see [PublicKey::is_aggregatable])
//!
//! Every key also acts as a verifiable random function ([vrf]).

use bytes::{Buf, BufMut, Bytes};
use halcyon_codec::{Error as CodecError, FixedSize, Read, ReadExt, Write, EncodeSize};
use rand::{rngs::StdRng, CryptoRng, RngCore, SeedableRng};
use std::fmt::{Debug, Display};
use thiserror::Error;

pub mod bls12381;
pub mod ed25519;
pub mod sha256;
pub mod utils;
pub mod vrf;

pub use sha256::{hash, Digest, Sha256};

/// Errors that can occur when interacting with cryptographic primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid length: expected {0}, got {1}")]
    InvalidLength(usize, usize),
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("nothing to aggregate")]
    EmptyAggregate,
}

/// Length of a validator [Address].
pub const ADDRESS_LENGTH: usize = 20;

/// Identifies the signature scheme of a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyType {
    Ed25519,
    Bls12381,
}

impl KeyType {
    fn tag(&self) -> u8 {
        match self {
            KeyType::Ed25519 => 0,
            KeyType::Bls12381 => 1,
        }
    }

    /// Stable name used in consensus parameters.
    pub fn name(&self) -> &'static str {
        match self {
            KeyType::Ed25519 => "ed25519",
            KeyType::Bls12381 => "bls12381",
        }
    }
}

impl Write for KeyType {
    fn write(&self, buf: &mut impl BufMut) {
        self.tag().write(buf);
    }
}

impl Read for KeyType {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => Ok(KeyType::Ed25519),
            1 => Ok(KeyType::Bls12381),
            tag => Err(CodecError::InvalidEnum("KeyType", tag)),
        }
    }
}

impl FixedSize for KeyType {
    const SIZE: usize = 1;
}

impl Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A private key of any supported scheme.
#[derive(Clone, PartialEq, Eq)]
pub enum PrivateKey {
    Ed25519(ed25519::PrivateKey),
    Bls12381(bls12381::PrivateKey),
}

impl PrivateKey {
    /// Create a fresh key using the supplied RNG.
    pub fn from_rng<R: RngCore + CryptoRng>(key_type: KeyType, rng: &mut R) -> Self {
        match key_type {
            KeyType::Ed25519 => Self::Ed25519(ed25519::PrivateKey::from_rng(rng)),
            KeyType::Bls12381 => Self::Bls12381(bls12381::PrivateKey::from_rng(rng)),
        }
    }

    /// Create a key from a seed.
    ///
    /// # Warning
    ///
    /// This function is insecure and should only be used for examples and testing.
    pub fn from_seed(key_type: KeyType, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::from_rng(key_type, &mut rng)
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            Self::Ed25519(_) => KeyType::Ed25519,
            Self::Bls12381(_) => KeyType::Bls12381,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            Self::Ed25519(key) => PublicKey::Ed25519(key.public_key()),
            Self::Bls12381(key) => PublicKey::Bls12381(key.public_key()),
        }
    }

    /// Sign a message. The message should not be hashed beforehand.
    pub fn sign(&self, message: &[u8]) -> Bytes {
        match self {
            Self::Ed25519(key) => Bytes::copy_from_slice(&key.sign(message)),
            Self::Bls12381(key) => Bytes::copy_from_slice(&key.sign(message)),
        }
    }

    /// Raw secret bytes (without the scheme tag).
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Ed25519(key) => key.to_bytes().to_vec(),
            Self::Bls12381(key) => key.to_bytes().to_vec(),
        }
    }

    /// Restores a key from its scheme and raw secret bytes.
    pub fn from_bytes(key_type: KeyType, raw: &[u8]) -> Result<Self, Error> {
        Ok(match key_type {
            KeyType::Ed25519 => Self::Ed25519(ed25519::PrivateKey::try_from(raw)?),
            KeyType::Bls12381 => Self::Bls12381(bls12381::PrivateKey::try_from(raw)?),
        })
    }
}

impl Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ed25519(key) => Debug::fmt(key, f),
            Self::Bls12381(key) => Debug::fmt(key, f),
        }
    }
}

/// A public key of any supported scheme.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PublicKey {
    Ed25519(ed25519::PublicKey),
    Bls12381(bls12381::PublicKey),
}

impl PublicKey {
    pub fn key_type(&self) -> KeyType {
        match self {
            Self::Ed25519(_) => KeyType::Ed25519,
            Self::Bls12381(_) => KeyType::Bls12381,
        }
    }

    /// Verify a signature over a message.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match self {
            Self::Ed25519(key) => key.verify(message, signature),
            Self::Bls12381(key) => key.verify(message, signature),
        }
    }

    /// Returns true if signatures from this key can be folded into an aggregate.
    pub fn is_aggregatable(&self) -> bool {
        matches!(self, Self::Bls12381(_))
    }

    /// Raw key bytes (without the scheme tag).
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Ed25519(key) => key.to_bytes().to_vec(),
            Self::Bls12381(key) => key.to_bytes().to_vec(),
        }
    }

    /// Address derived from the first 20 bytes of the SHA-256 of the raw key.
    pub fn address(&self) -> Address {
        let digest = sha256::hash(&self.to_bytes());
        let mut address = [0u8; ADDRESS_LENGTH];
        address.copy_from_slice(&digest[..ADDRESS_LENGTH]);
        Address(address)
    }
}

impl Write for PublicKey {
    fn write(&self, buf: &mut impl BufMut) {
        self.key_type().tag().write(buf);
        buf.put_slice(&self.to_bytes());
    }
}

impl EncodeSize for PublicKey {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::Ed25519(_) => ed25519::PUBLIC_KEY_LENGTH,
            Self::Bls12381(_) => bls12381::PUBLIC_KEY_LENGTH,
        }
    }
}

impl Read for PublicKey {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => {
                let raw = <[u8; ed25519::PUBLIC_KEY_LENGTH]>::read(buf)?;
                ed25519::PublicKey::try_from(&raw[..])
                    .map(Self::Ed25519)
                    .map_err(|_| CodecError::Invalid("PublicKey", "invalid ed25519 key"))
            }
            1 => {
                let raw = <[u8; bls12381::PUBLIC_KEY_LENGTH]>::read(buf)?;
                bls12381::PublicKey::try_from(&raw[..])
                    .map(Self::Bls12381)
                    .map_err(|_| CodecError::Invalid("PublicKey", "invalid bls12381 key"))
            }
            tag => Err(CodecError::InvalidEnum("PublicKey", tag)),
        }
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.key_type(), utils::hex(&self.to_bytes()))
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Validator address.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Address([u8; ADDRESS_LENGTH]);

impl Address {
    pub const fn new(value: [u8; ADDRESS_LENGTH]) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Write for Address {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.write(buf);
    }
}

impl Read for Address {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self(<[u8; ADDRESS_LENGTH]>::read(buf)?))
    }
}

impl FixedSize for Address {
    const SIZE: usize = ADDRESS_LENGTH;
}

impl Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", utils::hex(&self.0))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", utils::hex(&self.0))
    }
}
