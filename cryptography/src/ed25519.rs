//! Ed25519 keys and signatures.
//!
//! Signing and verification are performed by `ed25519-consensus`, which implements the
//! ZIP-215 validation rules so every node agrees on which signatures are valid.

use crate::{utils::hex, Error};
use ed25519_consensus::{Signature as ISignature, SigningKey, VerificationKey};
use rand::{CryptoRng, RngCore};
use std::fmt::{Debug, Display};

pub const PRIVATE_KEY_LENGTH: usize = 32;
pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const SIGNATURE_LENGTH: usize = 64;

/// Ed25519 private key.
#[derive(Clone)]
pub struct PrivateKey {
    key: SigningKey,
}

impl PrivateKey {
    /// Generates a fresh key from the supplied RNG.
    pub fn from_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            key: SigningKey::new(rng),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: self.key.verification_key(),
        }
    }

    /// Signs `message` (deterministic).
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.key.sign(message).to_bytes()
    }

    pub fn to_bytes(&self) -> [u8; PRIVATE_KEY_LENGTH] {
        self.key.to_bytes()
    }
}

impl TryFrom<&[u8]> for PrivateKey {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let raw: [u8; PRIVATE_KEY_LENGTH] = value
            .try_into()
            .map_err(|_| Error::InvalidLength(PRIVATE_KEY_LENGTH, value.len()))?;
        Ok(Self {
            key: SigningKey::from(raw),
        })
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.key.to_bytes() == other.key.to_bytes()
    }
}

impl Eq for PrivateKey {}

impl Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ed25519::PrivateKey({})", self.public_key())
    }
}

/// Ed25519 public key.
#[derive(Clone, Copy)]
pub struct PublicKey {
    key: VerificationKey,
}

impl PublicKey {
    /// Verifies `signature` over `message`, returning false on any malformed input.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(raw) = <[u8; SIGNATURE_LENGTH]>::try_from(signature) else {
            return false;
        };
        self.key.verify(&ISignature::from(raw), message).is_ok()
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.key.to_bytes()
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let raw: [u8; PUBLIC_KEY_LENGTH] = value
            .try_into()
            .map_err(|_| Error::InvalidLength(PUBLIC_KEY_LENGTH, value.len()))?;
        let key = VerificationKey::try_from(raw).map_err(|_| Error::InvalidPublicKey)?;
        Ok(Self { key })
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.key.to_bytes() == other.key.to_bytes()
    }
}

impl Eq for PublicKey {}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.to_bytes().hash(state);
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.to_bytes().cmp(&other.key.to_bytes())
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.to_bytes()))
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.to_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_sign_verify() {
        let mut rng = StdRng::seed_from_u64(0);
        let key = PrivateKey::from_rng(&mut rng);
        let public = key.public_key();
        let signature = key.sign(b"message");
        assert!(public.verify(b"message", &signature));
        assert!(!public.verify(b"other", &signature));
        assert!(!public.verify(b"message", &signature[..63]));

        // Deterministic
        assert_eq!(signature, key.sign(b"message"));
    }

    #[test]
    fn test_key_bytes() {
        let mut rng = StdRng::seed_from_u64(1);
        let key = PrivateKey::from_rng(&mut rng);
        let restored = PrivateKey::try_from(&key.to_bytes()[..]).unwrap();
        assert_eq!(key, restored);

        let public = key.public_key();
        let restored = PublicKey::try_from(&public.to_bytes()[..]).unwrap();
        assert_eq!(public, restored);
        assert!(matches!(
            PublicKey::try_from(&[0u8; 31][..]),
            Err(Error::InvalidLength(32, 31))
        ));
    }
}
