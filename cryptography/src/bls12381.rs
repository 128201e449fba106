//! BLS12-381 keys, signatures and aggregation.
//!
//! Public keys live in G1 (48 bytes compressed) and signatures in G2 (96 bytes compressed),
//! the "minimal public key" variant. Signatures over distinct messages from distinct signers
//! can be folded into a single aggregate signature and verified in one pairing check.
//!
//! # Domain Separation Tag (DST)
//!
//! All signatures use `BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_`.

use crate::{utils::hex, Error};
use blst::{
    min_pk::{AggregateSignature, PublicKey as IPublicKey, SecretKey, Signature as ISignature},
    BLST_ERROR,
};
use rand::{CryptoRng, RngCore};
use std::fmt::{Debug, Display};

/// Domain separation tag for signatures.
pub const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

pub const PRIVATE_KEY_LENGTH: usize = 32;
pub const PUBLIC_KEY_LENGTH: usize = 48;
pub const SIGNATURE_LENGTH: usize = 96;

/// BLS12-381 private key.
#[derive(Clone)]
pub struct PrivateKey {
    key: SecretKey,
}

impl PrivateKey {
    /// Generates a fresh key from the supplied RNG.
    pub fn from_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut ikm = [0u8; 32];
        rng.fill_bytes(&mut ikm);

        // Key generation only fails for ikm shorter than 32 bytes.
        let key = SecretKey::key_gen(&ikm, &[]).expect("ikm is 32 bytes");
        Self { key }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: self.key.sk_to_pk(),
        }
    }

    /// Signs `message` (deterministic).
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.key.sign(message, DST, &[]).to_bytes()
    }

    pub fn to_bytes(&self) -> [u8; PRIVATE_KEY_LENGTH] {
        self.key.to_bytes()
    }
}

impl TryFrom<&[u8]> for PrivateKey {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != PRIVATE_KEY_LENGTH {
            return Err(Error::InvalidLength(PRIVATE_KEY_LENGTH, value.len()));
        }
        let key = SecretKey::from_bytes(value).map_err(|_| Error::InvalidPrivateKey)?;
        Ok(Self { key })
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
        write!(f, "bls12381::PrivateKey({})", self.public_key())
    }
}

/// BLS12-381 public key (G1).
#[derive(Clone)]
pub struct PublicKey {
    key: IPublicKey,
}

impl PublicKey {
    /// Verifies `signature` over `message`, returning false on any malformed input.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = ISignature::from_bytes(signature) else {
            return false;
        };
        signature.verify(true, message, DST, &[], &self.key, true) == BLST_ERROR::BLST_SUCCESS
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.key.to_bytes()
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != PUBLIC_KEY_LENGTH {
            return Err(Error::InvalidLength(PUBLIC_KEY_LENGTH, value.len()));
        }
        let key = IPublicKey::key_validate(value).map_err(|_| Error::InvalidPublicKey)?;
        Ok(Self { key })
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PublicKey {}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_bytes().cmp(&other.to_bytes())
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

/// Aggregates multiple signatures (each checked to be in G2) into one.
pub fn aggregate_signatures<'a, I>(signatures: I) -> Result<[u8; SIGNATURE_LENGTH], Error>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut parsed = Vec::new();
    for signature in signatures {
        parsed.push(ISignature::from_bytes(signature).map_err(|_| Error::InvalidSignature)?);
    }
    if parsed.is_empty() {
        return Err(Error::EmptyAggregate);
    }
    let refs: Vec<&ISignature> = parsed.iter().collect();
    let aggregate =
        AggregateSignature::aggregate(&refs, true).map_err(|_| Error::InvalidSignature)?;
    Ok(aggregate.to_signature().to_bytes())
}

/// Verifies an aggregate signature over multiple (public key, message) pairs.
pub fn aggregate_verify_multiple_messages<'a, I>(pairs: I, signature: &[u8]) -> Result<(), Error>
where
    I: IntoIterator<Item = (&'a PublicKey, &'a [u8])>,
{
    let signature = ISignature::from_bytes(signature).map_err(|_| Error::InvalidSignature)?;
    let (keys, messages): (Vec<&IPublicKey>, Vec<&[u8]>) =
        pairs.into_iter().map(|(pk, msg)| (&pk.key, msg)).unzip();
    if keys.is_empty() {
        return Err(Error::EmptyAggregate);
    }
    match signature.aggregate_verify(true, &messages, DST, &keys, true) {
        BLST_ERROR::BLST_SUCCESS => Ok(()),
        _ => Err(Error::InvalidSignature),
    }
}
