//! Verifiable random function built on deterministic signatures.
//!
//! Both supported schemes produce a unique signature for a given (key, message) pair, so a
//! signature over a namespaced message is a proof that can only be produced by the key
//! holder and can be checked by anyone with the public key. The VRF output is the SHA-256
//! hash of that proof.

use crate::{sha256, utils::union_unique, PrivateKey, PublicKey};
use bytes::Bytes;

const NAMESPACE: &[u8] = b"_HALCYON_VRF";

/// VRF output (the hash of a proof).
pub type Output = sha256::Digest;

/// Produces a proof over `message`.
pub fn prove(key: &PrivateKey, message: &[u8]) -> Bytes {
    key.sign(&union_unique(NAMESPACE, message))
}

/// Verifies `proof` over `message`, returning the VRF output on success.
pub fn verify(key: &PublicKey, proof: &[u8], message: &[u8]) -> Option<Output> {
    if !key.verify(&union_unique(NAMESPACE, message), proof) {
        return None;
    }
    Some(proof_to_hash(proof))
}

/// Derives the VRF output from a proof without verifying it.
pub fn proof_to_hash(proof: &[u8]) -> Output {
    sha256::hash(proof)
}
