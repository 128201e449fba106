//! RFC-6962 style merkle tree over byte slices.
//!
//! Leaves are hashed as `sha256(0x00 || leaf)` and inner nodes as
//! `sha256(0x01 || left || right)`. A tree with `n` leaves is split at the largest power of
//! two strictly less than `n`. The root of an empty tree is `sha256("")`.

use bytes::{Buf, BufMut};
use halcyon_codec::{EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, Write};
use halcyon_cryptography::{sha256::Sha256, Digest};

const LEAF_PREFIX: u8 = 0;
const INNER_PREFIX: u8 = 1;

/// Maximum depth of a proof (and thus of a tree).
const MAX_AUNTS: usize = 100;

fn leaf_hash(leaf: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(leaf);
    hasher.finalize()
}

fn inner_hash(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(&[INNER_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize()
}

/// Largest power of two strictly less than `n` (requires `n >= 2`).
fn split_point(n: usize) -> usize {
    assert!(n >= 2, "split point requires at least two items");
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}

/// Computes the merkle root of `items`.
pub fn hash_from_byte_slices<T: AsRef<[u8]>>(items: &[T]) -> Digest {
    match items.len() {
        0 => halcyon_cryptography::hash(&[]),
        1 => leaf_hash(items[0].as_ref()),
        n => {
            let k = split_point(n);
            let left = hash_from_byte_slices(&items[..k]);
            let right = hash_from_byte_slices(&items[k..]);
            inner_hash(&left, &right)
        }
    }
}

/// Proof that a leaf is included in a tree with a given root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proof {
    pub total: u32,
    pub index: u32,
    pub leaf_hash: Digest,
    /// Sibling hashes from the leaf up to the root.
    pub aunts: Vec<Digest>,
}

impl Proof {
    /// Verifies that `leaf` is at `self.index` in the tree with root `root`.
    pub fn verify(&self, root: &Digest, leaf: &[u8]) -> bool {
        if self.index >= self.total || self.aunts.len() > MAX_AUNTS {
            return false;
        }
        if leaf_hash(leaf) != self.leaf_hash {
            return false;
        }
        match self.compute_root() {
            Some(computed) => computed == *root,
            None => false,
        }
    }

    /// Computes the root implied by this proof.
    pub fn compute_root(&self) -> Option<Digest> {
        compute_from_aunts(
            self.index as usize,
            self.total as usize,
            self.leaf_hash,
            &self.aunts,
        )
    }
}

fn compute_from_aunts(index: usize, total: usize, leaf: Digest, aunts: &[Digest]) -> Option<Digest> {
    if index >= total || total == 0 {
        return None;
    }
    if total == 1 {
        return aunts.is_empty().then_some(leaf);
    }
    let (last, rest) = aunts.split_last()?;
    let k = split_point(total);
    if index < k {
        let left = compute_from_aunts(index, k, leaf, rest)?;
        Some(inner_hash(&left, last))
    } else {
        let right = compute_from_aunts(index - k, total - k, leaf, rest)?;
        Some(inner_hash(last, &right))
    }
}

/// Computes the root of `items` and an inclusion proof for each item.
pub fn proofs_from_byte_slices<T: AsRef<[u8]>>(items: &[T]) -> (Digest, Vec<Proof>) {
    let total = items.len() as u32;
    let mut proofs: Vec<Proof> = items
        .iter()
        .enumerate()
        .map(|(index, item)| Proof {
            total,
            index: index as u32,
            leaf_hash: leaf_hash(item.as_ref()),
            aunts: Vec::new(),
        })
        .collect();
    let root = build(&mut proofs, 0, items.len(), items);
    (root, proofs)
}

/// Builds the subtree over `items[start..end]`, appending sibling hashes to each proof
/// (deepest first).
fn build<T: AsRef<[u8]>>(proofs: &mut [Proof], start: usize, end: usize, items: &[T]) -> Digest {
    match end - start {
        0 => halcyon_cryptography::hash(&[]),
        1 => proofs[start].leaf_hash,
        n => {
            let k = split_point(n);
            let left = build(proofs, start, start + k, items);
            let right = build(proofs, start + k, end, items);
            for proof in &mut proofs[start..start + k] {
                proof.aunts.push(right);
            }
            for proof in &mut proofs[start + k..end] {
                proof.aunts.push(left);
            }
            inner_hash(&left, &right)
        }
    }
}

impl Write for Proof {
    fn write(&self, buf: &mut impl BufMut) {
        self.total.write(buf);
        self.index.write(buf);
        self.leaf_hash.write(buf);
        self.aunts.write(buf);
    }
}

impl EncodeSize for Proof {
    fn encode_size(&self) -> usize {
        self.total.encode_size()
            + self.index.encode_size()
            + self.leaf_hash.encode_size()
            + self.aunts.encode_size()
    }
}

impl Read for Proof {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let total = u32::read(buf)?;
        let index = u32::read(buf)?;
        let leaf_hash = Digest::read(buf)?;
        let aunts = Vec::<Digest>::read_cfg(buf, &(RangeCfg::from(..=MAX_AUNTS), ()))?;
        Ok(Self {
            total,
            index,
            leaf_hash,
            aunts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halcyon_codec::{DecodeExt, Encode};

    fn items(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| vec![i as u8; 3]).collect()
    }

    #[test]
    fn test_empty_and_single() {
        let empty: Vec<Vec<u8>> = Vec::new();
        assert_eq!(hash_from_byte_slices(&empty), halcyon_cryptography::hash(&[]));
        let one = items(1);
        assert_eq!(hash_from_byte_slices(&one), leaf_hash(&one[0]));
    }

    #[test]
    fn test_proofs_verify() {
        for n in 1..=17 {
            let items = items(n);
            let root = hash_from_byte_slices(&items);
            let (proof_root, proofs) = proofs_from_byte_slices(&items);
            assert_eq!(root, proof_root);
            for (i, proof) in proofs.iter().enumerate() {
                assert!(proof.verify(&root, &items[i]), "n={n} i={i}");
                assert!(!proof.verify(&root, b"other"));
            }
        }
    }

    #[test]
    fn test_tampered_proof_fails() {
        let items = items(5);
        let (root, proofs) = proofs_from_byte_slices(&items);
        let mut proof = proofs[3].clone();
        proof.index = 2;
        assert!(!proof.verify(&root, &items[3]));

        let mut proof = proofs[3].clone();
        proof.aunts.pop();
        assert!(!proof.verify(&root, &items[3]));
    }

    #[test]
    fn test_proof_codec() {
        let items = items(6);
        let (_, proofs) = proofs_from_byte_slices(&items);
        let decoded = Proof::decode(proofs[4].encode()).unwrap();
        assert_eq!(decoded, proofs[4]);
    }
}
