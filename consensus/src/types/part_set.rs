use super::{
    merkle::{proofs_from_byte_slices, Proof},
    BitArray,
};
use crate::Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use halcyon_codec::{EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, Write};
use halcyon_cryptography::Digest;

/// Size of each part of a block.
pub const BLOCK_PART_SIZE: usize = 65536;

/// Maximum number of parts a block may be split into.
pub const MAX_PARTS: u32 = 1601;

/// Identifies a set of parts by their count and merkle root.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: Digest,
}

impl PartSetHeader {
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash.is_zero()
    }

    pub fn validate_basic(&self) -> Result<(), Error> {
        if self.total > MAX_PARTS {
            return Err(Error::InvalidBlockPart(format!(
                "too many parts: {}",
                self.total
            )));
        }
        Ok(())
    }
}

impl Write for PartSetHeader {
    fn write(&self, buf: &mut impl BufMut) {
        self.total.write(buf);
        self.hash.write(buf);
    }
}

impl EncodeSize for PartSetHeader {
    fn encode_size(&self) -> usize {
        self.total.encode_size() + self.hash.encode_size()
    }
}

impl Read for PartSetHeader {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            total: u32::read(buf)?,
            hash: Digest::read(buf)?,
        })
    }
}

/// A chunk of an encoded block with a proof of inclusion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    pub index: u32,
    pub bytes: Bytes,
    pub proof: Proof,
}

impl Part {
    pub fn validate_basic(&self) -> Result<(), Error> {
        if self.bytes.len() > BLOCK_PART_SIZE {
            return Err(Error::InvalidBlockPart(format!(
                "part too big: {}",
                self.bytes.len()
            )));
        }
        if self.proof.index != self.index {
            return Err(Error::InvalidBlockPart("proof index mismatch".into()));
        }
        Ok(())
    }
}

impl Write for Part {
    fn write(&self, buf: &mut impl BufMut) {
        self.index.write(buf);
        self.bytes.write(buf);
        self.proof.write(buf);
    }
}

impl EncodeSize for Part {
    fn encode_size(&self) -> usize {
        self.index.encode_size() + self.bytes.encode_size() + self.proof.encode_size()
    }
}

impl Read for Part {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            index: u32::read(buf)?,
            bytes: Bytes::read_cfg(buf, &RangeCfg::from(..=BLOCK_PART_SIZE))?,
            proof: Proof::read(buf)?,
        })
    }
}

/// Collection of the parts of a block, either built from the full block or filled in as
/// parts arrive.
#[derive(Clone, Debug)]
pub struct PartSet {
    total: u32,
    hash: Digest,
    parts: Vec<Option<Part>>,
    parts_bit_array: BitArray,
    count: u32,
    byte_size: usize,
}

impl PartSet {
    /// Splits `data` into parts of `part_size` bytes.
    pub fn from_data(data: &[u8], part_size: usize) -> Self {
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(part_size).collect()
        };
        let (root, proofs) = proofs_from_byte_slices(&chunks);
        let total = chunks.len() as u32;
        let mut parts_bit_array = BitArray::new(chunks.len());
        let parts = chunks
            .iter()
            .zip(proofs)
            .enumerate()
            .map(|(index, (chunk, proof))| {
                parts_bit_array.set(index, true);
                Some(Part {
                    index: index as u32,
                    bytes: Bytes::copy_from_slice(chunk),
                    proof,
                })
            })
            .collect();
        Self {
            total,
            hash: root,
            parts,
            parts_bit_array,
            count: total,
            byte_size: data.len(),
        }
    }

    /// Creates an empty set expecting the parts described by `header`.
    pub fn from_header(header: &PartSetHeader) -> Self {
        Self {
            total: header.total,
            hash: header.hash,
            parts: vec![None; header.total as usize],
            parts_bit_array: BitArray::new(header.total as usize),
            count: 0,
            byte_size: 0,
        }
    }

    pub fn header(&self) -> PartSetHeader {
        PartSetHeader {
            total: self.total,
            hash: self.hash,
        }
    }

    pub fn has_header(&self, header: &PartSetHeader) -> bool {
        self.header() == *header
    }

    pub fn bit_array(&self) -> &BitArray {
        &self.parts_bit_array
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.total
    }

    pub fn get_part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize)?.as_ref()
    }

    /// Adds a part, verifying its proof against the set's root.
    ///
    /// Returns `Ok(false)` if the part was already present.
    pub fn add_part(&mut self, part: Part) -> Result<bool, Error> {
        if part.index >= self.total {
            return Err(Error::InvalidBlockPart(format!(
                "unexpected index: {} >= {}",
                part.index, self.total
            )));
        }
        if self.parts[part.index as usize].is_some() {
            return Ok(false);
        }
        if part.proof.total != self.total || !part.proof.verify(&self.hash, &part.bytes) {
            return Err(Error::InvalidBlockPart("invalid proof".into()));
        }

        let index = part.index as usize;
        self.byte_size += part.bytes.len();
        self.parts[index] = Some(part);
        self.parts_bit_array.set(index, true);
        self.count += 1;
        Ok(true)
    }

    /// Reassembles the original data (requires the set to be complete).
    pub fn assemble(&self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }
        let mut data = BytesMut::with_capacity(self.byte_size);
        for part in self.parts.iter().flatten() {
            data.extend_from_slice(&part.bytes);
        }
        Some(data.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_part_set() {
        let data: Vec<u8> = (0..(BLOCK_PART_SIZE * 3 + 100))
            .map(|i| (i % 251) as u8)
            .collect();
        let full = PartSet::from_data(&data, BLOCK_PART_SIZE);
        assert_eq!(full.total(), 4);
        assert!(full.is_complete());

        // Rebuild from parts in reverse order
        let mut partial = PartSet::from_header(&full.header());
        assert!(!partial.is_complete());
        assert!(partial.assemble().is_none());
        for index in (0..full.total()).rev() {
            let part = full.get_part(index).unwrap().clone();
            assert!(partial.add_part(part.clone()).unwrap());
            assert!(!partial.add_part(part).unwrap());
        }
        assert!(partial.is_complete());
        assert_eq!(partial.bit_array().count(), 4);
        assert_eq!(partial.assemble().unwrap(), Bytes::from(data));
    }

    #[test]
    fn test_wrong_proof() {
        let data = vec![7u8; 1000];
        let full = PartSet::from_data(&data, 100);
        let mut partial = PartSet::from_header(&full.header());

        // Bytes that do not match the proof
        let mut part = full.get_part(3).unwrap().clone();
        part.bytes = Bytes::from(vec![8u8; 100]);
        assert!(matches!(
            partial.add_part(part),
            Err(Error::InvalidBlockPart(_))
        ));

        // Index out of range
        let mut part = full.get_part(3).unwrap().clone();
        part.index = 10;
        assert!(partial.add_part(part).is_err());
    }

    #[test]
    fn test_empty_data() {
        let full = PartSet::from_data(&[], BLOCK_PART_SIZE);
        assert_eq!(full.total(), 1);
        assert_eq!(full.assemble().unwrap().len(), 0);
    }
}
