use super::{
    merkle::hash_from_byte_slices, vote::canonical_vote_bytes, vote::MAX_SIGNATURE_SIZE,
    BitArray, BlockId, SignedMsgType, Vote,
};
use crate::Error;
use bytes::{Buf, BufMut, Bytes};
use halcyon_codec::{Encode, EncodeSize, Error as CodecError, FixedSize, RangeCfg, Read, ReadExt, Write};
use halcyon_cryptography::{Address, Digest};

/// Upper bound on the number of signatures in a commit.
pub const MAX_VOTERS: usize = 10_000;

/// Describes what a voter's slot in a commit attests to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockIdFlag {
    /// No vote was received from the voter.
    Absent = 1,
    /// The voter precommitted the committed block.
    Commit = 2,
    /// The voter precommitted nil.
    Nil = 3,
}

impl Write for BlockIdFlag {
    fn write(&self, buf: &mut impl BufMut) {
        (*self as u8).write(buf);
    }
}

impl Read for BlockIdFlag {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            1 => Ok(Self::Absent),
            2 => Ok(Self::Commit),
            3 => Ok(Self::Nil),
            tag => Err(CodecError::InvalidEnum("BlockIdFlag", tag)),
        }
    }
}

impl FixedSize for BlockIdFlag {
    const SIZE: usize = 1;
}

/// A voter's slot in a commit.
///
/// The signature is `None` for absent voters and for voters whose signature was folded into
/// the commit's aggregated signature.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommitSig {
    pub flag: BlockIdFlag,
    pub validator_address: Address,
    pub timestamp: u64,
    pub signature: Option<Bytes>,
}

impl CommitSig {
    pub fn absent() -> Self {
        Self {
            flag: BlockIdFlag::Absent,
            validator_address: Address::default(),
            timestamp: 0,
            signature: None,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.flag == BlockIdFlag::Absent
    }

    pub fn for_block(&self) -> bool {
        self.flag == BlockIdFlag::Commit
    }

    /// Returns the block id the voter signed given the commit's block id.
    pub fn block_id(&self, commit_block_id: &BlockId) -> BlockId {
        match self.flag {
            BlockIdFlag::Commit => *commit_block_id,
            BlockIdFlag::Absent | BlockIdFlag::Nil => BlockId::nil(),
        }
    }

    pub fn validate_basic(&self) -> Result<(), Error> {
        match self.flag {
            BlockIdFlag::Absent => {
                if self.validator_address != Address::default() {
                    return Err(Error::InvalidCommit(
                        "absent signature has a validator address".into(),
                    ));
                }
                if self.timestamp != 0 {
                    return Err(Error::InvalidCommit("absent signature has a timestamp".into()));
                }
                if self.signature.is_some() {
                    return Err(Error::InvalidCommit("absent signature has a signature".into()));
                }
            }
            BlockIdFlag::Commit | BlockIdFlag::Nil => {
                if self.validator_address == Address::default() {
                    return Err(Error::InvalidCommit("missing validator address".into()));
                }
                if let Some(signature) = &self.signature {
                    if signature.is_empty() || signature.len() > MAX_SIGNATURE_SIZE {
                        return Err(Error::InvalidCommit(format!(
                            "invalid signature length: {}",
                            signature.len()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Write for CommitSig {
    fn write(&self, buf: &mut impl BufMut) {
        self.flag.write(buf);
        self.validator_address.write(buf);
        self.timestamp.write(buf);
        self.signature.write(buf);
    }
}

impl EncodeSize for CommitSig {
    fn encode_size(&self) -> usize {
        self.flag.encode_size()
            + self.validator_address.encode_size()
            + self.timestamp.encode_size()
            + self.signature.encode_size()
    }
}

impl Read for CommitSig {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            flag: BlockIdFlag::read(buf)?,
            validator_address: Address::read(buf)?,
            timestamp: u64::read(buf)?,
            signature: Option::<Bytes>::read_cfg(buf, &RangeCfg::from(..=MAX_SIGNATURE_SIZE))?,
        })
    }
}

/// Proof that a block was committed: one slot per voter (in voter index order) plus an
/// optional aggregate of the signatures that were removed from their slots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Commit {
    pub height: u64,
    pub round: u32,
    pub block_id: BlockId,
    pub signatures: Vec<CommitSig>,
    pub aggregated_signature: Option<Bytes>,
}

impl Commit {
    /// True for the placeholder commit carried by the first block.
    pub fn is_empty(&self) -> bool {
        self.height == 0 && self.signatures.is_empty()
    }

    pub fn size(&self) -> usize {
        self.signatures.len()
    }

    /// Reconstructs the precommit cast by the voter at `index`.
    ///
    /// The signature of the returned vote is empty if it was aggregated.
    pub fn get_vote(&self, index: u32) -> Option<Vote> {
        let sig = self.signatures.get(index as usize)?;
        Some(Vote {
            vote_type: SignedMsgType::Precommit,
            height: self.height,
            round: self.round,
            block_id: sig.block_id(&self.block_id),
            timestamp: sig.timestamp,
            validator_address: sig.validator_address,
            validator_index: index,
            signature: sig.signature.clone().unwrap_or_default(),
        })
    }

    /// Bytes signed by the voter at `index`.
    pub fn vote_sign_bytes(&self, chain_id: &str, index: u32) -> Option<Vec<u8>> {
        let sig = self.signatures.get(index as usize)?;
        Some(canonical_vote_bytes(
            chain_id,
            SignedMsgType::Precommit,
            self.height,
            self.round,
            &sig.block_id(&self.block_id),
            sig.timestamp,
        ))
    }

    /// Bits set for every voter that is not absent.
    pub fn bit_array(&self) -> BitArray {
        let mut bits = BitArray::new(self.signatures.len());
        for (index, sig) in self.signatures.iter().enumerate() {
            bits.set(index, !sig.is_absent());
        }
        bits
    }

    pub fn validate_basic(&self) -> Result<(), Error> {
        if self.height == 0 {
            return Err(Error::InvalidCommit("zero height".into()));
        }
        if !self.block_id.is_complete() {
            return Err(Error::InvalidCommit(format!(
                "commit cannot be for nil block: {}",
                self.block_id
            )));
        }
        if self.signatures.is_empty() {
            return Err(Error::InvalidCommit("no signatures".into()));
        }
        for (index, sig) in self.signatures.iter().enumerate() {
            sig.validate_basic()
                .map_err(|err| Error::InvalidCommit(format!("signature {index}: {err}")))?;
            if self.aggregated_signature.is_none() && !sig.is_absent() && sig.signature.is_none() {
                return Err(Error::InvalidCommit(format!(
                    "signature {index} is missing and there is no aggregate"
                )));
            }
        }
        if let Some(aggregate) = &self.aggregated_signature {
            if aggregate.is_empty() || aggregate.len() > MAX_SIGNATURE_SIZE {
                return Err(Error::InvalidCommit("invalid aggregated signature".into()));
            }
        }
        Ok(())
    }

    /// Merkle root over the encoded signature slots followed by the aggregate (if any).
    pub fn hash(&self) -> Digest {
        let mut leaves: Vec<Vec<u8>> = self
            .signatures
            .iter()
            .map(|sig| sig.encode().to_vec())
            .collect();
        if let Some(aggregate) = &self.aggregated_signature {
            leaves.push(aggregate.to_vec());
        }
        hash_from_byte_slices(&leaves)
    }
}

impl Write for Commit {
    fn write(&self, buf: &mut impl BufMut) {
        self.height.write(buf);
        self.round.write(buf);
        self.block_id.write(buf);
        self.signatures.write(buf);
        self.aggregated_signature.write(buf);
    }
}

impl EncodeSize for Commit {
    fn encode_size(&self) -> usize {
        self.height.encode_size()
            + self.round.encode_size()
            + self.block_id.encode_size()
            + self.signatures.encode_size()
            + self.aggregated_signature.encode_size()
    }
}

impl Read for Commit {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            height: u64::read(buf)?,
            round: u32::read(buf)?,
            block_id: BlockId::read(buf)?,
            signatures: Vec::<CommitSig>::read_cfg(buf, &(RangeCfg::from(..=MAX_VOTERS), ()))?,
            aggregated_signature: Option::<Bytes>::read_cfg(
                buf,
                &RangeCfg::from(..=MAX_SIGNATURE_SIZE),
            )?,
        })
    }
}
