use super::{BlockId, BlockIdFlag, CommitSig};
use crate::Error;
use bytes::{Buf, BufMut, Bytes};
use halcyon_codec::{Encode, EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, Write};
use halcyon_cryptography::{Address, PrivateKey, PublicKey};
use std::fmt::Display;

/// Largest signature produced by a supported scheme.
pub const MAX_SIGNATURE_SIZE: usize = 96;

/// Largest chain id accepted in signed messages.
pub const MAX_CHAIN_ID_LENGTH: usize = 50;

/// Type of a signed consensus message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum SignedMsgType {
    Prevote = 1,
    Precommit = 2,
    Proposal = 32,
}

impl SignedMsgType {
    /// Returns true for the vote types (prevote and precommit).
    pub fn is_vote(&self) -> bool {
        matches!(self, Self::Prevote | Self::Precommit)
    }
}

impl Display for SignedMsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prevote => f.write_str("prevote"),
            Self::Precommit => f.write_str("precommit"),
            Self::Proposal => f.write_str("proposal"),
        }
    }
}

impl Write for SignedMsgType {
    fn write(&self, buf: &mut impl BufMut) {
        (*self as u8).write(buf);
    }
}

impl Read for SignedMsgType {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            1 => Ok(Self::Prevote),
            2 => Ok(Self::Precommit),
            32 => Ok(Self::Proposal),
            tag => Err(CodecError::InvalidEnum("SignedMsgType", tag)),
        }
    }
}

impl halcyon_codec::FixedSize for SignedMsgType {
    const SIZE: usize = 1;
}

/// Bytes a validator signs for a vote: the vote fields (without the signer) bound to a chain.
pub(crate) fn canonical_vote_bytes(
    chain_id: &str,
    vote_type: SignedMsgType,
    height: u64,
    round: u32,
    block_id: &BlockId,
    timestamp: u64,
) -> Vec<u8> {
    let block_id = (!block_id.is_nil()).then_some(*block_id);
    let mut buf = Vec::with_capacity(64 + chain_id.len());
    vote_type.write(&mut buf);
    height.write(&mut buf);
    round.write(&mut buf);
    block_id.write(&mut buf);
    timestamp.write(&mut buf);
    chain_id.to_string().write(&mut buf);
    buf
}

/// A signed prevote or precommit from a voter.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Vote {
    pub vote_type: SignedMsgType,
    pub height: u64,
    pub round: u32,
    /// Nil (zero) when voting for no block.
    pub block_id: BlockId,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: u64,
    pub validator_address: Address,
    pub validator_index: u32,
    pub signature: Bytes,
}

impl Vote {
    /// Returns the bytes to sign for `chain_id`.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        canonical_vote_bytes(
            chain_id,
            self.vote_type,
            self.height,
            self.round,
            &self.block_id,
            self.timestamp,
        )
    }

    /// Signs the vote in place.
    pub fn sign(&mut self, chain_id: &str, key: &PrivateKey) {
        self.signature = key.sign(&self.sign_bytes(chain_id));
    }

    /// Verifies that `pub_key` belongs to the vote's validator and produced its signature.
    pub fn verify(&self, chain_id: &str, pub_key: &PublicKey) -> Result<(), Error> {
        if pub_key.address() != self.validator_address {
            return Err(Error::InvalidValidatorAddress(self.validator_address));
        }
        if !pub_key.verify(&self.sign_bytes(chain_id), &self.signature) {
            return Err(Error::InvalidSignature);
        }
        Ok(())
    }

    /// Performs stateless checks on the vote.
    pub fn validate_basic(&self) -> Result<(), Error> {
        if !self.vote_type.is_vote() {
            return Err(Error::UnexpectedVote(format!(
                "invalid type: {}",
                self.vote_type
            )));
        }
        if !self.block_id.is_nil() && !self.block_id.is_complete() {
            return Err(Error::UnexpectedVote(format!(
                "block id must be nil or complete: {:?}",
                self.block_id
            )));
        }
        if self.signature.is_empty() {
            return Err(Error::UnexpectedVote("signature is missing".into()));
        }
        if self.signature.len() > MAX_SIGNATURE_SIZE {
            return Err(Error::UnexpectedVote(format!(
                "signature too big: {}",
                self.signature.len()
            )));
        }
        Ok(())
    }

    /// Converts the vote into its slot in a commit.
    pub fn commit_sig(&self) -> CommitSig {
        let flag = if self.block_id.is_nil() {
            BlockIdFlag::Nil
        } else {
            BlockIdFlag::Commit
        };
        CommitSig {
            flag,
            validator_address: self.validator_address,
            timestamp: self.timestamp,
            signature: Some(self.signature.clone()),
        }
    }

    /// Encoded size, used to bound WAL entries.
    pub fn size(&self) -> usize {
        self.encode_size()
    }
}

impl Display for Vote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Vote{{{}:{} {}/{} {} {} @ {}}}",
            self.validator_index,
            self.validator_address,
            self.height,
            self.round,
            self.vote_type,
            self.block_id,
            self.timestamp
        )
    }
}

impl Write for Vote {
    fn write(&self, buf: &mut impl BufMut) {
        self.vote_type.write(buf);
        self.height.write(buf);
        self.round.write(buf);
        self.block_id.write(buf);
        self.timestamp.write(buf);
        self.validator_address.write(buf);
        self.validator_index.write(buf);
        self.signature.write(buf);
    }
}

impl EncodeSize for Vote {
    fn encode_size(&self) -> usize {
        self.vote_type.encode_size()
            + self.height.encode_size()
            + self.round.encode_size()
            + self.block_id.encode_size()
            + self.timestamp.encode_size()
            + self.validator_address.encode_size()
            + self.validator_index.encode_size()
            + self.signature.encode_size()
    }
}

impl Read for Vote {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            vote_type: SignedMsgType::read(buf)?,
            height: u64::read(buf)?,
            round: u32::read(buf)?,
            block_id: BlockId::read(buf)?,
            timestamp: u64::read(buf)?,
            validator_address: Address::read(buf)?,
            validator_index: u32::read(buf)?,
            signature: Bytes::read_cfg(buf, &RangeCfg::from(..=MAX_SIGNATURE_SIZE))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartSetHeader;
    use halcyon_codec::DecodeExt;
    use halcyon_cryptography::{hash, KeyType};

    fn example_vote(key: &PrivateKey) -> Vote {
        let mut vote = Vote {
            vote_type: SignedMsgType::Precommit,
            height: 12345,
            round: 2,
            block_id: BlockId {
                hash: hash(b"blockID_hash"),
                part_set_header: PartSetHeader {
                    total: 1000000,
                    hash: hash(b"blockID_part_set_header_hash"),
                },
            },
            timestamp: 1_600_000_000_000,
            validator_address: key.public_key().address(),
            validator_index: 56789,
            signature: Bytes::new(),
        };
        vote.sign("test_chain_id", key);
        vote
    }

    #[test]
    fn test_vote_verify() {
        let key = PrivateKey::from_seed(KeyType::Ed25519, 0);
        let vote = example_vote(&key);
        vote.verify("test_chain_id", &key.public_key()).unwrap();

        // Wrong chain
        assert!(matches!(
            vote.verify("other_chain", &key.public_key()),
            Err(Error::InvalidSignature)
        ));

        // Wrong key
        let other = PrivateKey::from_seed(KeyType::Ed25519, 1).public_key();
        assert!(matches!(
            vote.verify("test_chain_id", &other),
            Err(Error::InvalidValidatorAddress(_))
        ));
    }

    #[test]
    fn test_sign_bytes_ignore_signer() {
        let key = PrivateKey::from_seed(KeyType::Ed25519, 0);
        let vote = example_vote(&key);
        let mut other = vote.clone();
        other.validator_index = 1;
        other.signature = Bytes::from_static(b"sig");
        assert_eq!(vote.sign_bytes("c"), other.sign_bytes("c"));

        // Nil and non-nil votes sign different bytes
        let mut nil = vote.clone();
        nil.block_id = BlockId::default();
        assert_ne!(vote.sign_bytes("c"), nil.sign_bytes("c"));
    }

    #[test]
    fn test_validate_basic() {
        let key = PrivateKey::from_seed(KeyType::Bls12381, 0);
        let vote = example_vote(&key);
        vote.validate_basic().unwrap();

        let mut incomplete = vote.clone();
        incomplete.block_id.part_set_header = PartSetHeader::default();
        assert!(incomplete.validate_basic().is_err());

        let mut unsigned = vote.clone();
        unsigned.signature = Bytes::new();
        assert!(unsigned.validate_basic().is_err());
    }

    #[test]
    fn test_vote_codec() {
        let key = PrivateKey::from_seed(KeyType::Bls12381, 4);
        let vote = example_vote(&key);
        let decoded = Vote::decode(vote.encode()).unwrap();
        assert_eq!(decoded, vote);
    }
}
