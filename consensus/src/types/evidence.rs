use super::{Vote, VoterSet};
use crate::Error;
use bytes::{Buf, BufMut};
use halcyon_codec::{Encode, EncodeSize, Error as CodecError, Read, ReadExt, Write};
use halcyon_cryptography::{hash, Address, Digest, PublicKey};

/// Proof that a voter signed two different blocks at the same height, round and step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DuplicateVoteEvidence {
    /// The vote with the lower block id.
    pub vote_a: Vote,
    pub vote_b: Vote,

    pub total_voting_power: i64,
    pub validator_power: i64,
    /// Time of the block in which the conflict was observed.
    pub timestamp: u64,
}

impl DuplicateVoteEvidence {
    /// Creates evidence from two conflicting votes (in any order).
    ///
    /// Returns `None` if the offender is not part of `voters`.
    pub fn new(vote1: Vote, vote2: Vote, timestamp: u64, voters: &VoterSet) -> Option<Self> {
        let (_, voter) = voters.get_by_address(&vote1.validator_address)?;
        let validator_power = voter.voting_power;
        let total_voting_power = voters.voters().iter().map(|val| val.voting_power).sum();
        let (vote_a, vote_b) = if vote1.block_id.key() <= vote2.block_id.key() {
            (vote1, vote2)
        } else {
            (vote2, vote1)
        };
        Some(Self {
            vote_a,
            vote_b,
            total_voting_power,
            validator_power,
            timestamp,
        })
    }

    pub fn height(&self) -> u64 {
        self.vote_a.height
    }

    pub fn address(&self) -> Address {
        self.vote_a.validator_address
    }

    pub fn hash(&self) -> Digest {
        hash(&self.encode())
    }

    pub fn validate_basic(&self) -> Result<(), Error> {
        self.vote_a
            .validate_basic()
            .map_err(|err| Error::InvalidEvidence(format!("invalid vote a: {err}")))?;
        self.vote_b
            .validate_basic()
            .map_err(|err| Error::InvalidEvidence(format!("invalid vote b: {err}")))?;
        let (a, b) = (&self.vote_a, &self.vote_b);
        if a.height != b.height || a.round != b.round || a.vote_type != b.vote_type {
            return Err(Error::InvalidEvidence(
                "votes are not for the same height, round and type".into(),
            ));
        }
        if a.validator_address != b.validator_address || a.validator_index != b.validator_index {
            return Err(Error::InvalidEvidence("votes are from different validators".into()));
        }
        if a.block_id.key() >= b.block_id.key() {
            return Err(Error::InvalidEvidence(
                "votes are not ordered by block id or are for the same block".into(),
            ));
        }
        Ok(())
    }

    /// Checks both signatures against the offender's key.
    pub fn verify(&self, chain_id: &str, pub_key: &PublicKey) -> Result<(), Error> {
        self.vote_a
            .verify(chain_id, pub_key)
            .and_then(|_| self.vote_b.verify(chain_id, pub_key))
            .map_err(|err| Error::InvalidEvidence(format!("invalid signature: {err}")))
    }
}

impl Write for DuplicateVoteEvidence {
    fn write(&self, buf: &mut impl BufMut) {
        self.vote_a.write(buf);
        self.vote_b.write(buf);
        self.total_voting_power.write(buf);
        self.validator_power.write(buf);
        self.timestamp.write(buf);
    }
}

impl EncodeSize for DuplicateVoteEvidence {
    fn encode_size(&self) -> usize {
        self.vote_a.encode_size()
            + self.vote_b.encode_size()
            + self.total_voting_power.encode_size()
            + self.validator_power.encode_size()
            + self.timestamp.encode_size()
    }
}

impl Read for DuplicateVoteEvidence {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            vote_a: Vote::read(buf)?,
            vote_b: Vote::read(buf)?,
            total_voting_power: i64::read(buf)?,
            validator_power: i64::read(buf)?,
            timestamp: u64::read(buf)?,
        })
    }
}
