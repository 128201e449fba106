//! Tally of the votes of one type cast in a round.
//!
//! Every voter has one slot. A second vote from the same voter for a different block is a
//! conflict: it is reported (so it can become evidence) and only tracked if a peer claimed
//! that the block it votes for has a two-thirds majority. Without that claim an equivocating
//! voter could force a node to track an unbounded number of blocks.

use super::{BitArray, BlockId, Commit, CommitSig, SignedMsgType, Vote, VoterSet};
use crate::{error::ConflictingVotes, Error};
use bytes::Bytes;
use halcyon_cryptography::{bls12381, Address, PublicKey};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::trace;

/// Votes for a single block.
#[derive(Clone, Debug)]
struct BlockVotes {
    /// Whether a peer claimed a two-thirds majority for this block.
    peer_maj23: bool,
    bit_array: BitArray,
    votes: Vec<Option<Vote>>,
    sum: i64,
}

impl BlockVotes {
    fn new(peer_maj23: bool, size: usize) -> Self {
        Self {
            peer_maj23,
            bit_array: BitArray::new(size),
            votes: vec![None; size],
            sum: 0,
        }
    }

    fn add_verified_vote(&mut self, vote: Vote, weight: i64) {
        let index = vote.validator_index as usize;
        if self.votes[index].is_none() {
            self.bit_array.set(index, true);
            self.votes[index] = Some(vote);
            self.sum += weight;
        }
    }
}

/// The prevotes or precommits of a (height, round).
#[derive(Clone, Debug)]
pub struct VoteSet {
    chain_id: String,
    height: u64,
    round: u32,
    vote_type: SignedMsgType,
    voters: Arc<VoterSet>,

    votes_bit_array: BitArray,
    votes: Vec<Option<Vote>>,
    sum: i64,
    maj23: Option<BlockId>,
    votes_by_block: BTreeMap<BlockId, BlockVotes>,
    peer_maj23s: HashMap<String, BlockId>,
}

impl VoteSet {
    /// Creates an empty set.
    ///
    /// # Panics
    ///
    /// Panics if `height` is zero.
    pub fn new(
        chain_id: &str,
        height: u64,
        round: u32,
        vote_type: SignedMsgType,
        voters: Arc<VoterSet>,
    ) -> Self {
        assert!(height > 0, "cannot make vote set for height 0");
        let size = voters.size();
        Self {
            chain_id: chain_id.to_string(),
            height,
            round,
            vote_type,
            voters,
            votes_bit_array: BitArray::new(size),
            votes: vec![None; size],
            sum: 0,
            maj23: None,
            votes_by_block: BTreeMap::new(),
            peer_maj23s: HashMap::new(),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn vote_type(&self) -> SignedMsgType {
        self.vote_type
    }

    pub fn voters(&self) -> &Arc<VoterSet> {
        &self.voters
    }

    pub fn size(&self) -> usize {
        self.voters.size()
    }

    /// Adds a vote, returning whether it was recorded.
    ///
    /// Duplicates return `Ok(false)`. A conflicting vote returns
    /// [Error::ConflictingVotes], with `added` set if it was still recorded because a peer
    /// claimed a majority for its block.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, Error> {
        if vote.height != self.height || vote.round != self.round || vote.vote_type != self.vote_type
        {
            return Err(Error::UnexpectedVote(format!(
                "expected {}/{}/{}, got {}/{}/{}",
                self.height, self.round, self.vote_type, vote.height, vote.round, vote.vote_type
            )));
        }
        let index = vote.validator_index;
        let voter = self
            .voters
            .get_by_index(index)
            .ok_or(Error::InvalidValidatorIndex(index))?;
        if voter.address != vote.validator_address {
            return Err(Error::InvalidValidatorAddress(vote.validator_address));
        }
        let weight = voter.voting_weight;

        // Ignore duplicates
        if let Some(existing) = self.get_vote(index, &vote.block_id) {
            if existing.signature == vote.signature {
                return Ok(false);
            }
            return Err(Error::NonDeterministicSignature);
        }

        vote.verify(&self.chain_id, &voter.pub_key)?;
        self.add_verified_vote(vote, weight)
    }

    /// Vote of the voter at `index` for `block_id` (including conflicting ones that were
    /// tracked).
    fn get_vote(&self, index: u32, block_id: &BlockId) -> Option<&Vote> {
        if let Some(Some(existing)) = self.votes.get(index as usize) {
            if existing.block_id == *block_id {
                return Some(existing);
            }
        }
        self.votes_by_block
            .get(block_id)?
            .votes
            .get(index as usize)?
            .as_ref()
    }

    fn add_verified_vote(&mut self, vote: Vote, weight: i64) -> Result<bool, Error> {
        let index = vote.validator_index as usize;
        let block_id = vote.block_id;

        let conflicting = match &self.votes[index] {
            Some(existing) => {
                assert!(
                    existing.block_id != block_id,
                    "duplicate vote should have been filtered"
                );
                let existing = existing.clone();

                // Replace the recorded vote if the new one is for the majority
                if self.maj23 == Some(block_id) {
                    self.votes[index] = Some(vote.clone());
                    self.votes_bit_array.set(index, true);
                }
                Some(existing)
            }
            None => {
                self.votes[index] = Some(vote.clone());
                self.votes_bit_array.set(index, true);
                self.sum += weight;
                None
            }
        };

        // A conflicting vote is only tracked for a block a peer claimed a majority for
        let tracked = match self.votes_by_block.get(&block_id) {
            Some(by_block) => conflicting.is_none() || by_block.peer_maj23,
            None => conflicting.is_none(),
        };
        if let (false, Some(existing)) = (tracked, &conflicting) {
            return Err(conflict(existing.clone(), vote, false));
        }

        let size = self.voters.size();
        let quorum = self.voters.quorum();
        let by_block = self
            .votes_by_block
            .entry(block_id)
            .or_insert_with(|| BlockVotes::new(false, size));
        let before = by_block.sum;
        by_block.add_verified_vote(vote.clone(), weight);
        if before < quorum && by_block.sum >= quorum && self.maj23.is_none() {
            trace!(height = self.height, round = self.round, %block_id, "two thirds majority");
            self.maj23 = Some(block_id);

            // The majority's votes take precedence over conflicting ones
            for (index, majority_vote) in by_block.votes.iter().enumerate() {
                if let Some(majority_vote) = majority_vote {
                    self.votes[index] = Some(majority_vote.clone());
                }
            }
        }

        match conflicting {
            Some(existing) => Err(conflict(existing, vote, true)),
            None => Ok(true),
        }
    }

    /// Records that `peer` claims a two-thirds majority for `block_id`, which allows
    /// conflicting votes for that block to be tracked.
    pub fn set_peer_maj23(&mut self, peer: &str, block_id: BlockId) -> Result<(), Error> {
        if let Some(existing) = self.peer_maj23s.get(peer) {
            if *existing == block_id {
                return Ok(());
            }
            return Err(Error::ConflictingPeerClaim {
                peer: peer.to_string(),
                existing: *existing,
                claimed: block_id,
            });
        }
        self.peer_maj23s.insert(peer.to_string(), block_id);

        let size = self.voters.size();
        self.votes_by_block
            .entry(block_id)
            .or_insert_with(|| BlockVotes::new(true, size))
            .peer_maj23 = true;
        Ok(())
    }

    /// Bits of the voters that voted (for any block).
    pub fn bit_array(&self) -> BitArray {
        self.votes_bit_array.clone()
    }

    /// Bits of the voters that voted for `block_id`, if it is tracked.
    pub fn bit_array_by_block_id(&self, block_id: &BlockId) -> Option<BitArray> {
        self.votes_by_block
            .get(block_id)
            .map(|by_block| by_block.bit_array.clone())
    }

    pub fn get_by_index(&self, index: u32) -> Option<&Vote> {
        self.votes.get(index as usize)?.as_ref()
    }

    pub fn get_by_address(&self, address: &Address) -> Option<&Vote> {
        let (index, _) = self.voters.get_by_address(address)?;
        self.get_by_index(index)
    }

    /// Recorded votes in voter order.
    pub fn list(&self) -> Vec<Vote> {
        self.votes.iter().flatten().cloned().collect()
    }

    /// Weight of all recorded votes.
    pub fn sum(&self) -> i64 {
        self.sum
    }

    /// Returns true if every voter voted.
    pub fn has_all(&self) -> bool {
        self.sum == self.voters.total_voting_weight()
    }

    /// Returns true if more than two thirds of the weight voted (for anything).
    pub fn has_two_thirds_any(&self) -> bool {
        self.sum >= self.voters.quorum()
    }

    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    /// Block (possibly nil) that more than two thirds of the weight voted for.
    pub fn two_thirds_majority(&self) -> Option<BlockId> {
        self.maj23
    }

    /// Builds the commit for the majority block.
    ///
    /// Votes for other blocks become absent. Signatures of aggregatable keys are removed
    /// from their slots and folded into one aggregated signature.
    ///
    /// # Panics
    ///
    /// Panics if this is not a precommit set with a two-thirds majority for a block.
    pub fn make_commit(&self) -> Commit {
        assert_eq!(
            self.vote_type,
            SignedMsgType::Precommit,
            "cannot make commit from prevotes"
        );
        let block_id = match self.maj23 {
            Some(block_id) if !block_id.is_nil() => block_id,
            _ => panic!("cannot make commit without a two thirds majority for a block"),
        };

        let mut signatures: Vec<CommitSig> = self
            .votes
            .iter()
            .map(|vote| match vote {
                Some(vote) if vote.block_id.is_nil() || vote.block_id == block_id => {
                    vote.commit_sig()
                }
                _ => CommitSig::absent(),
            })
            .collect();

        let mut aggregated = Vec::new();
        for (sig, voter) in signatures.iter_mut().zip(self.voters.voters()) {
            if sig.is_absent() || !matches!(voter.pub_key, PublicKey::Bls12381(_)) {
                continue;
            }
            if let Some(signature) = sig.signature.take() {
                aggregated.push(signature);
            }
        }
        let aggregated_signature = if aggregated.is_empty() {
            None
        } else {
            let aggregate = bls12381::aggregate_signatures(aggregated.iter().map(|sig| sig.as_ref()))
                .unwrap_or_else(|err| panic!("verified signatures failed to aggregate: {err}"));
            Some(Bytes::copy_from_slice(&aggregate))
        };

        Commit {
            height: self.height,
            round: self.round,
            block_id,
            signatures,
            aggregated_signature,
        }
    }
}

fn conflict(vote_a: Vote, vote_b: Vote, added: bool) -> Error {
    Error::ConflictingVotes(Box::new(ConflictingVotes {
        vote_a,
        vote_b,
        added,
    }))
}
