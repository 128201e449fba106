use super::HeightVoteSet;
use crate::types::{
    BitArray, Block, Commit, PartSet, Proposal, RoundStateEvent, RoundStep, ValidatorSet, Vote,
    VoteSet, VoterSet,
};
use crate::Error;
use halcyon_cryptography::Digest;
use std::sync::Arc;

/// Progress of the state machine through the current height.
pub struct RoundState {
    pub height: u64,
    pub round: u32,
    pub step: RoundStep,

    /// When the height starts (milliseconds since the UNIX epoch).
    pub start_time: u64,
    /// When the last block was committed (zero before the first commit).
    pub commit_time: u64,

    pub validators: ValidatorSet,
    pub voters: Arc<VoterSet>,

    pub proposal: Option<Proposal>,
    pub proposal_block: Option<Block>,
    pub proposal_block_parts: Option<PartSet>,

    /// Last round we precommitted a block in, and that block.
    pub locked_round: Option<u32>,
    pub locked_block: Option<Block>,
    pub locked_block_parts: Option<PartSet>,

    /// Last round in which a block received two thirds of prevotes, and that block.
    pub valid_round: Option<u32>,
    pub valid_block: Option<Block>,
    pub valid_block_parts: Option<PartSet>,

    pub votes: HeightVoteSet,
    pub commit_round: Option<u32>,

    /// Precommits for the last block, kept to build its commit.
    pub last_commit: Option<LastCommit>,
    pub last_voters: Arc<VoterSet>,

    pub triggered_timeout_precommit: bool,
}

impl RoundState {
    pub fn event(&self) -> RoundStateEvent {
        RoundStateEvent {
            height: self.height,
            round: self.round,
            step: self.step,
        }
    }

    pub fn snapshot(&self) -> RoundStateSnapshot {
        let votes = |set: Option<&VoteSet>| {
            set.map(VoteSet::bit_array)
                .unwrap_or_else(|| BitArray::new(self.voters.size()))
        };
        RoundStateSnapshot {
            height: self.height,
            round: self.round,
            step: self.step,
            start_time: self.start_time,
            commit_time: self.commit_time,
            proposal: self.proposal.clone(),
            proposal_block_hash: self.proposal_block.as_ref().map(Block::hash),
            locked_round: self.locked_round,
            locked_block_hash: self.locked_block.as_ref().map(Block::hash),
            valid_round: self.valid_round,
            valid_block_hash: self.valid_block.as_ref().map(Block::hash),
            commit_round: self.commit_round,
            prevotes: votes(self.votes.prevotes(self.round)),
            precommits: votes(self.votes.precommits(self.round)),
            last_commit: self.last_commit.as_ref().map(LastCommit::bit_array),
        }
    }
}

/// Precommits of the last block.
///
/// After a restart the precommits themselves are gone and only the commit saved with the
/// block remains. Its aggregated signatures can't be split back into votes, so it is kept
/// as is and late precommits are no longer collected.
#[derive(Clone, Debug)]
pub enum LastCommit {
    Votes(VoteSet),
    Commit(Commit),
}

impl LastCommit {
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, Error> {
        match self {
            Self::Votes(votes) => votes.add_vote(vote),
            Self::Commit(_) => Ok(false),
        }
    }

    /// Whether the last block can be committed (always true for a loaded commit).
    pub fn has_two_thirds_majority(&self) -> bool {
        match self {
            Self::Votes(votes) => votes
                .two_thirds_majority()
                .is_some_and(|block_id| !block_id.is_nil()),
            Self::Commit(_) => true,
        }
    }

    pub fn has_all(&self) -> bool {
        match self {
            Self::Votes(votes) => votes.has_all(),
            Self::Commit(commit) => commit.signatures.iter().all(|sig| !sig.is_absent()),
        }
    }

    pub fn make_commit(&self) -> Commit {
        match self {
            Self::Votes(votes) => votes.make_commit(),
            Self::Commit(commit) => commit.clone(),
        }
    }

    pub fn bit_array(&self) -> BitArray {
        match self {
            Self::Votes(votes) => votes.bit_array(),
            Self::Commit(commit) => commit.bit_array(),
        }
    }
}

/// Copy of the [RoundState] readable outside the state machine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoundStateSnapshot {
    pub height: u64,
    pub round: u32,
    pub step: RoundStep,
    pub start_time: u64,
    pub commit_time: u64,
    pub proposal: Option<Proposal>,
    pub proposal_block_hash: Option<Digest>,
    pub locked_round: Option<u32>,
    pub locked_block_hash: Option<Digest>,
    pub valid_round: Option<u32>,
    pub valid_block_hash: Option<Digest>,
    pub commit_round: Option<u32>,

    /// Voters that prevoted and precommitted in the current round.
    pub prevotes: BitArray,
    pub precommits: BitArray,
    pub last_commit: Option<BitArray>,
}
