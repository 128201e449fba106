//! Data exchanged and agreed upon by validators.

mod bit_array;
mod block;
mod commit;
mod events;
mod evidence;
pub mod merkle;
mod params;
mod part_set;
mod priv_validator;
mod proposal;
mod step;
mod validator;
mod vote;
mod vote_set;
mod voter_set;

pub use bit_array::BitArray;
pub use block::{
    evidence_hash, Block, BlockId, BlockMeta, Data, Header, Version, BLOCK_PROTOCOL,
    MAX_APP_HASH_SIZE, MAX_BLOCK_SIZE_BYTES,
};
pub use commit::{BlockIdFlag, Commit, CommitSig, MAX_VOTERS};
pub use events::{Event, EventBus, RoundStateEvent};
pub use evidence::DuplicateVoteEvidence;
pub use params::{
    BlockParams, ConsensusParams, ConsensusParamsUpdate, EvidenceParams, ValidatorParams,
    VoterParams,
};
pub use part_set::{Part, PartSet, PartSetHeader, BLOCK_PART_SIZE, MAX_PARTS};
pub use priv_validator::{FilePv, MockPv, PrivValidator};
pub use proposal::Proposal;
pub use step::RoundStep;
pub use validator::{Validator, ValidatorSet, MAX_TOTAL_VOTING_POWER, MAX_VALIDATORS};
pub use vote::{SignedMsgType, Vote, MAX_CHAIN_ID_LENGTH, MAX_SIGNATURE_SIZE};
pub use vote_set::VoteSet;
pub use voter_set::{select_voter, voters_to_elect, VoterSet, ELECTION_ACCURACY};
