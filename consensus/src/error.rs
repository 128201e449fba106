use crate::types::{BlockId, Vote};
use bytes::Bytes;
use halcyon_cryptography::{utils::hex, Address};
use thiserror::Error;

/// Pair of votes signed by the same validator for the same (height, round, type) but
/// different blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConflictingVotes {
    pub vote_a: Vote,
    pub vote_b: Vote,

    /// Whether `vote_b` was still recorded because a peer claimed a majority for its block.
    pub added: bool,
}

/// Errors that can occur when running consensus.
#[derive(Debug, Error)]
pub enum Error {
    // Votes
    #[error("conflicting votes from validator {}", .0.vote_a.validator_address)]
    ConflictingVotes(Box<ConflictingVotes>),
    #[error("unexpected vote: {0}")]
    UnexpectedVote(String),
    #[error("invalid validator index: {0}")]
    InvalidValidatorIndex(u32),
    #[error("invalid validator address: {0}")]
    InvalidValidatorAddress(Address),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("non-deterministic signature")]
    NonDeterministicSignature,
    #[error("conflicting peer claim from {peer}: {existing:?} vs {claimed:?}")]
    ConflictingPeerClaim {
        peer: String,
        existing: BlockId,
        claimed: BlockId,
    },
    #[error("peer sent votes for too many rounds: {peer}")]
    TooManyCatchupRounds { peer: String },

    // Proposals and blocks
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),
    #[error("invalid proposal signature")]
    InvalidProposalSignature,
    #[error("invalid proposal POL round")]
    InvalidProposalPolRound,
    #[error("invalid block: {0}")]
    InvalidBlock(String),
    #[error("committed block {height} is invalid: {reason}")]
    InvalidCommittedBlock { height: u64, reason: String },
    #[error("invalid block part: {0}")]
    InvalidBlockPart(String),
    #[error("invalid commit: {0}")]
    InvalidCommit(String),
    #[error("invalid evidence: {0}")]
    InvalidEvidence(String),
    #[error("invalid validator update: {0}")]
    InvalidValidatorUpdate(String),

    // Signing
    #[error("refusing to sign: {0}")]
    DoubleSign(String),

    // Durability
    #[error("failed to write WAL at height {height} round {round}: {reason}")]
    WalWrite {
        height: u64,
        round: u32,
        reason: String,
    },
    #[error("WAL already contains end of height {0}")]
    WalAlreadyEnded(u64),
    #[error("end of height {0} not found in WAL")]
    EndHeightNotFound(u64),
    #[error("WAL message too large: {0}")]
    WalMessageTooLarge(usize),

    // Historical data
    #[error("no validator set found for height {0}")]
    NoValidatorSetForHeight(u64),
    #[error("no proof hash found for height {0}")]
    NoProofHashForHeight(u64),
    #[error("no consensus params found for height {0}")]
    NoConsensusParamsForHeight(u64),
    #[error("no ABCI responses found for height {0}")]
    NoAbciResponsesForHeight(u64),
    #[error("block not found at height {0}")]
    BlockNotFound(u64),
    #[error("cannot prune to height {requested}: {reason}")]
    InvalidPruneHeight { requested: u64, reason: String },

    // Handshake
    #[error(
        "app hash mismatch at height {height}: expected {}, got {}",
        hex(.expected),
        hex(.got)
    )]
    AppHashMismatch {
        height: u64,
        expected: Bytes,
        got: Bytes,
    },
    #[error("app block height {app_height} is higher than store height {store_height}")]
    AppBlockHeightTooHigh { app_height: u64, store_height: u64 },
    #[error("app block height {app_height} is lower than store base {store_base}")]
    AppBlockHeightTooLow { app_height: u64, store_base: u64 },
    #[error("state height {state_height} is inconsistent with store height {store_height}")]
    StateStoreMismatch {
        state_height: u64,
        store_height: u64,
    },

    // Collaborators
    #[error("application error: {0}")]
    Application(String),
    #[error("mempool error: {0}")]
    Mempool(String),
    #[error("codec error: {0}")]
    Codec(#[from] halcyon_codec::Error),
    #[error("journal error: {0}")]
    Journal(#[from] halcyon_storage::journal::Error),
    #[error("metadata error: {0}")]
    Metadata(#[from] halcyon_storage::metadata::Error),
    #[error("stopped")]
    Stopped,
}

impl Error {
    /// Returns true if the error indicates the node cannot safely continue.
    ///
    /// Fatal errors stop the consensus loop. Everything else is logged and the offending
    /// input dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::WalWrite { .. }
                | Error::InvalidCommittedBlock { .. }
                | Error::AppHashMismatch { .. }
                | Error::AppBlockHeightTooHigh { .. }
                | Error::AppBlockHeightTooLow { .. }
                | Error::StateStoreMismatch { .. }
                | Error::Application(_)
                | Error::Journal(_)
                | Error::Metadata(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let fatal = Error::AppHashMismatch {
            height: 3,
            expected: Bytes::from_static(&[0xab; 4]),
            got: Bytes::new(),
        };
        assert!(fatal.is_fatal());
        assert!(fatal.to_string().contains("height 3"));
        assert!(fatal.to_string().contains("abababab"));
        assert!(Error::WalWrite {
            height: 1,
            round: 0,
            reason: "disk full".into()
        }
        .is_fatal());
        assert!(!Error::InvalidSignature.is_fatal());
        assert!(!Error::NoValidatorSetForHeight(4).is_fatal());
        assert!(!Error::EndHeightNotFound(2).is_fatal());
    }
}
