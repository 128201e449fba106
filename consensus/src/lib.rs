//! Order blocks in a Byzantine environment with VRF-elected voters and crash recovery.
//!
//! # Overview
//!
//! Validators agree on one block per height through rounds of proposal, prevote and
//! precommit. Only a subset of the validators, elected each height from the VRF proof of
//! the last proposer, votes; a block is committed once voters holding more than two thirds
//! of the elected voting power precommit it. The committed block is executed against an
//! external application and the resulting chain state is persisted before the next height
//! starts.
//!
//! * [types]: blocks, votes, vote sets and voter election.
//! * [machine]: the round-based state machine and the actor driving it.
//! * [wal]: the write-ahead log every consensus input goes through.
//! * [state]: the chain state and the executor that advances it.
//! * [store]: persisted blocks and commits.
//! * [handshake]: startup reconciliation with the application.
//!
//! # Status
//!
//! `halcyon-consensus` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.

pub mod abci;
mod error;
pub mod handshake;
pub mod machine;
pub mod mempool;
pub mod state;
pub mod store;
pub mod types;
pub mod wal;

pub use error::{ConflictingVotes, Error};

#[cfg(test)]
pub mod mocks;
