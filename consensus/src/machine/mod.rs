//! The round-based consensus state machine.
//!
//! # Design
//!
//! Each height runs in rounds. A round has a proposer (drawn with the VRF proof of the last
//! block) that broadcasts a proposal split into parts, followed by two rounds of voting:
//!
//! * `Propose`: wait for the proposal and its block until `timeout_propose`.
//! * `Prevote`: vote for the block we are locked on, else for a valid proposal block, else for
//!   nil. Once two thirds of the prevotes arrive for anything, wait `timeout_prevote` for a
//!   majority on a single block.
//! * `Precommit`: precommit the block with two thirds of the prevotes (a polka) and lock on it,
//!   precommit nil otherwise (releasing the lock on a polka for nil). Once two thirds of the
//!   precommits arrive for anything, wait `timeout_precommit` before the next round.
//! * `Commit`: with two thirds of the precommits on a block, fetch it if missing, store it,
//!   mark the height ended in the WAL, execute it and wait `timeout_commit` before the next
//!   height.
//!
//! Only elected voters vote and count toward the two thirds. Seeing two thirds of the votes
//! of any kind in a later round makes the node skip to that round.
//!
//! # Recovery
//!
//! Every input is written to the [Wal](crate::wal::Wal) first (our own votes and proposals
//! synchronously, before they are broadcast). On restart the entries since the end of the
//! last height are replayed through the same handlers. Proposals and votes the replay asks
//! us to sign are deferred and only signed once it ends if they are still missing, so a
//! crash can never make the node sign twice.
//!
//! # Empty blocks
//!
//! With `create_empty_blocks` disabled, round 0 of a height waits in `NewRound` until the
//! mempool reports transactions (or `create_empty_blocks_interval` passes). Heights that
//! must prove the application hash of the last block never wait.

mod actor;
mod config;
mod height_vote_set;
mod ingress;
mod metrics;
mod round_state;
mod state;
mod ticker;

pub use actor::Actor;
pub use config::Config;
pub use height_vote_set::HeightVoteSet;
pub use ingress::{Mailbox, Message};
pub use metrics::Metrics;
pub use round_state::{LastCommit, RoundState, RoundStateSnapshot};
pub use state::ConsensusState;
pub use ticker::TimeoutTicker;

use crate::wal::ConsensusMessage;

/// Sends our own proposals, block parts and votes to peers.
pub trait Broadcaster: Send + 'static {
    fn broadcast(&mut self, msg: ConsensusMessage);
}

/// Broadcaster of a node without peers.
pub struct NoopBroadcaster;

impl Broadcaster for NoopBroadcaster {
    fn broadcast(&mut self, _msg: ConsensusMessage) {}
}
