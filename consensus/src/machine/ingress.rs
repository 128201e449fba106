use super::RoundStateSnapshot;
use crate::{
    types::{BlockId, Part, Proposal, SignedMsgType, Vote},
    wal::ConsensusMessage,
};
use futures::{channel::mpsc, SinkExt};
use std::sync::{Arc, RwLock};
use tracing::error;

/// Inputs of the consensus actor.
pub enum Message {
    /// A proposal, block part or vote received from a peer.
    Peer {
        msg: ConsensusMessage,
        peer: String,
    },
    /// A peer claims two thirds of the votes of a round are for a block.
    PeerMaj23 {
        height: u64,
        round: u32,
        vote_type: SignedMsgType,
        block_id: BlockId,
        peer: String,
    },
    /// The mempool has transactions to propose.
    TxsAvailable,
    Stop,
}

/// Handle to the consensus actor.
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
    snapshot: Arc<RwLock<RoundStateSnapshot>>,
}

impl Mailbox {
    pub fn new(sender: mpsc::Sender<Message>, snapshot: Arc<RwLock<RoundStateSnapshot>>) -> Self {
        Self { sender, snapshot }
    }

    async fn send(&mut self, message: Message) {
        if let Err(err) = self.sender.send(message).await {
            error!(?err, "failed to send message to consensus");
        }
    }

    pub async fn proposal(&mut self, proposal: Proposal, peer: String) {
        let msg = ConsensusMessage::Proposal(proposal);
        self.send(Message::Peer { msg, peer }).await;
    }

    pub async fn block_part(&mut self, height: u64, round: u32, part: Part, peer: String) {
        let msg = ConsensusMessage::BlockPart {
            height,
            round,
            part,
        };
        self.send(Message::Peer { msg, peer }).await;
    }

    pub async fn vote(&mut self, vote: Vote, peer: String) {
        let msg = ConsensusMessage::Vote(vote);
        self.send(Message::Peer { msg, peer }).await;
    }

    pub async fn peer_maj23(
        &mut self,
        height: u64,
        round: u32,
        vote_type: SignedMsgType,
        block_id: BlockId,
        peer: String,
    ) {
        self.send(Message::PeerMaj23 {
            height,
            round,
            vote_type,
            block_id,
            peer,
        })
        .await;
    }

    pub async fn txs_available(&mut self) {
        self.send(Message::TxsAvailable).await;
    }

    /// Asks the actor to close the WAL and exit.
    pub async fn stop(&mut self) {
        self.send(Message::Stop).await;
    }

    /// Copy of the round state after the last handled input.
    pub fn round_state(&self) -> RoundStateSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
