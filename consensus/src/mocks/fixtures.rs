//! Validators and chains used across tests.

use crate::{
    state::{BlockExecutor, Genesis, State, StateStore},
    types::{
        Block, BlockId, Commit, MockPv, PartSet, SignedMsgType, Validator, Vote, VoteSet,
    },
};
use bytes::Bytes;
use halcyon_cryptography::{vrf, Address, KeyType, PrivateKey};
use std::sync::Arc;

pub const CHAIN_ID: &str = "halcyon-test";

/// Time of the genesis block.
pub const GENESIS_TIME: u64 = 1_000_000;

/// A chain of `n` equally powered validators with deterministic keys.
pub struct Fixture {
    pub keys: Vec<PrivateKey>,
    pub genesis: Genesis,
}

impl Fixture {
    pub fn new(n: u64, key_type: KeyType) -> Self {
        let keys: Vec<PrivateKey> = (0..n)
            .map(|seed| PrivateKey::from_seed(key_type, seed))
            .collect();
        let genesis = Genesis {
            genesis_time: GENESIS_TIME,
            chain_id: CHAIN_ID.into(),
            initial_height: 1,
            validators: keys
                .iter()
                .map(|key| Validator::new(key.public_key(), 10))
                .collect(),
            ..Default::default()
        };
        Self { keys, genesis }
    }

    pub fn state(&self) -> State {
        State::from_genesis(&self.genesis).unwrap()
    }

    pub fn key(&self, address: &Address) -> &PrivateKey {
        self.keys
            .iter()
            .find(|key| key.public_key().address() == *address)
            .unwrap()
    }

    pub fn signer(&self, address: &Address) -> MockPv {
        MockPv::new(self.key(address).clone())
    }

    /// Block proposed in `round` on top of `state`, with a valid proposer proof.
    pub fn propose(
        &self,
        state: &State,
        commit: Commit,
        txs: Vec<Bytes>,
        round: u32,
    ) -> (Block, PartSet, BlockId) {
        let (proposer, proof) = self.prove(state, round);
        let (block, parts) = state.make_block(
            state.next_height(),
            txs,
            commit,
            Vec::new(),
            proposer,
            round,
            proof,
        );
        let block_id = block_id(&block, &parts);
        (block, parts, block_id)
    }

    /// Like [Fixture::propose] with transactions and evidence reaped by `executor`.
    pub fn propose_with<S: StateStore>(
        &self,
        executor: &BlockExecutor<S>,
        state: &State,
        commit: Commit,
        round: u32,
    ) -> (Block, PartSet, BlockId) {
        let (proposer, proof) = self.prove(state, round);
        let (block, parts) =
            executor.create_proposal_block(state.next_height(), state, commit, proposer, round, proof);
        let block_id = block_id(&block, &parts);
        (block, parts, block_id)
    }

    fn prove(&self, state: &State, round: u32) -> (Address, Bytes) {
        let proposer = state.proposer(round).address;
        let proof = vrf::prove(self.key(&proposer), &state.make_hash_message(round));
        (proposer, proof)
    }

    /// Commit of `block_id` signed by every voter of `state` (the voters of `height`).
    pub fn commit(&self, state: &State, height: u64, round: u32, block_id: BlockId) -> Commit {
        let voters = Arc::new(state.voters.clone());
        let mut set = VoteSet::new(
            &state.chain_id,
            height,
            round,
            SignedMsgType::Precommit,
            voters.clone(),
        );
        for (index, voter) in voters.voters().iter().enumerate() {
            let mut vote = Vote {
                vote_type: SignedMsgType::Precommit,
                height,
                round,
                block_id,
                timestamp: state.last_block_time + 1_000,
                validator_address: voter.address,
                validator_index: index as u32,
                signature: Bytes::new(),
            };
            vote.sign(&state.chain_id, self.key(&voter.address));
            assert!(set.add_vote(vote).unwrap());
        }
        set.make_commit()
    }

    /// Proposes, commits and applies `count` blocks on top of `state`.
    ///
    /// Returns the final state and every block with its parts and seen commit.
    pub fn build_chain<S: StateStore>(
        &self,
        executor: &mut BlockExecutor<S>,
        mut state: State,
        count: u64,
    ) -> (State, Vec<(Block, PartSet, Commit)>) {
        let mut blocks = Vec::new();
        let mut last_commit = Commit::default();
        for _ in 0..count {
            let height = state.next_height();
            let tx = Bytes::from(format!("key{height}=value{height}"));
            let (block, parts, block_id) = self.propose(&state, last_commit, vec![tx], 0);
            let commit = self.commit(&state, height, 0, block_id);
            let (next, _) = executor.apply_block(state, block_id, &block).unwrap();
            state = next;
            last_commit = commit.clone();
            blocks.push((block, parts, commit));
        }
        (state, blocks)
    }
}

pub fn block_id(block: &Block, parts: &PartSet) -> BlockId {
    BlockId {
        hash: block.hash(),
        part_set_header: parts.header(),
    }
}
