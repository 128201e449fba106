use super::{State, StateStore};
use crate::{
    types::{DuplicateVoteEvidence, Vote, VoterSet},
    Error,
};
use halcyon_codec::EncodeSize;
use halcyon_cryptography::Digest;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Evidence of misbehavior waiting to be included in a block.
///
/// Conflicting votes observed by consensus are buffered until the height they were cast at
/// is committed, then turned into [DuplicateVoteEvidence] against the voters of that height.
#[derive(Default)]
pub struct EvidencePool {
    pending: Vec<DuplicateVoteEvidence>,
    /// Height of each committed piece of evidence.
    committed: HashMap<Digest, u64>,
    conflicting: Vec<(Vote, Vote)>,
}

impl EvidencePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records two conflicting votes seen by consensus.
    pub fn report_conflicting_votes(&mut self, vote_a: Vote, vote_b: Vote) {
        debug!(
            height = vote_a.height,
            round = vote_a.round,
            validator = %vote_a.validator_address,
            "buffered conflicting votes"
        );
        self.conflicting.push((vote_a, vote_b));
    }

    /// Number of pending pieces of evidence.
    pub fn size(&self) -> usize {
        self.pending.len()
    }

    /// Oldest pending evidence fitting in `max_bytes`, with its total size.
    pub fn pending_evidence(&self, max_bytes: i64) -> (Vec<DuplicateVoteEvidence>, i64) {
        let mut total = 0i64;
        let mut evidence = Vec::new();
        for ev in &self.pending {
            let size = ev.encode_size() as i64;
            if total + size > max_bytes {
                break;
            }
            total += size;
            evidence.push(ev.clone());
        }
        (evidence, total)
    }

    /// Verifies and adds evidence received from a peer.
    pub fn add_evidence(
        &mut self,
        evidence: DuplicateVoteEvidence,
        state: &State,
        store: &impl StateStore,
    ) -> Result<(), Error> {
        let hash = evidence.hash();
        if self.pending.iter().any(|ev| ev.hash() == hash) {
            return Ok(());
        }
        self.verify(&evidence, state, store)?;
        self.pending.push(evidence);
        Ok(())
    }

    /// Checks the evidence included in a block.
    pub fn check_evidence(
        &self,
        evidence: &[DuplicateVoteEvidence],
        state: &State,
        store: &impl StateStore,
    ) -> Result<(), Error> {
        for (index, ev) in evidence.iter().enumerate() {
            let hash = ev.hash();
            if evidence[..index].iter().any(|other| other.hash() == hash) {
                return Err(Error::InvalidEvidence(format!(
                    "duplicate evidence {hash}"
                )));
            }
            if self.pending.iter().any(|pending| pending.hash() == hash) {
                continue;
            }
            self.verify(ev, state, store)?;
        }
        Ok(())
    }

    fn verify(
        &self,
        evidence: &DuplicateVoteEvidence,
        state: &State,
        store: &impl StateStore,
    ) -> Result<(), Error> {
        evidence.validate_basic()?;
        let hash = evidence.hash();
        if self.committed.contains_key(&hash) {
            return Err(Error::InvalidEvidence(format!(
                "evidence {hash} was already committed"
            )));
        }
        let height = evidence.height();
        if height > state.last_block_height {
            return Err(Error::InvalidEvidence(format!(
                "evidence from future height {height}"
            )));
        }
        let max_age = state.consensus_params.evidence.max_age_num_blocks;
        if state.last_block_height - height > max_age {
            return Err(Error::InvalidEvidence(format!(
                "evidence from height {height} is older than {max_age} blocks"
            )));
        }

        let voters = voters_at(state, store, height)?;
        let (_, voter) = voters.get_by_address(&evidence.address()).ok_or_else(|| {
            Error::InvalidEvidence(format!(
                "{} was not a voter at height {height}",
                evidence.address()
            ))
        })?;
        if evidence.validator_power != voter.voting_power {
            return Err(Error::InvalidEvidence(format!(
                "wrong validator power: expected {}, got {}",
                voter.voting_power, evidence.validator_power
            )));
        }
        evidence.verify(&state.chain_id, &voter.pub_key)
    }

    /// Marks the evidence in the last block as committed and turns the conflicting votes
    /// of committed heights into evidence.
    pub fn update(
        &mut self,
        state: &State,
        committed: &[DuplicateVoteEvidence],
        store: &impl StateStore,
    ) {
        for ev in committed {
            let hash = ev.hash();
            self.committed.insert(hash, ev.height());
            self.pending.retain(|pending| pending.hash() != hash);
        }

        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.conflicting)
            .into_iter()
            .partition(|(vote, _)| vote.height <= state.last_block_height);
        self.conflicting = waiting;
        for (vote_a, vote_b) in ready {
            let voters = match voters_at(state, store, vote_a.height) {
                Ok(voters) => voters,
                Err(err) => {
                    warn!(?err, height = vote_a.height, "dropping conflicting votes");
                    continue;
                }
            };
            let Some(evidence) =
                DuplicateVoteEvidence::new(vote_a, vote_b, state.last_block_time, &voters)
            else {
                continue;
            };
            if let Err(err) = evidence.validate_basic() {
                warn!(?err, "dropping invalid conflicting votes");
                continue;
            }
            let hash = evidence.hash();
            if self.committed.contains_key(&hash)
                || self.pending.iter().any(|ev| ev.hash() == hash)
            {
                continue;
            }
            debug!(height = evidence.height(), validator = %evidence.address(), "new evidence");
            self.pending.push(evidence);
        }

        // Expire old evidence
        let max_age = state.consensus_params.evidence.max_age_num_blocks;
        let min_height = state.last_block_height.saturating_sub(max_age);
        self.pending.retain(|ev| ev.height() >= min_height);
        self.committed.retain(|_, height| *height >= min_height);
    }
}

/// Voters of `height`, which must be at most the last block height.
fn voters_at(state: &State, store: &impl StateStore, height: u64) -> Result<VoterSet, Error> {
    if height == state.last_block_height {
        return Ok(state.last_voters.clone());
    }
    store.load_voters(height, &state.voter_params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        state::Genesis,
        types::{BlockId, PartSetHeader, SignedMsgType, Validator},
    };
    use halcyon_cryptography::{hash, KeyType, PrivateKey};
    use halcyon_runtime::storage::memory;
    use halcyon_storage::metadata::{Config, Metadata};

    struct Fixture {
        keys: Vec<PrivateKey>,
        state: State,
        store: Metadata<memory::Storage>,
    }

    /// State after block 1, with the voters of height 1 as last voters.
    fn fixture() -> Fixture {
        let keys: Vec<PrivateKey> = (0..4)
            .map(|i| PrivateKey::from_seed(KeyType::Ed25519, i))
            .collect();
        let genesis = Genesis {
            genesis_time: 1,
            chain_id: "halcyon".into(),
            initial_height: 1,
            validators: keys
                .iter()
                .map(|key| Validator::new(key.public_key(), 10))
                .collect(),
            ..Default::default()
        };
        let mut state = State::from_genesis(&genesis).unwrap();
        let mut store = Metadata::init(
            memory::Storage::default(),
            Config {
                partition: "evidence".into(),
            },
        )
        .unwrap();
        store.save(&state).unwrap();
        state.last_voters = state.voters.clone();
        state.last_block_height = 1;
        state.last_block_time = 7;
        Fixture { keys, state, store }
    }

    fn vote(fixture: &Fixture, index: u32, block: u8) -> Vote {
        let voter = &fixture.state.last_voters.voters()[index as usize];
        let key = fixture
            .keys
            .iter()
            .find(|key| key.public_key() == voter.pub_key)
            .unwrap();
        let mut vote = Vote {
            vote_type: SignedMsgType::Prevote,
            height: 1,
            round: 0,
            block_id: BlockId {
                hash: hash(&[block]),
                part_set_header: PartSetHeader {
                    total: 1,
                    hash: hash(&[block, block]),
                },
            },
            timestamp: 3,
            validator_address: voter.address,
            validator_index: index,
            signature: Default::default(),
        };
        vote.sign("halcyon", key);
        vote
    }

    #[test]
    fn test_conflicting_votes_become_evidence() {
        let mut fixture = fixture();
        let mut pool = EvidencePool::new();

        // Votes of an uncommitted height stay buffered
        let mut future = vote(&fixture, 0, 1);
        future.height = 2;
        pool.report_conflicting_votes(future.clone(), future);
        pool.report_conflicting_votes(vote(&fixture, 1, 2), vote(&fixture, 1, 1));
        pool.update(&fixture.state, &[], &fixture.store);
        assert_eq!(pool.size(), 1);

        let (evidence, size) = pool.pending_evidence(i64::MAX);
        assert_eq!(evidence.len(), 1);
        assert_eq!(size, evidence[0].encode_size() as i64);
        assert_eq!(evidence[0].timestamp, 7);
        assert!(evidence[0].validate_basic().is_ok());
        assert!(pool.pending_evidence(1).0.is_empty());

        pool.check_evidence(&evidence, &fixture.state, &fixture.store)
            .unwrap();
        assert!(pool
            .check_evidence(
                &[evidence[0].clone(), evidence[0].clone()],
                &fixture.state,
                &fixture.store
            )
            .is_err());

        // Committed evidence is removed and can't be included again
        fixture.state.last_block_height = 2;
        pool.update(&fixture.state, &evidence, &fixture.store);
        assert_eq!(pool.size(), 0);
        assert!(pool
            .check_evidence(&evidence, &fixture.state, &fixture.store)
            .is_err());
    }

    #[test]
    fn test_add_evidence_verifies() {
        let fixture = fixture();
        let mut pool = EvidencePool::new();
        let voters = fixture.state.last_voters.clone();
        let evidence =
            DuplicateVoteEvidence::new(vote(&fixture, 2, 1), vote(&fixture, 2, 2), 7, &voters)
                .unwrap();

        let mut forged = evidence.clone();
        forged.vote_b.signature = forged.vote_a.signature.clone();
        assert!(pool
            .add_evidence(forged, &fixture.state, &fixture.store)
            .is_err());

        let mut wrong_power = evidence.clone();
        wrong_power.validator_power += 1;
        assert!(pool
            .add_evidence(wrong_power, &fixture.state, &fixture.store)
            .is_err());

        pool.add_evidence(evidence.clone(), &fixture.state, &fixture.store)
            .unwrap();
        pool.add_evidence(evidence, &fixture.state, &fixture.store)
            .unwrap();
        assert_eq!(pool.size(), 1);
    }
}
