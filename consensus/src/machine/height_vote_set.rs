use crate::{
    types::{BlockId, SignedMsgType, Vote, VoteSet, VoterSet},
    Error,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::debug;

/// Rounds beyond the current one a single peer may make us track.
const MAX_CATCHUP_ROUNDS_PER_PEER: usize = 2;

struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/// Prevotes and precommits of every round of a height.
///
/// Rounds up to the current round plus one are tracked for everyone. Votes for later rounds
/// are accepted from each peer for at most two rounds, so a peer can't make us track an
/// unbounded number of rounds.
pub struct HeightVoteSet {
    chain_id: String,
    height: u64,
    voters: Arc<VoterSet>,

    round: u32,
    round_vote_sets: BTreeMap<u32, RoundVoteSet>,
    peer_catchup_rounds: HashMap<String, Vec<u32>>,
}

impl HeightVoteSet {
    pub fn new(chain_id: &str, height: u64, voters: Arc<VoterSet>) -> Self {
        let mut set = Self {
            chain_id: chain_id.to_string(),
            height,
            voters,
            round: 0,
            round_vote_sets: BTreeMap::new(),
            peer_catchup_rounds: HashMap::new(),
        };
        set.add_round(0);
        set
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    /// Tracks every round up to `round`.
    ///
    /// # Panics
    ///
    /// Panics if `round` moves backwards.
    pub fn set_round(&mut self, round: u32) {
        assert!(
            self.round == 0 || round > self.round,
            "set_round must increment the round ({} -> {round})",
            self.round
        );
        for r in self.round.saturating_sub(1)..=round {
            self.add_round(r);
        }
        self.round = round;
    }

    fn add_round(&mut self, round: u32) {
        if self.round_vote_sets.contains_key(&round) {
            return;
        }
        let new = |vote_type| {
            VoteSet::new(
                &self.chain_id,
                self.height,
                round,
                vote_type,
                self.voters.clone(),
            )
        };
        let set = RoundVoteSet {
            prevotes: new(SignedMsgType::Prevote),
            precommits: new(SignedMsgType::Precommit),
        };
        self.round_vote_sets.insert(round, set);
    }

    /// Adds a vote received from `peer` (none for our own votes).
    pub fn add_vote(&mut self, vote: Vote, peer: Option<&str>) -> Result<bool, Error> {
        if !vote.vote_type.is_vote() {
            return Err(Error::UnexpectedVote(format!(
                "invalid vote type {}",
                vote.vote_type
            )));
        }
        if !self.round_vote_sets.contains_key(&vote.round) {
            if let Some(peer) = peer {
                let rounds = self.peer_catchup_rounds.entry(peer.to_string()).or_default();
                if rounds.len() >= MAX_CATCHUP_ROUNDS_PER_PEER {
                    debug!(peer, round = vote.round, "peer sent votes for too many rounds");
                    return Err(Error::TooManyCatchupRounds {
                        peer: peer.to_string(),
                    });
                }
                rounds.push(vote.round);
            }
            self.add_round(vote.round);
        }
        let Some(set) = self.vote_set_mut(vote.round, vote.vote_type) else {
            return Ok(false);
        };
        set.add_vote(vote)
    }

    fn vote_set_mut(&mut self, round: u32, vote_type: SignedMsgType) -> Option<&mut VoteSet> {
        let set = self.round_vote_sets.get_mut(&round)?;
        match vote_type {
            SignedMsgType::Prevote => Some(&mut set.prevotes),
            SignedMsgType::Precommit => Some(&mut set.precommits),
            SignedMsgType::Proposal => None,
        }
    }

    pub fn prevotes(&self, round: u32) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|set| &set.prevotes)
    }

    pub fn precommits(&self, round: u32) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|set| &set.precommits)
    }

    /// Last round (at most the current one) with a two-thirds prevote majority, and the block
    /// it is for.
    pub fn pol_info(&self) -> Option<(u32, BlockId)> {
        self.round_vote_sets
            .range(..=self.round)
            .rev()
            .find_map(|(round, set)| Some((*round, set.prevotes.two_thirds_majority()?)))
    }

    /// Records that `peer` claims a two-thirds majority for `block_id` in `round`.
    ///
    /// Claims for rounds that aren't tracked are ignored.
    pub fn set_peer_maj23(
        &mut self,
        round: u32,
        vote_type: SignedMsgType,
        peer: &str,
        block_id: BlockId,
    ) -> Result<(), Error> {
        if !vote_type.is_vote() {
            return Err(Error::UnexpectedVote(format!(
                "invalid vote type {vote_type}"
            )));
        }
        match self.vote_set_mut(round, vote_type) {
            Some(set) => set.set_peer_maj23(peer, block_id),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PartSetHeader, Validator};
    use bytes::Bytes;
    use halcyon_cryptography::{hash, KeyType, PrivateKey};

    fn setup(n: u64) -> (Vec<PrivateKey>, Arc<VoterSet>) {
        let keys: Vec<PrivateKey> = (0..n)
            .map(|i| PrivateKey::from_seed(KeyType::Ed25519, i))
            .collect();
        let voters = VoterSet::new(
            keys.iter()
                .map(|key| Validator::new(key.public_key(), 10))
                .collect(),
        );
        (keys, Arc::new(voters))
    }

    fn vote(
        keys: &[PrivateKey],
        voters: &VoterSet,
        index: u32,
        vote_type: SignedMsgType,
        round: u32,
        block_id: BlockId,
    ) -> Vote {
        let voter = voters.get_by_index(index).unwrap();
        let key = keys
            .iter()
            .find(|key| key.public_key() == voter.pub_key)
            .unwrap();
        let mut vote = Vote {
            vote_type,
            height: 1,
            round,
            block_id,
            timestamp: 1,
            validator_address: voter.address,
            validator_index: index,
            signature: Bytes::new(),
        };
        vote.sign("halcyon", key);
        vote
    }

    fn block(seed: u8) -> BlockId {
        BlockId {
            hash: hash(&[seed]),
            part_set_header: PartSetHeader {
                total: 1,
                hash: hash(&[seed, seed]),
            },
        }
    }

    #[test]
    fn test_peer_catchup_rounds_are_limited() {
        let (keys, voters) = setup(4);
        let mut set = HeightVoteSet::new("halcyon", 1, voters.clone());

        for round in [999, 1000] {
            let vote = vote(&keys, &voters, 0, SignedMsgType::Prevote, round, block(1));
            assert!(set.add_vote(vote, Some("peer1")).unwrap());
        }
        let third = vote(&keys, &voters, 0, SignedMsgType::Prevote, 1001, block(1));
        assert!(matches!(
            set.add_vote(third.clone(), Some("peer1")),
            Err(Error::TooManyCatchupRounds { .. })
        ));

        // Another peer has its own allowance and tracked rounds stay open to everyone
        assert!(set.add_vote(third, Some("peer2")).unwrap());
        let tracked = vote(&keys, &voters, 1, SignedMsgType::Prevote, 999, block(1));
        assert!(set.add_vote(tracked, Some("peer1")).unwrap());
    }

    #[test]
    fn test_pol_info() {
        let (keys, voters) = setup(4);
        let mut set = HeightVoteSet::new("halcyon", 1, voters.clone());
        assert_eq!(set.pol_info(), None);

        set.set_round(2);
        for index in 0..3 {
            let vote = vote(&keys, &voters, index, SignedMsgType::Prevote, 1, block(7));
            set.add_vote(vote, None).unwrap();
        }
        assert_eq!(set.pol_info(), Some((1, block(7))));

        // A later polka (even for nil) takes precedence
        for index in 0..3 {
            let vote = vote(&keys, &voters, index, SignedMsgType::Prevote, 2, BlockId::nil());
            set.add_vote(vote, None).unwrap();
        }
        assert_eq!(set.pol_info(), Some((2, BlockId::nil())));
        assert!(set.precommits(2).unwrap().two_thirds_majority().is_none());
    }

    #[test]
    fn test_set_peer_maj23() {
        let (keys, voters) = setup(4);
        let mut set = HeightVoteSet::new("halcyon", 1, voters.clone());
        set.set_peer_maj23(0, SignedMsgType::Precommit, "peer", block(1))
            .unwrap();
        assert!(set
            .set_peer_maj23(0, SignedMsgType::Precommit, "peer", block(2))
            .is_err());
        assert!(set
            .set_peer_maj23(0, SignedMsgType::Proposal, "peer", block(2))
            .is_err());
        set.set_peer_maj23(5, SignedMsgType::Prevote, "peer", block(2))
            .unwrap();

        // The claimed block is tracked even for a conflicting vote
        let first = vote(&keys, &voters, 0, SignedMsgType::Precommit, 0, block(2));
        assert!(set.add_vote(first, None).unwrap());
        let second = vote(&keys, &voters, 0, SignedMsgType::Precommit, 0, block(1));
        match set.add_vote(second, None) {
            Err(Error::ConflictingVotes(conflict)) => assert!(conflict.added),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "set_round must increment the round")]
    fn test_set_round_backwards_panics() {
        let (_, voters) = setup(1);
        let mut set = HeightVoteSet::new("halcyon", 1, voters);
        set.set_round(3);
        set.set_round(2);
    }
}
