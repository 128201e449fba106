//! Election of the voters entitled to vote at a height.
//!
//! When the validator set is larger than the election threshold, voters are sampled without
//! replacement (weighted by voting power) from a generator seeded by the previous block's
//! VRF output. The number of voters is the smallest sample that keeps the probability of a
//! third or more byzantine voters below [ELECTION_ACCURACY], given the tolerated byzantine
//! fraction of the whole set.

use super::{merkle::hash_from_byte_slices, BlockId, Commit, Validator, ValidatorSet, VoterParams};
use crate::Error;
use bytes::{Buf, BufMut};
use halcyon_codec::{EncodeSize, Error as CodecError, RangeCfg, Read, Write};
use halcyon_cryptography::{bls12381, hash, Address, Digest, PublicKey};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Upper bound on the probability that a third of the elected voters are byzantine.
pub const ELECTION_ACCURACY: f64 = 1e-5;

/// The subset of validators entitled to vote at a height.
///
/// The total voting weight of the voters is the denominator for all quorums.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VoterSet {
    voters: Vec<Validator>,
    total_voting_weight: i64,
}

impl VoterSet {
    /// Wraps `voters` (expected in validator set order).
    pub fn new(voters: Vec<Validator>) -> Self {
        let total_voting_weight = voters.iter().map(|val| val.voting_weight).sum();
        Self {
            voters,
            total_voting_weight,
        }
    }

    /// Every validator votes with a weight equal to its power.
    pub fn all(validators: &ValidatorSet) -> Self {
        Self::new(
            validators
                .validators()
                .iter()
                .cloned()
                .map(|mut val| {
                    val.voting_weight = val.voting_power;
                    val
                })
                .collect(),
        )
    }

    pub fn voters(&self) -> &[Validator] {
        &self.voters
    }

    pub fn size(&self) -> usize {
        self.voters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }

    pub fn total_voting_weight(&self) -> i64 {
        self.total_voting_weight
    }

    /// Weight strictly above two thirds of the total.
    pub fn quorum(&self) -> i64 {
        self.total_voting_weight * 2 / 3 + 1
    }

    pub fn get_by_index(&self, index: u32) -> Option<&Validator> {
        self.voters.get(index as usize)
    }

    pub fn get_by_address(&self, address: &Address) -> Option<(u32, &Validator)> {
        self.voters
            .iter()
            .enumerate()
            .find(|(_, val)| val.address == *address)
            .map(|(index, val)| (index as u32, val))
    }

    pub fn has_address(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    /// Merkle root over the voters' keys, powers and weights.
    pub fn hash(&self) -> Digest {
        let leaves: Vec<Vec<u8>> = self
            .voters
            .iter()
            .map(|val| {
                let mut leaf = val.hash_bytes();
                val.voting_weight.write(&mut leaf);
                leaf
            })
            .collect();
        hash_from_byte_slices(&leaves)
    }

    /// Verifies that `commit` is a valid commit of `block_id` at `height` by more than two
    /// thirds of the voting weight.
    ///
    /// Signatures left in their slots are verified one by one. Signatures that were folded
    /// into the aggregate are verified together against their individual messages.
    pub fn verify_commit(
        &self,
        chain_id: &str,
        block_id: &BlockId,
        height: u64,
        commit: &Commit,
    ) -> Result<(), Error> {
        if commit.signatures.len() != self.voters.len() {
            return Err(Error::InvalidCommit(format!(
                "wrong set size: {} vs {}",
                self.voters.len(),
                commit.signatures.len()
            )));
        }
        if commit.height != height {
            return Err(Error::InvalidCommit(format!(
                "wrong height: {} vs {}",
                height, commit.height
            )));
        }
        if commit.block_id != *block_id {
            return Err(Error::InvalidCommit(format!(
                "wrong block id: {} vs {}",
                block_id, commit.block_id
            )));
        }

        let mut tallied = 0i64;
        let mut aggregated_keys = Vec::new();
        let mut aggregated_messages = Vec::new();
        for (index, sig) in commit.signatures.iter().enumerate() {
            if sig.is_absent() {
                continue;
            }
            let voter = &self.voters[index];
            if voter.address != sig.validator_address {
                return Err(Error::InvalidCommit(format!(
                    "wrong validator address at {index}: {} vs {}",
                    voter.address, sig.validator_address
                )));
            }
            let message = commit
                .vote_sign_bytes(chain_id, index as u32)
                .ok_or_else(|| Error::InvalidCommit(format!("missing signature {index}")))?;
            match &sig.signature {
                Some(signature) => {
                    if !voter.pub_key.verify(&message, signature) {
                        return Err(Error::InvalidCommit(format!(
                            "wrong signature at {index}"
                        )));
                    }
                }
                None => match &voter.pub_key {
                    PublicKey::Bls12381(key) => {
                        aggregated_keys.push(key);
                        aggregated_messages.push(message);
                    }
                    PublicKey::Ed25519(_) => {
                        return Err(Error::InvalidCommit(format!(
                            "signature {index} of a non-aggregatable key is missing"
                        )));
                    }
                },
            }
            if sig.for_block() {
                tallied += voter.voting_weight;
            }
        }

        match &commit.aggregated_signature {
            Some(aggregate) => {
                let pairs = aggregated_keys
                    .iter()
                    .copied()
                    .zip(aggregated_messages.iter().map(Vec::as_slice));
                bls12381::aggregate_verify_multiple_messages(pairs, aggregate).map_err(|err| {
                    Error::InvalidCommit(format!("invalid aggregated signature: {err}"))
                })?;
            }
            None if !aggregated_keys.is_empty() => {
                return Err(Error::InvalidCommit("missing aggregated signature".into()));
            }
            None => {}
        }

        let needed = self.total_voting_weight * 2 / 3;
        if tallied <= needed {
            return Err(Error::InvalidCommit(format!(
                "insufficient voting weight: got {tallied}, needed more than {needed}"
            )));
        }
        Ok(())
    }
}

impl Write for VoterSet {
    fn write(&self, buf: &mut impl BufMut) {
        self.voters.write(buf);
    }
}

impl EncodeSize for VoterSet {
    fn encode_size(&self) -> usize {
        self.voters.encode_size()
    }
}

impl Read for VoterSet {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let voters = Vec::<Validator>::read_cfg(
            buf,
            &(RangeCfg::from(..=super::validator::MAX_VALIDATORS), ()),
        )?;
        if voters.iter().any(|val| val.voting_weight < 0) {
            return Err(CodecError::Invalid("VoterSet", "negative voting weight"));
        }
        Ok(Self::new(voters))
    }
}

/// Elects the voters for a height from `validators`.
///
/// All validators vote when there is no proof hash yet or the set does not exceed the
/// election threshold.
pub fn select_voter(validators: &ValidatorSet, proof_hash: &[u8], params: &VoterParams) -> VoterSet {
    let n = validators.size();
    if proof_hash.is_empty() || n <= params.voter_election_threshold as usize {
        return VoterSet::all(validators);
    }

    let elect = voters_to_elect(n, params.max_tolerable_byzantine_percentage)
        .max(params.voter_election_threshold as usize)
        .min(n);
    let mut rng = ChaCha20Rng::from_seed(hash(proof_hash).into());
    let mut candidates: Vec<&Validator> = validators.validators().iter().collect();
    let mut winners = Vec::with_capacity(elect);
    for _ in 0..elect {
        let total: u64 = candidates.iter().map(|val| val.voting_power as u64).sum();
        let target = rng.gen_range(0..total);
        let mut cumulative = 0u64;
        let index = candidates
            .iter()
            .position(|val| {
                cumulative += val.voting_power as u64;
                target < cumulative
            })
            .unwrap_or(candidates.len() - 1);
        winners.push(candidates.remove(index));
    }

    // Keep validator set order
    let voters: Vec<Validator> = validators
        .validators()
        .iter()
        .filter(|val| winners.iter().any(|winner| winner.address == val.address))
        .cloned()
        .map(|mut val| {
            val.voting_weight = val.voting_power;
            val
        })
        .collect();
    VoterSet::new(voters)
}

/// Natural logarithms of `0!..=n!`.
fn ln_factorials(n: usize) -> Vec<f64> {
    let mut table = Vec::with_capacity(n + 1);
    table.push(0.0);
    for i in 1..=n {
        table.push(table[i - 1] + (i as f64).ln());
    }
    table
}

fn ln_choose(table: &[f64], n: usize, k: usize) -> f64 {
    table[n] - table[k] - table[n - k]
}

/// Smallest number of voters to sample from `n` validators (of which
/// `byzantine_percentage` percent are byzantine) such that the probability of sampling a
/// third or more byzantine voters is below [ELECTION_ACCURACY].
pub fn voters_to_elect(n: usize, byzantine_percentage: u32) -> usize {
    assert!(byzantine_percentage <= 100, "invalid byzantine percentage");
    let byzantine = n * byzantine_percentage as usize / 100;
    let table = ln_factorials(n);
    for k in 1..=n {
        // Sampling `k` is unsafe once `ceil(k / 3)` byzantine voters are drawn
        let unsafe_from = k.div_ceil(3);
        let mut probability = 0.0;
        for x in unsafe_from..=k.min(byzantine) {
            if k - x > n - byzantine {
                continue;
            }
            let ln = ln_choose(&table, byzantine, x) + ln_choose(&table, n - byzantine, k - x)
                - ln_choose(&table, n, k);
            probability += ln.exp();
        }
        if probability < ELECTION_ACCURACY {
            return k;
        }
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockIdFlag, CommitSig, PartSetHeader, SignedMsgType, Vote};
    use bytes::Bytes;
    use halcyon_codec::{DecodeExt, Encode};
    use halcyon_cryptography::{KeyType, PrivateKey};
    use test_case::test_case;

    fn validators(n: usize, key_type: KeyType) -> (Vec<PrivateKey>, ValidatorSet) {
        let keys: Vec<PrivateKey> = (0..n)
            .map(|i| PrivateKey::from_seed(key_type, i as u64))
            .collect();
        let set = ValidatorSet::new(
            keys.iter()
                .enumerate()
                .map(|(i, key)| Validator::new(key.public_key(), 10 + i as i64))
                .collect(),
        )
        .unwrap();
        (keys, set)
    }

    fn block_id() -> BlockId {
        BlockId {
            hash: hash(b"block"),
            part_set_header: PartSetHeader {
                total: 1,
                hash: hash(b"parts"),
            },
        }
    }

    fn signed_commit(keys: &[PrivateKey], voters: &VoterSet, signers: usize) -> Commit {
        let mut signatures = Vec::new();
        for (index, voter) in voters.voters().iter().enumerate() {
            if index >= signers {
                signatures.push(CommitSig::absent());
                continue;
            }
            let key = keys
                .iter()
                .find(|key| key.public_key().address() == voter.address)
                .unwrap();
            let mut vote = Vote {
                vote_type: SignedMsgType::Precommit,
                height: 5,
                round: 0,
                block_id: block_id(),
                timestamp: 1000 + index as u64,
                validator_address: voter.address,
                validator_index: index as u32,
                signature: Bytes::new(),
            };
            vote.sign("chain", key);
            signatures.push(vote.commit_sig());
        }
        Commit {
            height: 5,
            round: 0,
            block_id: block_id(),
            signatures,
            aggregated_signature: None,
        }
    }

    #[test]
    fn test_select_all_below_threshold() {
        let (_, set) = validators(5, KeyType::Ed25519);
        let params = VoterParams {
            voter_election_threshold: 5,
            max_tolerable_byzantine_percentage: 20,
        };
        let voters = select_voter(&set, b"proof", &params);
        assert_eq!(voters.size(), 5);
        assert_eq!(voters.total_voting_weight(), set.total_voting_power());

        // No proof hash yet
        let params = VoterParams {
            voter_election_threshold: 1,
            max_tolerable_byzantine_percentage: 20,
        };
        assert_eq!(select_voter(&set, &[], &params).size(), 5);
    }

    #[test]
    fn test_select_voter_deterministic() {
        let (_, set) = validators(30, KeyType::Ed25519);
        let params = VoterParams {
            voter_election_threshold: 3,
            max_tolerable_byzantine_percentage: 20,
        };
        let a = select_voter(&set, b"proof", &params);
        let b = select_voter(&set, b"proof", &params);
        assert_eq!(a, b);
        assert!(a.size() >= 3 && a.size() <= 30);
        assert_eq!(a.size(), voters_to_elect(30, 20).max(3));

        // Voters keep validator set order and are members
        let positions: Vec<u32> = a
            .voters()
            .iter()
            .map(|voter| set.get_by_address(&voter.address).unwrap().0)
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test_case(10, 0 => 1; "no byzantine")]
    #[test_case(10, 33 => 10; "too many byzantine")]
    fn test_voters_to_elect_bounds(n: usize, pct: u32) -> usize {
        voters_to_elect(n, pct)
    }

    #[test]
    fn test_voters_to_elect_monotonic() {
        let low = voters_to_elect(100, 10);
        let high = voters_to_elect(100, 20);
        assert!(low <= high);
        assert!(high <= 100);
        assert!(low > 1);
    }

    #[test]
    fn test_verify_commit_individual() {
        let (keys, set) = validators(4, KeyType::Ed25519);
        let voters = VoterSet::all(&set);

        // Three of four signers is enough
        let commit = signed_commit(&keys, &voters, 3);
        voters.verify_commit("chain", &block_id(), 5, &commit).unwrap();

        // Two of four is not
        let commit = signed_commit(&keys, &voters, 2);
        assert!(matches!(
            voters.verify_commit("chain", &block_id(), 5, &commit),
            Err(Error::InvalidCommit(_))
        ));

        // Wrong chain
        let commit = signed_commit(&keys, &voters, 4);
        assert!(voters.verify_commit("other", &block_id(), 5, &commit).is_err());

        // Wrong height
        assert!(voters.verify_commit("chain", &block_id(), 6, &commit).is_err());
    }

    #[test]
    fn test_verify_commit_aggregated() {
        let (keys, set) = validators(4, KeyType::Bls12381);
        let voters = VoterSet::all(&set);
        let mut commit = signed_commit(&keys, &voters, 4);
        let signatures: Vec<Bytes> = commit
            .signatures
            .iter_mut()
            .map(|sig| sig.signature.take().unwrap())
            .collect();
        let aggregate =
            bls12381::aggregate_signatures(signatures.iter().map(|sig| sig.as_ref())).unwrap();
        commit.aggregated_signature = Some(Bytes::copy_from_slice(&aggregate));
        voters.verify_commit("chain", &block_id(), 5, &commit).unwrap();

        // A missing aggregate is rejected
        let mut missing = commit.clone();
        missing.aggregated_signature = None;
        assert!(voters.verify_commit("chain", &block_id(), 5, &missing).is_err());

        // A changed timestamp breaks the aggregate
        let mut tampered = commit.clone();
        tampered.signatures[1].timestamp += 1;
        assert!(voters.verify_commit("chain", &block_id(), 5, &tampered).is_err());
        assert_eq!(tampered.signatures[1].flag, BlockIdFlag::Commit);
    }

    #[test]
    fn test_voter_set_codec() {
        let (_, set) = validators(3, KeyType::Ed25519);
        let voters = VoterSet::all(&set);
        let decoded = VoterSet::decode(voters.encode()).unwrap();
        assert_eq!(decoded, voters);
        assert_eq!(decoded.hash(), voters.hash());
    }
}
