//! Chain state after the last committed block and the machinery that advances it.

mod evidence;
mod execution;
mod store;
mod validation;

use crate::{
    types::{
        select_voter, Block, BlockId, Commit, ConsensusParams, DuplicateVoteEvidence, PartSet,
        Validator, ValidatorSet, Version, VoterParams, VoterSet, BLOCK_PART_SIZE,
        BLOCK_PROTOCOL, MAX_APP_HASH_SIZE, MAX_CHAIN_ID_LENGTH,
    },
    Error,
};
use bytes::{Buf, BufMut, Bytes};
use halcyon_codec::{EncodeSize, Error as CodecError, FixedSize, RangeCfg, Read, ReadExt, Write};
use halcyon_cryptography::{Address, Digest};

pub use evidence::EvidencePool;
pub use execution::{exec_commit_block, validate_validator_updates, BlockExecutor};
pub use store::StateStore;
pub use validation::validate_block;

/// Parameters of a chain at its first block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Genesis {
    /// Milliseconds since the UNIX epoch.
    pub genesis_time: u64,
    pub chain_id: String,
    pub initial_height: u64,
    pub consensus_params: ConsensusParams,
    pub voter_params: VoterParams,

    /// May be empty if the application provides the validators in `InitChain`.
    pub validators: Vec<Validator>,
    pub app_hash: Bytes,
    pub app_state: Bytes,
}

impl Genesis {
    pub fn validate(&self) -> Result<(), Error> {
        if self.chain_id.is_empty() || self.chain_id.len() > MAX_CHAIN_ID_LENGTH {
            return Err(Error::InvalidBlock(format!(
                "chain id must be between 1 and {MAX_CHAIN_ID_LENGTH} bytes: {:?}",
                self.chain_id
            )));
        }
        if self.initial_height == 0 {
            return Err(Error::InvalidBlock("initial height must be at least 1".into()));
        }
        if self.app_hash.len() > MAX_APP_HASH_SIZE {
            return Err(Error::InvalidBlock(format!(
                "app hash too long: {}",
                self.app_hash.len()
            )));
        }
        self.consensus_params.validate()?;
        self.voter_params.validate()?;
        for val in &self.validators {
            if val.voting_power <= 0 {
                return Err(Error::InvalidValidatorUpdate(format!(
                    "genesis validator {} has no power",
                    val.address
                )));
            }
            if !self.consensus_params.validator.is_allowed(val.pub_key.key_type()) {
                return Err(Error::InvalidValidatorUpdate(format!(
                    "genesis validator {} uses a disallowed key type",
                    val.address
                )));
            }
        }
        Ok(())
    }
}

/// The latest committed state of the chain.
///
/// Everything needed to validate and execute the next block. A new `State` is produced by
/// [BlockExecutor::apply_block] for every block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct State {
    pub version: Version,
    pub chain_id: String,
    pub initial_height: u64,

    /// Zero before the first block.
    pub last_block_height: u64,
    pub last_block_id: BlockId,
    /// Time of the last block (the genesis time before the first block).
    pub last_block_time: u64,

    /// Validators of the next block, the one after it and the last block.
    pub validators: ValidatorSet,
    pub next_validators: ValidatorSet,
    pub last_validators: ValidatorSet,
    pub last_height_validators_changed: u64,

    /// Voters elected for the next block and those of the last block.
    pub voters: VoterSet,
    pub last_voters: VoterSet,
    pub voter_params: VoterParams,

    pub consensus_params: ConsensusParams,
    pub last_height_consensus_params_changed: u64,

    pub last_results_hash: Digest,
    /// Application hash after the last block.
    pub app_hash: Bytes,
    /// VRF output of the last block's proposer (empty before the first block).
    pub last_proof_hash: Bytes,
}

impl State {
    /// Builds the state before the first block.
    pub fn from_genesis(genesis: &Genesis) -> Result<Self, Error> {
        genesis.validate()?;
        let validators = ValidatorSet::new(genesis.validators.clone())?;
        let mut next_validators = validators.clone();
        if !next_validators.is_empty() {
            next_validators.increment_proposer_priority(1);
        }
        let voters = select_voter(&validators, &[], &genesis.voter_params);
        Ok(Self {
            version: Version {
                block: BLOCK_PROTOCOL,
                app: genesis.consensus_params.app_version,
            },
            chain_id: genesis.chain_id.clone(),
            initial_height: genesis.initial_height,
            last_block_height: 0,
            last_block_id: BlockId::nil(),
            last_block_time: genesis.genesis_time,
            validators,
            next_validators,
            last_validators: ValidatorSet::default(),
            last_height_validators_changed: genesis.initial_height,
            voters,
            last_voters: VoterSet::default(),
            voter_params: genesis.voter_params,
            consensus_params: genesis.consensus_params.clone(),
            last_height_consensus_params_changed: genesis.initial_height,
            last_results_hash: Digest::default(),
            app_hash: genesis.app_hash.clone(),
            last_proof_hash: Bytes::new(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Height of the next block.
    pub fn next_height(&self) -> u64 {
        if self.last_block_height == 0 {
            self.initial_height
        } else {
            self.last_block_height + 1
        }
    }

    /// Message the proposer of `round` at the next height proves over.
    pub fn make_hash_message(&self, round: u32) -> Vec<u8> {
        let mut message = Vec::with_capacity(self.last_proof_hash.len() + 12);
        message.extend_from_slice(&self.last_proof_hash);
        message.put_u64(self.next_height());
        message.put_u32(round);
        message
    }

    /// Proposer of `round` at the next height.
    pub fn proposer(&self, round: u32) -> &Validator {
        self.validators
            .select_proposer(&self.last_proof_hash, self.next_height(), round)
    }

    /// Builds the block at `height` with this state's hashes.
    ///
    /// The block time is the genesis time for the initial height and the weighted median of
    /// the last commit's timestamps afterwards.
    #[allow(clippy::too_many_arguments)]
    pub fn make_block(
        &self,
        height: u64,
        txs: Vec<Bytes>,
        commit: Commit,
        evidence: Vec<DuplicateVoteEvidence>,
        proposer_address: Address,
        round: u32,
        proof: Bytes,
    ) -> (Block, PartSet) {
        let time = if height == self.initial_height {
            self.last_block_time
        } else {
            median_time(&commit, &self.last_voters)
        };
        let mut block = Block::new(height, txs, commit, evidence);
        let header = &mut block.header;
        header.version = self.version;
        header.chain_id = self.chain_id.clone();
        header.time = time;
        header.last_block_id = self.last_block_id;
        header.validators_hash = self.validators.hash();
        header.next_validators_hash = self.next_validators.hash();
        header.voters_hash = self.voters.hash();
        header.consensus_hash = self.consensus_params.hash();
        header.app_hash = self.app_hash.clone();
        header.last_results_hash = self.last_results_hash;
        header.proposer_address = proposer_address;
        header.round = round;
        header.proof = proof;
        block.fill_header();
        let parts = block.make_part_set(BLOCK_PART_SIZE);
        (block, parts)
    }
}

/// Weighted median of the timestamps in `commit`, weighted by the voting weight of each
/// signer in `voters`.
pub fn median_time(commit: &Commit, voters: &VoterSet) -> u64 {
    let mut weighted = Vec::with_capacity(commit.signatures.len());
    let mut total = 0i64;
    for sig in &commit.signatures {
        if sig.is_absent() {
            continue;
        }
        if let Some((_, voter)) = voters.get_by_address(&sig.validator_address) {
            total += voter.voting_weight;
            weighted.push((sig.timestamp, voter.voting_weight));
        }
    }
    weighted.sort_by_key(|(time, _)| *time);

    let mut median = total / 2;
    for (time, weight) in weighted {
        if median <= weight {
            return time;
        }
        median -= weight;
    }
    0
}

impl Write for State {
    fn write(&self, buf: &mut impl BufMut) {
        self.version.write(buf);
        self.chain_id.write(buf);
        self.initial_height.write(buf);
        self.last_block_height.write(buf);
        self.last_block_id.write(buf);
        self.last_block_time.write(buf);
        self.validators.write(buf);
        self.next_validators.write(buf);
        self.last_validators.write(buf);
        self.last_height_validators_changed.write(buf);
        self.voters.write(buf);
        self.last_voters.write(buf);
        self.voter_params.write(buf);
        self.consensus_params.write(buf);
        self.last_height_consensus_params_changed.write(buf);
        self.last_results_hash.write(buf);
        self.app_hash.write(buf);
        self.last_proof_hash.write(buf);
    }
}

impl EncodeSize for State {
    fn encode_size(&self) -> usize {
        self.version.encode_size()
            + self.chain_id.encode_size()
            + u64::SIZE * 5
            + self.last_block_id.encode_size()
            + self.validators.encode_size()
            + self.next_validators.encode_size()
            + self.last_validators.encode_size()
            + self.voters.encode_size()
            + self.last_voters.encode_size()
            + self.voter_params.encode_size()
            + self.consensus_params.encode_size()
            + Digest::SIZE
            + self.app_hash.encode_size()
            + self.last_proof_hash.encode_size()
    }
}

impl Read for State {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            version: Version::read(buf)?,
            chain_id: String::read_cfg(buf, &RangeCfg::from(..=MAX_CHAIN_ID_LENGTH))?,
            initial_height: u64::read(buf)?,
            last_block_height: u64::read(buf)?,
            last_block_id: BlockId::read(buf)?,
            last_block_time: u64::read(buf)?,
            validators: ValidatorSet::read(buf)?,
            next_validators: ValidatorSet::read(buf)?,
            last_validators: ValidatorSet::read(buf)?,
            last_height_validators_changed: u64::read(buf)?,
            voters: VoterSet::read(buf)?,
            last_voters: VoterSet::read(buf)?,
            voter_params: VoterParams::read(buf)?,
            consensus_params: ConsensusParams::read(buf)?,
            last_height_consensus_params_changed: u64::read(buf)?,
            last_results_hash: Digest::read(buf)?,
            app_hash: Bytes::read_cfg(buf, &RangeCfg::from(..=MAX_APP_HASH_SIZE))?,
            last_proof_hash: Bytes::read_cfg(buf, &RangeCfg::from(..=Digest::SIZE))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockIdFlag, CommitSig};
    use halcyon_codec::{DecodeExt, Encode};
    use halcyon_cryptography::{KeyType, PrivateKey};

    fn genesis(n: u64) -> Genesis {
        let validators = (0..n)
            .map(|i| {
                let key = PrivateKey::from_seed(KeyType::Ed25519, i);
                Validator::new(key.public_key(), 10)
            })
            .collect();
        Genesis {
            genesis_time: 1_000,
            chain_id: "halcyon".into(),
            initial_height: 1,
            validators,
            ..Default::default()
        }
    }

    #[test]
    fn test_from_genesis() {
        let state = State::from_genesis(&genesis(4)).unwrap();
        assert_eq!(state.next_height(), 1);
        assert_eq!(state.validators.size(), 4);
        assert_eq!(state.voters.size(), 4);
        assert!(state.last_voters.is_empty());
        assert_eq!(state.last_block_time, 1_000);
        assert_eq!(state.version.block, BLOCK_PROTOCOL);

        let decoded = State::decode(state.encode()).unwrap();
        assert_eq!(decoded, state);

        let mut invalid = genesis(1);
        invalid.initial_height = 0;
        assert!(State::from_genesis(&invalid).is_err());
        let mut invalid = genesis(1);
        invalid.chain_id = String::new();
        assert!(State::from_genesis(&invalid).is_err());
    }

    #[test]
    fn test_make_hash_message() {
        let mut state = State::from_genesis(&genesis(1)).unwrap();
        state.last_proof_hash = Bytes::from_static(&[0xaa; 4]);
        state.last_block_height = 6;
        let message = state.make_hash_message(2);
        assert_eq!(&message[..4], &[0xaa; 4]);
        assert_eq!(&message[4..12], &7u64.to_be_bytes());
        assert_eq!(&message[12..], &2u32.to_be_bytes());
    }

    #[test]
    fn test_median_time() {
        let state = State::from_genesis(&genesis(4)).unwrap();
        let voters = &state.voters;
        let sig = |index: usize, timestamp: u64| CommitSig {
            flag: BlockIdFlag::Commit,
            validator_address: voters.voters()[index].address,
            timestamp,
            signature: None,
        };
        let mut commit = Commit {
            height: 1,
            signatures: vec![sig(0, 50), sig(1, 10), sig(2, 40), sig(3, 20)],
            ..Default::default()
        };
        // Equal weights: first timestamp past half of the weight
        assert_eq!(median_time(&commit, voters), 20);

        // Absent signatures do not count
        commit.signatures[1] = CommitSig::absent();
        commit.signatures[3] = CommitSig::absent();
        assert_eq!(median_time(&commit, voters), 40);
    }

    #[test]
    fn test_make_block() {
        let state = State::from_genesis(&genesis(2)).unwrap();
        let proposer = state.proposer(0).address;
        let (block, parts) = state.make_block(
            1,
            vec![Bytes::from_static(b"a=b")],
            Commit::default(),
            Vec::new(),
            proposer,
            0,
            Bytes::from_static(&[1; 64]),
        );
        assert!(parts.is_complete());
        assert_eq!(block.header.time, 1_000);
        assert_eq!(block.header.chain_id, "halcyon");
        assert_eq!(block.header.voters_hash, state.voters.hash());
        assert_eq!(block.header.proposer_address, proposer);
        assert!(block.validate_basic().is_ok());
    }
}
