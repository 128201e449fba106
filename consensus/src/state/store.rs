use super::State;
use crate::{
    abci::AbciResponses,
    types::{select_voter, ConsensusParams, ValidatorSet, VoterParams, VoterSet},
    Error,
};
use bytes::BufMut;
use halcyon_codec::{DecodeExt, Encode, FixedSize, Read};
use halcyon_cryptography::utils::hex;
use halcyon_runtime::Storage;
use halcyon_storage::metadata::Metadata;
use tracing::debug;

/// Durable store of the chain state and the per-height data needed to rebuild it.
pub trait StateStore: Send + 'static {
    /// Loads the last saved state, if any.
    fn load(&self) -> Result<Option<State>, Error>;

    /// Durably stores `state` along with the validators, consensus params and proof hash
    /// used by the next height.
    fn save(&mut self, state: &State) -> Result<(), Error>;

    fn load_validators(&self, height: u64) -> Result<ValidatorSet, Error>;

    /// Proof hash seeding the voter election and proposer selection at `height`.
    fn load_proof_hash(&self, height: u64) -> Result<Vec<u8>, Error>;

    /// Voters of `height`, elected again from the stored validators and proof hash.
    fn load_voters(&self, height: u64, params: &VoterParams) -> Result<VoterSet, Error> {
        let validators = self.load_validators(height)?;
        let proof_hash = self.load_proof_hash(height)?;
        Ok(select_voter(&validators, &proof_hash, params))
    }

    fn load_consensus_params(&self, height: u64) -> Result<ConsensusParams, Error>;

    /// Stores the application's responses to the execution of the block at `height`.
    fn save_abci_responses(&mut self, height: u64, responses: &AbciResponses)
        -> Result<(), Error>;

    fn load_abci_responses(&self, height: u64) -> Result<AbciResponses, Error>;

    /// Removes the per-height data below `retain_height`.
    fn prune_states(&mut self, retain_height: u64) -> Result<(), Error>;
}

const STATE: &[u8] = b"state";
const VALIDATORS: u8 = b'V';
const PROOF_HASH: u8 = b'F';
const PARAMS: u8 = b'K';
const RESPONSES: u8 = b'A';

fn key(prefix: u8, height: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + u64::SIZE);
    key.push(prefix);
    key.put_u64(height);
    key
}

fn load<T: Read<Cfg = ()>, S: Storage>(
    metadata: &Metadata<S>,
    key: &[u8],
) -> Result<Option<T>, Error> {
    metadata
        .get(key)
        .map(|raw| T::decode(raw.clone()))
        .transpose()
        .map_err(Error::from)
}

impl<S: Storage> StateStore for Metadata<S> {
    fn load(&self) -> Result<Option<State>, Error> {
        load(self, STATE)
    }

    fn save(&mut self, state: &State) -> Result<(), Error> {
        let next = state.next_height();
        self.put(key(VALIDATORS, next), state.validators.encode().freeze());
        self.put(
            key(VALIDATORS, next + 1),
            state.next_validators.encode().freeze(),
        );
        self.put(key(PARAMS, next), state.consensus_params.encode().freeze());
        self.put(key(PROOF_HASH, next), state.last_proof_hash.clone());
        self.put(STATE.to_vec(), state.encode().freeze());
        self.sync()?;
        debug!(
            height = state.last_block_height,
            app_hash = %hex(&state.app_hash),
            "saved state"
        );
        Ok(())
    }

    fn load_validators(&self, height: u64) -> Result<ValidatorSet, Error> {
        load(self, &key(VALIDATORS, height))?.ok_or(Error::NoValidatorSetForHeight(height))
    }

    fn load_proof_hash(&self, height: u64) -> Result<Vec<u8>, Error> {
        self.get(&key(PROOF_HASH, height))
            .map(|raw| raw.to_vec())
            .ok_or(Error::NoProofHashForHeight(height))
    }

    fn load_consensus_params(&self, height: u64) -> Result<ConsensusParams, Error> {
        load(self, &key(PARAMS, height))?.ok_or(Error::NoConsensusParamsForHeight(height))
    }

    fn save_abci_responses(
        &mut self,
        height: u64,
        responses: &AbciResponses,
    ) -> Result<(), Error> {
        self.put(key(RESPONSES, height), responses.encode().freeze());
        self.sync()?;
        Ok(())
    }

    fn load_abci_responses(&self, height: u64) -> Result<AbciResponses, Error> {
        load(self, &key(RESPONSES, height))?.ok_or(Error::NoAbciResponsesForHeight(height))
    }

    fn prune_states(&mut self, retain_height: u64) -> Result<(), Error> {
        let stale: Vec<Vec<u8>> = self
            .keys()
            .filter(|key| {
                key.len() == 1 + u64::SIZE
                    && matches!(key[0], VALIDATORS | PROOF_HASH | PARAMS | RESPONSES)
                    && u64::from_be_bytes(key[1..].try_into().unwrap_or([u8::MAX; 8]))
                        < retain_height
            })
            .cloned()
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        for key in &stale {
            self.remove(key);
        }
        self.sync()?;
        debug!(retain_height, removed = stale.len(), "pruned states");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abci::ResponseDeliverTx,
        state::Genesis,
        types::{Validator, VoterParams},
    };
    use bytes::Bytes;
    use halcyon_cryptography::{KeyType, PrivateKey};
    use halcyon_macros::test_traced;
    use halcyon_runtime::storage::memory;
    use halcyon_storage::metadata::Config;

    fn open(storage: &memory::Storage) -> Metadata<memory::Storage> {
        Metadata::init(
            storage.clone(),
            Config {
                partition: "state".into(),
            },
        )
        .unwrap()
    }

    fn state(validators: u64) -> State {
        let genesis = Genesis {
            genesis_time: 5,
            chain_id: "halcyon".into(),
            initial_height: 1,
            validators: (0..validators)
                .map(|i| {
                    let key = PrivateKey::from_seed(KeyType::Ed25519, i);
                    Validator::new(key.public_key(), 10 + i as i64)
                })
                .collect(),
            ..Default::default()
        };
        State::from_genesis(&genesis).unwrap()
    }

    #[test_traced]
    fn test_save_load() {
        let storage = memory::Storage::default();
        let mut store = open(&storage);
        assert!(store.load().unwrap().is_none());
        assert!(matches!(
            store.load_validators(1),
            Err(Error::NoValidatorSetForHeight(1))
        ));
        assert!(matches!(
            store.load_proof_hash(1),
            Err(Error::NoProofHashForHeight(1))
        ));

        let mut state = state(4);
        store.save(&state).unwrap();
        assert_eq!(store.load_validators(1).unwrap(), state.validators);
        assert_eq!(store.load_validators(2).unwrap(), state.next_validators);
        assert!(store.load_proof_hash(1).unwrap().is_empty());
        assert_eq!(
            store.load_voters(1, &state.voter_params).unwrap(),
            state.voters
        );
        assert_eq!(
            store.load_consensus_params(1).unwrap(),
            state.consensus_params
        );

        // Advance a height
        state.last_block_height = 1;
        state.last_proof_hash = Bytes::from_static(&[3; 32]);
        store.save(&state).unwrap();
        assert_eq!(store.load_proof_hash(2).unwrap(), vec![3; 32]);
        assert!(store.load_consensus_params(3).is_err());

        // Survives a restart
        store.close().unwrap();
        let store = open(&storage);
        assert_eq!(store.load().unwrap().unwrap(), state);
    }

    #[test]
    fn test_voters_are_elected_from_proof_hash() {
        let storage = memory::Storage::default();
        let mut store = open(&storage);
        let mut state = state(50);
        state.last_block_height = 9;
        state.last_proof_hash = Bytes::from_static(&[9; 32]);
        store.save(&state).unwrap();

        let params = VoterParams {
            voter_election_threshold: 5,
            max_tolerable_byzantine_percentage: 20,
        };
        let voters = store.load_voters(10, &params).unwrap();
        assert!(voters.size() < 50);
        assert_eq!(voters, select_voter(&state.validators, &[9; 32], &params));
        assert!(matches!(
            store.load_voters(11, &params),
            Err(Error::NoProofHashForHeight(11))
        ));
    }

    #[test]
    fn test_abci_responses_and_prune() {
        let storage = memory::Storage::default();
        let mut store = open(&storage);
        assert!(matches!(
            store.load_abci_responses(1),
            Err(Error::NoAbciResponsesForHeight(1))
        ));

        let responses = AbciResponses {
            deliver_txs: vec![ResponseDeliverTx {
                data: Bytes::from_static(b"ok"),
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut state = state(2);
        for height in 1..=3 {
            store.save_abci_responses(height, &responses).unwrap();
            state.last_block_height = height;
            store.save(&state).unwrap();
        }
        assert_eq!(store.load_abci_responses(2).unwrap(), responses);

        store.prune_states(3).unwrap();
        assert!(store.load_abci_responses(2).is_err());
        assert!(store.load_validators(2).is_err());
        assert!(store.load_abci_responses(3).is_ok());
        assert!(store.load_validators(4).is_ok());
        assert!(store.load().unwrap().is_some());
    }
}
