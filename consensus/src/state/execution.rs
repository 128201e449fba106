use super::{validate_block, EvidencePool, State, StateStore};
use crate::{
    abci::{
        AbciResponses, Client, LastCommitInfo, Misbehavior, RequestBeginBlock, RequestDeliverTx,
        RequestEndBlock, Response, ValidatorUpdate, VoteInfo,
    },
    mempool::Mempool,
    types::{
        select_voter, Block, BlockId, Commit, Event, EventBus, Header, PartSet, Validator,
        ValidatorParams, Version, Vote, VoterSet,
    },
    Error,
};
use bytes::Bytes;
use halcyon_codec::EncodeSize;
use halcyon_cryptography::{utils::hex, vrf, Address};
use std::sync::Arc;
use tracing::{debug, info};

/// Executes committed blocks against the application and advances the chain state.
pub struct BlockExecutor<S: StateStore> {
    store: S,
    app: Arc<dyn Client>,
    mempool: Arc<dyn Mempool>,
    evidence: EvidencePool,
    events: EventBus,
}

impl<S: StateStore> BlockExecutor<S> {
    /// Creates an executor running blocks over `app` (the consensus connection).
    pub fn new(store: S, app: Arc<dyn Client>, mempool: Arc<dyn Mempool>, events: EventBus) -> Self {
        Self {
            store,
            app,
            mempool,
            evidence: EvidencePool::new(),
            events,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Replaces the application connection blocks are executed over, returning the previous
    /// one.
    pub fn set_app(&mut self, app: Arc<dyn Client>) -> Arc<dyn Client> {
        std::mem::replace(&mut self.app, app)
    }

    pub fn mempool(&self) -> &Arc<dyn Mempool> {
        &self.mempool
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn evidence_pool(&mut self) -> &mut EvidencePool {
        &mut self.evidence
    }

    /// Records conflicting votes seen by consensus (turned into evidence once their height
    /// is committed).
    pub fn report_conflicting_votes(&mut self, vote_a: Vote, vote_b: Vote) {
        self.evidence.report_conflicting_votes(vote_a, vote_b);
    }

    /// Builds a block for `height` from pending evidence and mempool transactions, within
    /// the block size and gas limits.
    pub fn create_proposal_block(
        &self,
        height: u64,
        state: &State,
        commit: Commit,
        proposer_address: Address,
        round: u32,
        proof: Bytes,
    ) -> (Block, PartSet) {
        let params = &state.consensus_params;
        let (evidence, _) = self.evidence.pending_evidence(params.evidence.max_bytes);

        // Everything but the transactions counts against the block size
        let (empty, _) = state.make_block(
            height,
            Vec::new(),
            commit.clone(),
            evidence.clone(),
            proposer_address,
            round,
            proof.clone(),
        );
        let max_data_bytes = params.block.max_bytes - empty.encode_size() as i64 - TXS_OVERHEAD;
        let txs = {
            let _guard = self.mempool.lock();
            self.mempool
                .reap_max_bytes_max_gas(max_data_bytes.max(0), params.block.max_gas)
        };
        state.make_block(height, txs, commit, evidence, proposer_address, round, proof)
    }

    /// Checks `block` against `state` and the evidence pool.
    pub fn validate_block(&self, state: &State, block: &Block) -> Result<(), Error> {
        validate_block(state, block)?;
        self.evidence
            .check_evidence(&block.evidence, state, &self.store)
    }

    /// Executes `block`, commits the application, persists the new state and publishes the
    /// block's events.
    ///
    /// Returns the new state and the height below which blocks may be pruned (zero to keep
    /// everything).
    pub fn apply_block(
        &mut self,
        state: State,
        block_id: BlockId,
        block: &Block,
    ) -> Result<(State, u64), Error> {
        let height = block.height();
        self.validate_block(&state, block)
            .map_err(|err| Error::InvalidCommittedBlock {
                height,
                reason: err.to_string(),
            })?;

        let responses = exec_block(self.app.as_ref(), block, &state.last_voters)?;
        self.store.save_abci_responses(height, &responses)?;

        let updates = validate_validator_updates(
            &responses.end_block.validator_updates,
            &state.consensus_params.validator,
        )?;
        if !updates.is_empty() {
            debug!(height, updates = updates.len(), "validator updates");
        }
        let mut state = update_state(state, block_id, &block.header, &responses, updates)?;

        // Commit under the mempool lock so no transaction is checked against stale state
        let (app_hash, retain_height) = {
            let _guard = self.mempool.lock();
            self.mempool.flush_app_conn()?;
            let response = self.app.commit()?;
            info!(
                height,
                txs = block.data.txs.len(),
                app_hash = %hex(&response.data),
                "committed state"
            );
            self.mempool
                .update(height, &block.data.txs, &responses.deliver_txs)?;
            (response.data, response.retain_height)
        };

        self.evidence.update(&state, &block.evidence, &self.store);
        state.app_hash = app_hash;
        self.store.save(&state)?;

        self.fire_events(block, &responses);
        Ok((state, retain_height))
    }

    fn fire_events(&self, block: &Block, responses: &AbciResponses) {
        self.events.publish(Event::NewBlock {
            block: Box::new(block.clone()),
            begin_block: responses.begin_block.clone(),
            end_block: responses.end_block.clone(),
        });
        self.events.publish(Event::NewBlockHeader {
            header: Box::new(block.header.clone()),
            num_txs: block.data.txs.len() as u64,
        });
        for (index, (tx, result)) in block
            .data
            .txs
            .iter()
            .zip(&responses.deliver_txs)
            .enumerate()
        {
            self.events.publish(Event::Tx {
                height: block.height(),
                index: index as u32,
                tx: tx.clone(),
                result: result.clone(),
            });
        }
    }
}

/// Upper bound on the framing added by the transaction list itself.
const TXS_OVERHEAD: i64 = 8;

/// Runs `block` through BeginBlock, DeliverTx and EndBlock.
fn exec_block(app: &dyn Client, block: &Block, last_voters: &VoterSet) -> Result<AbciResponses, Error> {
    let height = block.height();
    let last_commit_info = last_commit_info(block, last_voters)?;
    let byzantine_validators = block
        .evidence
        .iter()
        .map(|ev| Misbehavior {
            address: ev.address(),
            power: ev.validator_power,
            height: ev.height(),
            time: ev.timestamp,
            total_voting_power: ev.total_voting_power,
        })
        .collect();

    let begin_block = app.begin_block(RequestBeginBlock {
        hash: block.hash(),
        header: block.header.clone(),
        last_commit_info,
        byzantine_validators,
    })?;
    let pending: Vec<_> = block
        .data
        .txs
        .iter()
        .map(|tx| app.deliver_tx_async(RequestDeliverTx { tx: tx.clone() }))
        .collect();
    let end_block = app.end_block(RequestEndBlock { height })?;
    app.flush()?;

    let mut deliver_txs = Vec::with_capacity(pending.len());
    let mut invalid = 0;
    for reqres in pending {
        match reqres.response() {
            Some(Response::DeliverTx(response)) => {
                if !response.is_ok() {
                    invalid += 1;
                }
                deliver_txs.push(response);
            }
            other => {
                return Err(Error::Application(format!(
                    "unexpected deliver tx response: {other:?}"
                )))
            }
        }
    }
    debug!(height, valid = deliver_txs.len() - invalid, invalid, "executed block");
    Ok(AbciResponses {
        deliver_txs,
        end_block,
        begin_block,
    })
}

/// Which voters of the last block signed its commit.
fn last_commit_info(block: &Block, last_voters: &VoterSet) -> Result<LastCommitInfo, Error> {
    let commit = &block.last_commit;
    if commit.is_empty() {
        return Ok(LastCommitInfo::default());
    }
    if commit.signatures.len() != last_voters.size() {
        return Err(Error::InvalidCommittedBlock {
            height: block.height(),
            reason: format!(
                "commit has {} signatures but there are {} voters",
                commit.signatures.len(),
                last_voters.size()
            ),
        });
    }
    let votes = last_voters
        .voters()
        .iter()
        .zip(&commit.signatures)
        .map(|(voter, sig)| VoteInfo {
            address: voter.address,
            power: voter.voting_power,
            signed_last_block: !sig.is_absent(),
        })
        .collect();
    Ok(LastCommitInfo {
        round: commit.round,
        votes,
    })
}

/// Executes and commits `block` without touching the chain state, returning the
/// application hash.
///
/// Used to bring the application up to date with blocks the state already reflects.
pub fn exec_commit_block(
    app: &dyn Client,
    block: &Block,
    state: &State,
    store: &impl StateStore,
) -> Result<Bytes, Error> {
    let height = block.height();
    let last_voters = if height == state.initial_height {
        VoterSet::default()
    } else {
        store.load_voters(height - 1, &state.voter_params)?
    };
    exec_block(app, block, &last_voters)?;
    let response = app.commit()?;
    info!(height, app_hash = %hex(&response.data), "replayed block");
    Ok(response.data)
}

/// Converts the application's validator updates, rejecting negative powers and key types
/// the chain does not allow.
pub fn validate_validator_updates(
    updates: &[ValidatorUpdate],
    params: &ValidatorParams,
) -> Result<Vec<Validator>, Error> {
    updates
        .iter()
        .map(|update| {
            if update.power < 0 {
                return Err(Error::InvalidValidatorUpdate(format!(
                    "voting power can't be negative: {}",
                    update.power
                )));
            }
            if !params.is_allowed(update.pub_key.key_type()) {
                return Err(Error::InvalidValidatorUpdate(format!(
                    "validator {} is using pubkey {:?}, which is unsupported for consensus",
                    update.pub_key.address(),
                    update.pub_key.key_type()
                )));
            }
            Ok(Validator::new(update.pub_key.clone(), update.power))
        })
        .collect()
}

/// Derives the state after `header` from the application's responses.
fn update_state(
    state: State,
    block_id: BlockId,
    header: &Header,
    responses: &AbciResponses,
    updates: Vec<Validator>,
) -> Result<State, Error> {
    // Updates take effect at the height after next
    let mut next_validators = state.next_validators.clone();
    let mut last_height_validators_changed = state.last_height_validators_changed;
    if !updates.is_empty() {
        next_validators.update_with_change_set(updates)?;
        last_height_validators_changed = header.height + 2;
    }
    if !next_validators.is_empty() {
        next_validators.increment_proposer_priority(1);
    }

    let mut consensus_params = state.consensus_params.clone();
    let mut last_height_consensus_params_changed = state.last_height_consensus_params_changed;
    if let Some(update) = &responses.end_block.consensus_param_updates {
        consensus_params = state.consensus_params.update(update);
        consensus_params.validate()?;
        last_height_consensus_params_changed = header.height + 1;
    }

    // The proposer's VRF output seeds the next election
    let last_proof_hash = Bytes::copy_from_slice(vrf::proof_to_hash(&header.proof).as_ref());
    let voters = select_voter(&state.next_validators, &last_proof_hash, &state.voter_params);

    Ok(State {
        version: Version {
            block: state.version.block,
            app: consensus_params.app_version,
        },
        chain_id: state.chain_id,
        initial_height: state.initial_height,
        last_block_height: header.height,
        last_block_id: block_id,
        last_block_time: header.time,
        validators: state.next_validators,
        next_validators,
        last_validators: state.validators,
        last_height_validators_changed,
        voters,
        last_voters: state.voters,
        voter_params: state.voter_params,
        consensus_params,
        last_height_consensus_params_changed,
        last_results_hash: responses.results_hash(),
        app_hash: Bytes::new(),
        last_proof_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abci::{make_validator_tx, AppConns, KvStoreApplication, ResponseDeliverTx},
        mempool::{Config as MempoolConfig, TxMempool},
        mocks::fixtures::Fixture,
    };
    use halcyon_cryptography::KeyType;
    use halcyon_macros::test_traced;
    use halcyon_runtime::storage::memory;
    use halcyon_storage::metadata::{Config, Metadata};

    type Store = Metadata<memory::Storage>;

    fn executor(conns: &AppConns, events: EventBus) -> (BlockExecutor<Store>, Arc<TxMempool>) {
        let store = Metadata::init(
            memory::Storage::default(),
            Config {
                partition: "state".into(),
            },
        )
        .unwrap();
        let mempool = Arc::new(TxMempool::new(
            MempoolConfig::default(),
            conns.mempool().clone(),
            0,
        ));
        let executor = BlockExecutor::new(store, conns.consensus().clone(), mempool.clone(), events);
        (executor, mempool)
    }

    #[test_traced]
    fn test_apply_blocks() {
        let fixture = Fixture::new(4, KeyType::Ed25519);
        let conns = AppConns::local(KvStoreApplication::new());
        let events = EventBus::new();
        let mut headers = events.subscribe_to(&["NewBlockHeader"]);
        let (mut executor, mempool) = executor(&conns, events);
        let mut state = fixture.state();
        executor.store_mut().save(&state).unwrap();

        // Transactions in the mempool are reaped into the proposal and removed on commit
        mempool.check_tx(Bytes::from_static(b"a=1")).unwrap();
        mempool.check_tx(Bytes::from_static(b"b=2")).unwrap();
        let (block, parts, block_id) = fixture.propose_with(&executor, &state, Commit::default(), 0);
        assert_eq!(block.data.txs.len(), 2);
        assert!(parts.is_complete());

        let (next, retain_height) = executor.apply_block(state.clone(), block_id, &block).unwrap();
        assert_eq!(retain_height, 0);
        assert_eq!(next.last_block_height, 1);
        assert_eq!(next.last_block_id, block_id);
        assert_eq!(next.app_hash, Bytes::copy_from_slice(&2u64.to_be_bytes()));
        assert_eq!(next.validators, state.next_validators);
        assert_eq!(next.last_voters, state.voters);
        assert_eq!(
            next.last_proof_hash.as_ref(),
            vrf::proof_to_hash(&block.header.proof).as_ref()
        );
        assert_eq!(mempool.size(), 0);
        assert_eq!(executor.store().load().unwrap().unwrap(), next);
        let responses = executor.store().load_abci_responses(1).unwrap();
        assert_eq!(responses.deliver_txs.len(), 2);
        assert!(responses.deliver_txs.iter().all(ResponseDeliverTx::is_ok));

        // A second block carries the commit of the first
        let commit = fixture.commit(&state, 1, 0, block_id);
        state = next;
        let (block, _, block_id) = fixture.propose(&state, commit, vec![Bytes::from_static(b"c")], 0);
        let (state, _) = executor.apply_block(state, block_id, &block).unwrap();
        assert_eq!(state.last_block_height, 2);
        assert_eq!(state.app_hash, Bytes::copy_from_slice(&3u64.to_be_bytes()));

        let first = headers.try_next().unwrap().unwrap();
        assert!(matches!(first, Event::NewBlockHeader { num_txs: 2, .. }));
    }

    #[test]
    fn test_rejects_invalid_block() {
        let fixture = Fixture::new(4, KeyType::Ed25519);
        let conns = AppConns::local(KvStoreApplication::new());
        let (mut executor, _) = executor(&conns, EventBus::new());
        let state = fixture.state();
        let (mut block, _, block_id) = fixture.propose(&state, Commit::default(), Vec::new(), 0);
        block.header.height = 5;
        let err = executor.apply_block(state, block_id, &block).unwrap_err();
        assert!(matches!(err, Error::InvalidCommittedBlock { height: 5, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_validator_updates_take_effect_after_two_blocks() {
        let fixture = Fixture::new(4, KeyType::Ed25519);
        let conns = AppConns::local(KvStoreApplication::new());
        let (mut executor, _) = executor(&conns, EventBus::new());
        let state = fixture.state();

        let joining = halcyon_cryptography::PrivateKey::from_seed(KeyType::Bls12381, 99);
        let tx = make_validator_tx(&joining.public_key(), 7);
        let (block, _, block_id) = fixture.propose(&state, Commit::default(), vec![tx], 0);
        let (next, _) = executor.apply_block(state.clone(), block_id, &block).unwrap();
        assert_eq!(next.last_height_validators_changed, 3);
        assert!(!next.validators.has_address(&joining.public_key().address()));
        assert!(next.next_validators.has_address(&joining.public_key().address()));
        assert_eq!(
            executor.store().load_validators(3).unwrap().size(),
            5
        );
    }

    #[test]
    fn test_validate_validator_updates() {
        let params = ValidatorParams {
            pub_key_types: vec![KeyType::Ed25519],
        };
        let ed = halcyon_cryptography::PrivateKey::from_seed(KeyType::Ed25519, 1).public_key();
        let bls = halcyon_cryptography::PrivateKey::from_seed(KeyType::Bls12381, 1).public_key();

        let updates = validate_validator_updates(
            &[
                ValidatorUpdate {
                    pub_key: ed.clone(),
                    power: 0,
                },
            ],
            &params,
        )
        .unwrap();
        assert_eq!(updates[0].voting_power, 0);

        assert!(validate_validator_updates(
            &[ValidatorUpdate {
                pub_key: ed,
                power: -1
            }],
            &params
        )
        .is_err());
        assert!(validate_validator_updates(
            &[ValidatorUpdate {
                pub_key: bls,
                power: 10
            }],
            &params
        )
        .is_err());
    }
}
