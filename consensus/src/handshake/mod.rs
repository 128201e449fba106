//! Startup reconciliation between the stored chain and the application.
//!
//! A node can crash between any two of the steps that finish a height: saving the block,
//! committing it in the application and saving the new state. On restart the application
//! reports the last height it committed and the [Handshaker] brings it (and the state) up to
//! the block store:
//!
//! * Blocks the application is missing and the state already reflects are executed and
//!   committed without touching the state.
//! * A block the store has but the state does not is applied through the [BlockExecutor].
//!   If the application already committed it, it is applied against a stand-in that
//!   replays the responses saved when the block was first executed.
//!
//! Any application hash that disagrees with the chain is fatal.

use crate::{
    abci::{
        AbciResponses, AppConns, Application, Client, LocalClient, RequestBeginBlock,
        RequestDeliverTx, RequestEndBlock, RequestInfo, RequestInitChain, ResponseBeginBlock,
        ResponseCommit, ResponseDeliverTx, ResponseEndBlock, ValidatorUpdate,
    },
    state::{exec_commit_block, validate_validator_updates, BlockExecutor, Genesis, State, StateStore},
    store::BlockStore,
    types::{select_voter, Block, ValidatorSet, BLOCK_PROTOCOL},
    Error,
};
use bytes::Bytes;
use halcyon_cryptography::utils::hex;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Replays stored blocks into the application until both agree on the last block.
pub struct Handshaker<'a, S: StateStore, B: BlockStore> {
    executor: &'a mut BlockExecutor<S>,
    block_store: &'a B,
    genesis: &'a Genesis,
    initial_state: State,
    n_blocks: u64,
}

impl<'a, S: StateStore, B: BlockStore> Handshaker<'a, S, B> {
    /// Creates a handshaker for a node whose last saved state is `state`.
    ///
    /// Blocks are applied with `executor`, which must not have a mempool with pending
    /// transactions.
    pub fn new(
        executor: &'a mut BlockExecutor<S>,
        block_store: &'a B,
        genesis: &'a Genesis,
        state: State,
    ) -> Self {
        Self {
            executor,
            block_store,
            genesis,
            initial_state: state,
            n_blocks: 0,
        }
    }

    /// Number of blocks executed against the application (real or stand-in) so far.
    pub fn n_blocks(&self) -> u64 {
        self.n_blocks
    }

    /// Brings the application up to date with the block store, returning the state after
    /// the last stored block.
    pub fn handshake(&mut self, conns: &AppConns) -> Result<State, Error> {
        let res = conns.query().info(RequestInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            block_version: BLOCK_PROTOCOL,
        })?;
        info!(
            height = res.last_block_height,
            app_hash = %hex(&res.last_block_app_hash),
            version = res.version,
            "application info"
        );

        let state = self.initial_state.clone();
        let state = self.replay_blocks(
            state,
            conns.consensus(),
            res.last_block_app_hash,
            res.last_block_height,
        )?;
        info!(
            height = state.last_block_height,
            app_hash = %hex(&state.app_hash),
            replayed = self.n_blocks,
            "completed handshake"
        );
        Ok(state)
    }

    fn replay_blocks(
        &mut self,
        mut state: State,
        app: &Arc<dyn Client>,
        mut app_hash: Bytes,
        app_height: u64,
    ) -> Result<State, Error> {
        let store_base = self.block_store.base();
        let store_height = self.block_store.height();
        let state_height = state.last_block_height;
        debug!(app_height, store_base, store_height, state_height, "replaying blocks");

        if app_height == 0 {
            let res = app.init_chain(RequestInitChain {
                time: self.genesis.genesis_time,
                chain_id: self.genesis.chain_id.clone(),
                consensus_params: Some(self.genesis.consensus_params.clone()),
                validators: self
                    .genesis
                    .validators
                    .iter()
                    .map(|val| ValidatorUpdate {
                        pub_key: val.pub_key.clone(),
                        power: val.voting_power,
                    })
                    .collect(),
                app_state_bytes: self.genesis.app_state.clone(),
                initial_height: self.genesis.initial_height,
            })?;
            app_hash = res.app_hash.clone();

            // The application only shapes the chain before its first block
            if state_height == 0 {
                if !res.app_hash.is_empty() {
                    state.app_hash = res.app_hash;
                }
                if let Some(update) = &res.consensus_params {
                    state.consensus_params = state.consensus_params.update(update);
                    state.consensus_params.validate()?;
                    state.version.app = state.consensus_params.app_version;
                }
                if !res.validators.is_empty() {
                    let validators = validate_validator_updates(
                        &res.validators,
                        &state.consensus_params.validator,
                    )?;
                    let validators = ValidatorSet::new(validators)?;
                    let mut next_validators = validators.clone();
                    next_validators.increment_proposer_priority(1);
                    state.voters = select_voter(&validators, &[], &state.voter_params);
                    state.validators = validators;
                    state.next_validators = next_validators;
                } else if self.genesis.validators.is_empty() {
                    return Err(Error::InvalidValidatorUpdate(
                        "validator set is empty in genesis and after InitChain".into(),
                    ));
                }
                self.executor.store_mut().save(&state)?;
            }
        }

        if store_height == 0 {
            check_app_hash(&app_hash, &state)?;
            return Ok(state);
        }
        if app_height == 0 && state.initial_height < store_base {
            return Err(Error::AppBlockHeightTooLow {
                app_height,
                store_base,
            });
        }
        if app_height > 0 && app_height + 1 < store_base {
            return Err(Error::AppBlockHeightTooLow {
                app_height,
                store_base,
            });
        }
        if store_height < app_height {
            return Err(Error::AppBlockHeightTooHigh {
                app_height,
                store_height,
            });
        }
        if store_height < state_height || store_height > state_height + 1 {
            return Err(Error::StateStoreMismatch {
                state_height,
                store_height,
            });
        }

        if store_height == state_height {
            // The state is saved: at most the application is behind
            if app_height < store_height {
                return self.exec_commit_blocks(state, app, app_hash, app_height, store_height);
            }
            check_app_hash(&app_hash, &state)?;
            return Ok(state);
        }

        // The block is saved but the state after it is not
        if app_height < state_height {
            self.exec_commit_blocks(state.clone(), app, app_hash, app_height, state_height)?;
            return self.replay_block(state, store_height, app.clone());
        }
        if app_height == state_height {
            return self.replay_block(state, store_height, app.clone());
        }

        // The application committed the block: feed it the responses it gave then
        let responses = self.executor.store().load_abci_responses(store_height)?;
        let stand_in = ReplayApplication::new(app_hash, responses);
        let stand_in: Arc<dyn Client> = Arc::new(LocalClient::new(Arc::new(Mutex::new(stand_in))));
        self.replay_block(state, store_height, stand_in)
    }

    /// Executes and commits the blocks after `app_height` up to `final_height` without
    /// changing `state`, checking the application hash after each.
    fn exec_commit_blocks(
        &mut self,
        state: State,
        app: &Arc<dyn Client>,
        mut app_hash: Bytes,
        app_height: u64,
        final_height: u64,
    ) -> Result<State, Error> {
        let first_height = if app_height == 0 {
            state.initial_height
        } else {
            app_height + 1
        };
        for height in first_height..=final_height {
            let block = self.load_block(height)?;
            if !app_hash.is_empty() && block.header.app_hash != app_hash {
                return Err(Error::AppHashMismatch {
                    height: height - 1,
                    expected: block.header.app_hash.clone(),
                    got: app_hash,
                });
            }
            app_hash = exec_commit_block(app.as_ref(), &block, &state, self.executor.store())?;
            self.n_blocks += 1;
        }
        if final_height == state.last_block_height {
            check_app_hash(&app_hash, &state)?;
        }
        Ok(state)
    }

    /// Applies the stored block at `height` over `app`, advancing `state`.
    fn replay_block(&mut self, state: State, height: u64, app: Arc<dyn Client>) -> Result<State, Error> {
        let block = self.load_block(height)?;
        let meta = self
            .block_store
            .load_block_meta(height)?
            .ok_or(Error::BlockNotFound(height))?;

        let previous = self.executor.set_app(app);
        let result = self.executor.apply_block(state, meta.block_id, &block);
        self.executor.set_app(previous);

        let (state, _) = result?;
        self.n_blocks += 1;
        Ok(state)
    }

    fn load_block(&self, height: u64) -> Result<Block, Error> {
        self.block_store
            .load_block(height)?
            .ok_or(Error::BlockNotFound(height))
    }
}

fn check_app_hash(app_hash: &Bytes, state: &State) -> Result<(), Error> {
    if *app_hash != state.app_hash {
        return Err(Error::AppHashMismatch {
            height: state.last_block_height,
            expected: state.app_hash.clone(),
            got: app_hash.clone(),
        });
    }
    Ok(())
}

/// Answers a block's execution with the responses the application gave the first time.
///
/// Used when the application committed a block but the node crashed before saving the
/// state after it.
struct ReplayApplication {
    app_hash: Bytes,
    responses: AbciResponses,
    tx_count: usize,
}

impl ReplayApplication {
    fn new(app_hash: Bytes, responses: AbciResponses) -> Self {
        Self {
            app_hash,
            responses,
            tx_count: 0,
        }
    }
}

impl Application for ReplayApplication {
    fn begin_block(&mut self, _req: RequestBeginBlock) -> ResponseBeginBlock {
        self.responses.begin_block.clone()
    }

    fn deliver_tx(&mut self, _req: RequestDeliverTx) -> ResponseDeliverTx {
        let response = self
            .responses
            .deliver_txs
            .get(self.tx_count)
            .cloned()
            .unwrap_or_default();
        self.tx_count += 1;
        response
    }

    fn end_block(&mut self, _req: RequestEndBlock) -> ResponseEndBlock {
        self.responses.end_block.clone()
    }

    fn commit(&mut self) -> ResponseCommit {
        ResponseCommit {
            data: self.app_hash.clone(),
            retain_height: 0,
        }
    }
}
