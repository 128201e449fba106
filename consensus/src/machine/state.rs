use super::{
    Broadcaster, Config, HeightVoteSet, LastCommit, Metrics, NoopBroadcaster, RoundState,
    RoundStateSnapshot, TimeoutTicker,
};
use crate::{
    state::{BlockExecutor, State, StateStore},
    store::BlockStore,
    types::{
        Block, BlockId, Commit, Event, EventBus, Part, PartSet, PrivValidator, Proposal,
        RoundStep, SignedMsgType, Vote, VoteSet,
    },
    wal::{ConsensusMessage, MsgInfo, TimedWalMessage, TimeoutInfo, Wal, WalMessage},
    Error,
};
use bytes::Bytes;
use halcyon_codec::DecodeExt;
use halcyon_cryptography::Address;
use halcyon_runtime::Clock;
use std::{
    collections::VecDeque,
    mem,
    sync::{Arc, RwLock},
    time::Duration,
};
use tracing::{debug, error, info, trace, warn};

/// The consensus state machine of a single node.
///
/// Inputs are peer messages, our own messages (queued internally while handling other
/// inputs), timeouts and notifications from the mempool. Every input is written to the WAL
/// before it is handled (our own messages synchronously) so the machine can be rebuilt
/// after a crash with [ConsensusState::catchup_replay].
pub struct ConsensusState<S: StateStore, B: BlockStore, W: Wal, C: Clock> {
    config: Config,
    clock: C,

    state: State,
    rs: RoundState,

    executor: BlockExecutor<S>,
    block_store: B,
    wal: W,
    events: EventBus,

    priv_validator: Option<Box<dyn PrivValidator>>,
    address: Option<Address>,
    broadcaster: Box<dyn Broadcaster>,

    metrics: Metrics,
    ticker: TimeoutTicker,
    internal: VecDeque<ConsensusMessage>,
    snapshot: Arc<RwLock<RoundStateSnapshot>>,

    started: bool,
    replay_mode: bool,
    deferred_proposal: Option<(u64, u32)>,
    deferred_votes: Vec<(SignedMsgType, u32, BlockId)>,
}

impl<S: StateStore, B: BlockStore, W: Wal, C: Clock> ConsensusState<S, B, W, C> {
    /// Creates a state machine for the height after `state`.
    ///
    /// The commit of the last block is loaded from `block_store`, so it must hold every block
    /// of `state`.
    pub fn new(
        config: Config,
        state: State,
        executor: BlockExecutor<S>,
        block_store: B,
        wal: W,
        clock: C,
        metrics: Metrics,
    ) -> Result<Self, Error> {
        config.assert();
        let height = state.next_height();
        let voters = Arc::new(state.voters.clone());
        let rs = RoundState {
            height,
            round: 0,
            step: RoundStep::NewHeight,
            start_time: 0,
            commit_time: 0,
            validators: state.validators.clone(),
            voters: voters.clone(),
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: None,
            locked_block: None,
            locked_block_parts: None,
            valid_round: None,
            valid_block: None,
            valid_block_parts: None,
            votes: HeightVoteSet::new(&state.chain_id, height, voters),
            commit_round: None,
            last_commit: None,
            last_voters: Arc::new(state.last_voters.clone()),
            triggered_timeout_precommit: false,
        };
        let events = executor.events().clone();
        let mut consensus = Self {
            config,
            clock,
            state: state.clone(),
            rs,
            executor,
            block_store,
            wal,
            events,
            priv_validator: None,
            address: None,
            broadcaster: Box::new(NoopBroadcaster),
            metrics,
            ticker: TimeoutTicker::new(),
            internal: VecDeque::new(),
            snapshot: Arc::default(),
            started: false,
            replay_mode: false,
            deferred_proposal: None,
            deferred_votes: Vec::new(),
        };
        consensus.update_to_state(state)?;
        Ok(consensus)
    }

    /// Signs proposals and votes with `priv_validator` from now on.
    pub fn set_priv_validator(&mut self, priv_validator: Box<dyn PrivValidator>) {
        self.address = Some(priv_validator.public_key().address());
        self.priv_validator = Some(priv_validator);
    }

    /// Sends our own proposals, block parts and votes through `broadcaster`.
    pub fn set_broadcaster(&mut self, broadcaster: Box<dyn Broadcaster>) {
        self.broadcaster = broadcaster;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn round_state(&self) -> &RoundState {
        &self.rs
    }

    pub fn block_store(&self) -> &B {
        &self.block_store
    }

    pub fn executor(&self) -> &BlockExecutor<S> {
        &self.executor
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn ticker(&mut self) -> &mut TimeoutTicker {
        &mut self.ticker
    }

    /// Shared copy of the round state, refreshed after every input.
    pub fn snapshot(&self) -> Arc<RwLock<RoundStateSnapshot>> {
        self.snapshot.clone()
    }

    /// Whether our own messages are waiting to be handled.
    pub fn has_internal(&self) -> bool {
        !self.internal.is_empty()
    }

    /// Replays the WAL of the current height and schedules the start of round 0.
    pub fn start(&mut self) -> Result<(), Error> {
        self.started = true;
        match self.catchup_replay(self.rs.height) {
            Ok(()) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => error!(?err, "catchup replay failed; starting anyway"),
        }
        self.schedule_round0();
        self.publish_snapshot();
        Ok(())
    }

    /// Flushes and closes the WAL.
    pub fn stop(&mut self) -> Result<(), Error> {
        self.wal.stop()
    }

    /// Handles a proposal, block part or vote received from `peer`.
    pub fn receive_peer_message(&mut self, msg: ConsensusMessage, peer: String) -> Result<(), Error> {
        let info = MsgInfo {
            msg,
            peer: Some(peer),
        };
        self.wal_write(WalMessage::MsgInfo(info.clone()), false)?;
        self.handle_msg(info.msg, info.peer)?;
        self.publish_snapshot();
        Ok(())
    }

    /// Handles the oldest of our own messages, returning false if there was none.
    pub fn process_internal(&mut self) -> Result<bool, Error> {
        let Some(msg) = self.internal.pop_front() else {
            return Ok(false);
        };

        // Our messages must be durable before anyone sees them
        let info = MsgInfo { msg, peer: None };
        self.wal_write(WalMessage::MsgInfo(info.clone()), true)?;
        self.broadcaster.broadcast(info.msg.clone());
        self.handle_msg(info.msg, None)?;
        self.publish_snapshot();
        Ok(true)
    }

    /// Handles a timeout that fired.
    pub fn receive_timeout(&mut self, timeout: TimeoutInfo) -> Result<(), Error> {
        self.wal_write(WalMessage::Timeout(timeout.clone()), false)?;
        self.handle_timeout(timeout)?;
        self.publish_snapshot();
        Ok(())
    }

    /// Handles `peer` claiming two thirds of `vote_type` votes for `block_id`.
    pub fn receive_peer_maj23(
        &mut self,
        height: u64,
        round: u32,
        vote_type: SignedMsgType,
        block_id: BlockId,
        peer: &str,
    ) -> Result<(), Error> {
        if height != self.rs.height {
            return Ok(());
        }
        self.rs
            .votes
            .set_peer_maj23(round, vote_type, peer, block_id)
    }

    /// Proposes if we were waiting for transactions to do so.
    pub fn receive_txs_available(&mut self) -> Result<(), Error> {
        if self.rs.round != 0 || self.rs.step != RoundStep::NewRound {
            return Ok(());
        }
        self.enter_propose(self.rs.height, 0)?;
        self.publish_snapshot();
        Ok(())
    }

    /// Replays the WAL entries written since the end of the height before `height`.
    ///
    /// Fails if the WAL already ended `height` (the state is behind the WAL).
    pub fn catchup_replay(&mut self, height: u64) -> Result<(), Error> {
        match self.wal.search_for_end_height(height) {
            Ok(_) => return Err(Error::WalAlreadyEnded(height)),
            Err(Error::EndHeightNotFound(_)) => {}
            Err(err) => return Err(err),
        }
        let end_height = if height == self.state.initial_height {
            0
        } else {
            height - 1
        };
        let reader = self.wal.search_for_end_height(end_height)?;
        let entries = reader.len();

        self.replay_mode = true;
        let result = reader
            .into_iter()
            .try_for_each(|entry| self.replay_entry(entry));
        self.replay_mode = false;
        result?;
        info!(height, entries, "replayed WAL");
        self.finish_replay()
    }

    fn replay_entry(&mut self, entry: TimedWalMessage) -> Result<(), Error> {
        trace!(time = entry.time, msg = ?entry.msg, "replaying WAL entry");
        match entry.msg {
            WalMessage::MsgInfo(info) => self.handle_msg(info.msg, info.peer),
            WalMessage::Timeout(timeout) => self.handle_timeout(timeout),
            WalMessage::RoundState(_) | WalMessage::EndHeight(_) => Ok(()),
        }
    }

    /// Signs what we skipped during the replay and is still missing.
    fn finish_replay(&mut self) -> Result<(), Error> {
        if let Some((height, round)) = self.deferred_proposal.take() {
            if height == self.rs.height && round == self.rs.round && self.rs.proposal.is_none() {
                self.decide_proposal(height, round)?;
            }
        }
        for (vote_type, round, block_id) in mem::take(&mut self.deferred_votes) {
            if round != self.rs.round || self.has_own_vote(vote_type, round) {
                continue;
            }
            self.sign_add_vote(vote_type, block_id);
        }
        Ok(())
    }

    fn has_own_vote(&self, vote_type: SignedMsgType, round: u32) -> bool {
        let Some(address) = &self.address else {
            return false;
        };
        let set = match vote_type {
            SignedMsgType::Prevote => self.rs.votes.prevotes(round),
            SignedMsgType::Precommit => self.rs.votes.precommits(round),
            SignedMsgType::Proposal => None,
        };
        set.is_some_and(|set| set.get_by_address(address).is_some())
    }

    fn now(&self) -> u64 {
        self.clock.epoch_millis()
    }

    fn wal_write(&mut self, msg: WalMessage, sync: bool) -> Result<(), Error> {
        let result = if sync {
            self.wal.write_sync(msg)
        } else {
            self.wal.write(msg)
        };
        result.map_err(|err| Error::WalWrite {
            height: self.rs.height,
            round: self.rs.round,
            reason: err.to_string(),
        })?;
        self.metrics.wal_writes.inc();
        Ok(())
    }

    fn publish_snapshot(&self) {
        let snapshot = self.rs.snapshot();
        *self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot;
    }

    fn new_step(&mut self) -> Result<(), Error> {
        let event = self.rs.event();
        if self.started && !self.replay_mode {
            self.wal_write(WalMessage::RoundState(event.clone()), false)?;
        }
        self.events.publish(Event::NewRoundStep(event));
        Ok(())
    }

    fn update_round_step(&mut self, round: u32, step: RoundStep) {
        self.rs.round = round;
        self.rs.step = step;
    }

    fn schedule_timeout(&mut self, duration: Duration, height: u64, round: u32, step: RoundStep) {
        self.ticker.schedule(TimeoutInfo {
            duration,
            height,
            round,
            step,
        });
    }

    /// Schedules the start of round 0 at the start time of the height.
    fn schedule_round0(&mut self) {
        let sleep = Duration::from_millis(self.rs.start_time.saturating_sub(self.now()));
        self.schedule_timeout(sleep, self.rs.height, 0, RoundStep::NewHeight);
    }

    /// Resets the round state for the height after `state`.
    fn update_to_state(&mut self, state: State) -> Result<(), Error> {
        let last_commit = if state.last_block_height == 0 {
            None
        } else {
            let live = self
                .rs
                .commit_round
                .filter(|_| self.rs.height == state.last_block_height)
                .and_then(|round| self.rs.votes.precommits(round))
                .cloned();
            match live {
                Some(precommits) => Some(LastCommit::Votes(precommits)),
                None => {
                    let commit = self
                        .block_store
                        .load_seen_commit(state.last_block_height)?
                        .ok_or(Error::BlockNotFound(state.last_block_height))?;
                    Some(LastCommit::Commit(commit))
                }
            }
        };

        let height = state.next_height();
        let start_time = if self.rs.commit_time == 0 {
            self.config.commit(self.now())
        } else {
            self.config.commit(self.rs.commit_time)
        };
        let voters = Arc::new(state.voters.clone());
        let rs = &mut self.rs;
        rs.height = height;
        rs.round = 0;
        rs.step = RoundStep::NewHeight;
        rs.start_time = start_time;
        rs.validators = state.validators.clone();
        rs.voters = voters.clone();
        rs.proposal = None;
        rs.proposal_block = None;
        rs.proposal_block_parts = None;
        rs.locked_round = None;
        rs.locked_block = None;
        rs.locked_block_parts = None;
        rs.valid_round = None;
        rs.valid_block = None;
        rs.valid_block_parts = None;
        rs.votes = HeightVoteSet::new(&state.chain_id, height, voters);
        rs.commit_round = None;
        rs.last_commit = last_commit;
        rs.last_voters = Arc::new(state.last_voters.clone());
        rs.triggered_timeout_precommit = false;

        self.metrics.height.set(height as i64);
        self.metrics.validators.set(state.validators.size() as i64);
        self.metrics
            .validators_power
            .set(state.validators.total_voting_power());
        self.metrics.voters.set(state.voters.size() as i64);
        self.state = state;
        self.new_step()
    }

    fn handle_msg(&mut self, msg: ConsensusMessage, peer: Option<String>) -> Result<(), Error> {
        let (height, round) = (msg.height(), msg.round());
        let result = match msg {
            ConsensusMessage::Proposal(proposal) => self.set_proposal(proposal),
            ConsensusMessage::BlockPart { height, part, .. } => {
                self.add_proposal_block_part(height, part).map(|_| ())
            }
            ConsensusMessage::Vote(vote) => self.try_add_vote(vote, peer.as_deref()).map(|_| ()),
        };
        match result {
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                debug!(?err, height, round, ?peer, "dropped consensus message");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn handle_timeout(&mut self, timeout: TimeoutInfo) -> Result<(), Error> {
        let rs = &self.rs;
        if timeout.height != rs.height
            || timeout.round < rs.round
            || (timeout.round == rs.round && timeout.step < rs.step)
        {
            debug!(?timeout, height = rs.height, round = rs.round, step = ?rs.step, "ignoring stale timeout");
            return Ok(());
        }
        let TimeoutInfo {
            height,
            round,
            step,
            ..
        } = timeout;
        match step {
            RoundStep::NewHeight => self.enter_new_round(height, 0),
            RoundStep::NewRound => self.enter_propose(height, 0),
            RoundStep::Propose => {
                self.events.publish(Event::TimeoutPropose(self.rs.event()));
                self.enter_prevote(height, round)
            }
            RoundStep::PrevoteWait => {
                self.events.publish(Event::TimeoutWait(self.rs.event()));
                self.enter_precommit(height, round)
            }
            RoundStep::PrecommitWait => {
                self.events.publish(Event::TimeoutWait(self.rs.event()));
                self.enter_precommit(height, round)?;
                self.enter_new_round(height, round + 1)
            }
            step => {
                warn!(?step, "invalid timeout step");
                Ok(())
            }
        }
    }

    /// Whether the block of the last height must be followed by a block proving its
    /// application hash.
    fn need_proof_block(&self, height: u64) -> Result<bool, Error> {
        if height == self.state.initial_height {
            return Ok(true);
        }
        Ok(match self.block_store.load_block_meta(height - 1)? {
            Some(meta) => meta.header.app_hash != self.state.app_hash,
            None => true,
        })
    }

    fn enter_new_round(&mut self, height: u64, round: u32) -> Result<(), Error> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && rs.step != RoundStep::NewHeight)
        {
            debug!(height, round, current_round = rs.round, step = ?rs.step, "skipping new round");
            return Ok(());
        }
        if rs.start_time > self.now() {
            debug!(height, round, start_time = rs.start_time, "entering new round early");
        }
        info!(height, round, "entering new round");

        self.update_round_step(round, RoundStep::NewRound);
        if round != 0 {
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
        }
        self.rs.votes.set_round(round + 1);
        self.rs.triggered_timeout_precommit = false;
        self.metrics.rounds.set(round as i64);

        let proposer = self.state.proposer(round).address;
        self.events.publish(Event::NewRound {
            state: self.rs.event(),
            proposer,
        });
        self.new_step()?;

        let wait_for_txs = !self.config.create_empty_blocks
            && round == 0
            && !self.need_proof_block(height)?
            && self.executor.mempool().size() == 0;
        if wait_for_txs {
            let interval = self.config.create_empty_blocks_interval;
            if interval > Duration::ZERO {
                self.schedule_timeout(interval, height, round, RoundStep::NewRound);
            }
            return Ok(());
        }
        self.enter_propose(height, round)
    }

    fn enter_propose(&mut self, height: u64, round: u32) -> Result<(), Error> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && RoundStep::Propose <= rs.step)
        {
            debug!(height, round, current_round = rs.round, step = ?rs.step, "skipping propose");
            return Ok(());
        }
        info!(height, round, "entering propose step");

        let timeout = self.config.propose(round);
        self.schedule_timeout(timeout, height, round, RoundStep::Propose);

        let proposer = self.state.proposer(round).address;
        if self.address == Some(proposer) {
            debug!(height, round, "our turn to propose");
            self.decide_proposal(height, round)?;
        }

        self.update_round_step(round, RoundStep::Propose);
        self.new_step()?;
        if self.is_proposal_complete() {
            self.enter_prevote(height, self.rs.round)?;
        }
        Ok(())
    }

    fn decide_proposal(&mut self, height: u64, round: u32) -> Result<(), Error> {
        if self.replay_mode {
            self.deferred_proposal = Some((height, round));
            return Ok(());
        }

        // Re-propose the valid block if there is one
        let (block, parts) = match (&self.rs.valid_block, &self.rs.valid_block_parts) {
            (Some(block), Some(parts)) => (block.clone(), parts.clone()),
            _ => match self.create_proposal_block(round)? {
                Some(created) => created,
                None => return Ok(()),
            },
        };

        // Everything written so far must be durable before our proposal is
        self.wal.flush_and_sync().map_err(|err| Error::WalWrite {
            height,
            round,
            reason: err.to_string(),
        })?;

        let block_id = BlockId {
            hash: block.hash(),
            part_set_header: parts.header(),
        };
        let pol_round = self.rs.valid_round.filter(|valid| *valid < round);
        let mut proposal = Proposal::new(height, round, pol_round, block_id, self.now());
        let Some(priv_validator) = self.priv_validator.as_mut() else {
            return Ok(());
        };
        if let Err(err) = priv_validator.sign_proposal(&self.state.chain_id, &mut proposal) {
            error!(?err, height, round, "failed to sign proposal");
            return Ok(());
        }

        self.internal
            .push_back(ConsensusMessage::Proposal(proposal));
        for index in 0..parts.total() {
            let Some(part) = parts.get_part(index) else {
                continue;
            };
            self.internal.push_back(ConsensusMessage::BlockPart {
                height,
                round,
                part: part.clone(),
            });
        }
        info!(height, round, block = %block_id.hash, parts = parts.total(), "signed proposal");
        Ok(())
    }

    /// Builds a block from the mempool, unless the last commit is missing.
    fn create_proposal_block(&self, round: u32) -> Result<Option<(Block, PartSet)>, Error> {
        let height = self.rs.height;
        let commit = if height == self.state.initial_height {
            Commit::default()
        } else {
            match &self.rs.last_commit {
                Some(last) if last.has_two_thirds_majority() => last.make_commit(),
                _ => {
                    error!(height, round, "cannot propose without a commit for the last block");
                    return Ok(None);
                }
            }
        };
        let (Some(priv_validator), Some(address)) = (&self.priv_validator, self.address) else {
            return Ok(None);
        };
        let proof = priv_validator.generate_vrf_proof(&self.state.make_hash_message(round));
        Ok(Some(self.executor.create_proposal_block(
            height,
            &self.state,
            commit,
            address,
            round,
            proof,
        )))
    }

    fn set_proposal(&mut self, proposal: Proposal) -> Result<(), Error> {
        if self.rs.proposal.is_some()
            || proposal.height != self.rs.height
            || proposal.round != self.rs.round
        {
            return Ok(());
        }
        proposal.validate_basic()?;
        let proposer = self.state.proposer(proposal.round);
        if !proposal.verify(&self.state.chain_id, &proposer.pub_key) {
            return Err(Error::InvalidProposalSignature);
        }

        // Keep the parts we are already collecting (for the block we commit or re-propose)
        if self.rs.proposal_block_parts.is_none() {
            self.rs.proposal_block_parts =
                Some(PartSet::from_header(&proposal.block_id.part_set_header));
        }
        info!(
            height = proposal.height,
            round = proposal.round,
            block = %proposal.block_id.hash,
            "received proposal"
        );
        self.rs.proposal = Some(proposal);
        Ok(())
    }

    /// Adds a part of the proposal block, handling the block once complete.
    fn add_proposal_block_part(&mut self, height: u64, part: Part) -> Result<bool, Error> {
        if height != self.rs.height {
            return Ok(false);
        }
        let Some(parts) = self.rs.proposal_block_parts.as_mut() else {
            return Ok(false);
        };
        if !parts.add_part(part)? {
            return Ok(false);
        }
        let max_bytes = self.state.consensus_params.block.max_bytes;
        if parts.byte_size() as i64 > max_bytes {
            return Err(Error::InvalidBlockPart(format!(
                "total size of proposal block parts exceeds maximum block bytes ({} > {max_bytes})",
                parts.byte_size()
            )));
        }
        if !parts.is_complete() {
            return Ok(true);
        }

        let part_set_header = parts.header();
        let raw = parts
            .assemble()
            .ok_or_else(|| Error::InvalidBlockPart("incomplete part set".into()))?;
        let block = Block::decode(raw)?;
        let block_id = BlockId {
            hash: block.hash(),
            part_set_header,
        };
        info!(height, block = %block_id.hash, "received complete proposal block");
        self.rs.proposal_block = Some(block);
        self.events.publish(Event::CompleteProposal {
            state: self.rs.event(),
            block_id,
        });
        self.handle_complete_proposal(height)?;
        Ok(true)
    }

    fn handle_complete_proposal(&mut self, height: u64) -> Result<(), Error> {
        let round = self.rs.round;

        // Update the valid block if the proposal has a polka in this round
        let maj23 = self
            .rs
            .votes
            .prevotes(round)
            .and_then(VoteSet::two_thirds_majority);
        if let Some(block_id) = &maj23 {
            if !block_id.is_nil()
                && self.rs.valid_round.map_or(true, |valid| valid < round)
                && self.proposal_block_hashes_to(block_id)
            {
                debug!(height, round, block = %block_id.hash, "updating valid block to new proposal block");
                self.rs.valid_round = Some(round);
                self.rs.valid_block = self.rs.proposal_block.clone();
                self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
            }
        }

        if self.rs.step <= RoundStep::Propose && self.is_proposal_complete() {
            self.enter_prevote(height, round)?;
            if maj23.is_some() {
                self.enter_precommit(height, round)?;
            }
        } else if self.rs.step == RoundStep::Commit {
            self.try_finalize_commit(height)?;
        }
        Ok(())
    }

    /// Whether we have the proposal, its block and (if it claims one) its polka.
    fn is_proposal_complete(&self) -> bool {
        let (Some(proposal), Some(_)) = (&self.rs.proposal, &self.rs.proposal_block) else {
            return false;
        };
        match proposal.pol_round {
            None => true,
            Some(pol_round) => self
                .rs
                .votes
                .prevotes(pol_round)
                .is_some_and(VoteSet::has_two_thirds_majority),
        }
    }

    fn proposal_block_hashes_to(&self, block_id: &BlockId) -> bool {
        self.rs
            .proposal_block
            .as_ref()
            .is_some_and(|block| block.hashes_to(&block_id.hash))
    }

    fn locked_block_hashes_to(&self, block_id: &BlockId) -> bool {
        self.rs
            .locked_block
            .as_ref()
            .is_some_and(|block| block.hashes_to(&block_id.hash))
    }

    fn unlock(&mut self) {
        self.rs.locked_round = None;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
    }

    /// Collects the parts of `block_id` unless we already do.
    fn reset_proposal_block_for(&mut self, block_id: &BlockId) -> bool {
        if self
            .rs
            .proposal_block_parts
            .as_ref()
            .is_some_and(|parts| parts.has_header(&block_id.part_set_header))
        {
            return false;
        }
        self.rs.proposal_block = None;
        self.rs.proposal_block_parts = Some(PartSet::from_header(&block_id.part_set_header));
        true
    }

    fn enter_prevote(&mut self, height: u64, round: u32) -> Result<(), Error> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && RoundStep::Prevote <= rs.step)
        {
            debug!(height, round, current_round = rs.round, step = ?rs.step, "skipping prevote");
            return Ok(());
        }
        info!(height, round, "entering prevote step");
        self.do_prevote();
        self.update_round_step(round, RoundStep::Prevote);
        self.new_step()
    }

    fn do_prevote(&mut self) {
        // Prevote the block we are locked on
        if let (Some(block), Some(parts)) = (&self.rs.locked_block, &self.rs.locked_block_parts) {
            let block_id = BlockId {
                hash: block.hash(),
                part_set_header: parts.header(),
            };
            debug!(block = %block_id.hash, "prevoting locked block");
            self.sign_add_vote(SignedMsgType::Prevote, block_id);
            return;
        }

        let (Some(block), Some(parts)) = (&self.rs.proposal_block, &self.rs.proposal_block_parts)
        else {
            debug!("prevoting nil without a proposal block");
            self.sign_add_vote(SignedMsgType::Prevote, BlockId::nil());
            return;
        };
        if let Err(err) = self.executor.validate_block(&self.state, block) {
            warn!(?err, "proposal block is invalid; prevoting nil");
            self.sign_add_vote(SignedMsgType::Prevote, BlockId::nil());
            return;
        }
        let block_id = BlockId {
            hash: block.hash(),
            part_set_header: parts.header(),
        };
        self.sign_add_vote(SignedMsgType::Prevote, block_id);
    }

    fn enter_prevote_wait(&mut self, height: u64, round: u32) -> Result<(), Error> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && RoundStep::PrevoteWait <= rs.step)
        {
            return Ok(());
        }
        if !rs
            .votes
            .prevotes(round)
            .is_some_and(VoteSet::has_two_thirds_any)
        {
            warn!(height, round, "entering prevote wait without two thirds of prevotes");
            return Ok(());
        }
        info!(height, round, "entering prevote wait step");
        self.update_round_step(round, RoundStep::PrevoteWait);
        self.new_step()?;
        let timeout = self.config.prevote(round);
        self.schedule_timeout(timeout, height, round, RoundStep::PrevoteWait);
        Ok(())
    }

    /// Precommits the block with a polka in `round` (locking on it) or nil.
    fn enter_precommit(&mut self, height: u64, round: u32) -> Result<(), Error> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && RoundStep::Precommit <= rs.step)
        {
            debug!(height, round, current_round = rs.round, step = ?rs.step, "skipping precommit");
            return Ok(());
        }
        info!(height, round, "entering precommit step");
        self.do_precommit(height, round);
        self.update_round_step(round, RoundStep::Precommit);
        self.new_step()
    }

    fn do_precommit(&mut self, height: u64, round: u32) {
        let maj23 = self
            .rs
            .votes
            .prevotes(round)
            .and_then(VoteSet::two_thirds_majority);
        let Some(block_id) = maj23 else {
            if self.rs.locked_block.is_some() {
                debug!(height, round, "no polka; precommitting nil while locked");
            }
            self.sign_add_vote(SignedMsgType::Precommit, BlockId::nil());
            return;
        };
        self.events.publish(Event::Polka(self.rs.event()));

        // A polka for nil releases the lock
        if block_id.is_nil() {
            if self.rs.locked_block.is_some() {
                info!(height, round, "polka for nil; unlocking");
                self.unlock();
                self.events.publish(Event::Unlock(self.rs.event()));
            }
            self.sign_add_vote(SignedMsgType::Precommit, BlockId::nil());
            return;
        }

        if self.locked_block_hashes_to(&block_id) {
            debug!(height, round, block = %block_id.hash, "polka for locked block; relocking");
            self.rs.locked_round = Some(round);
            self.events.publish(Event::Relock(self.rs.event()));
            self.sign_add_vote(SignedMsgType::Precommit, block_id);
            return;
        }

        if self.proposal_block_hashes_to(&block_id) {
            if let Some(block) = &self.rs.proposal_block {
                if let Err(err) = self.executor.validate_block(&self.state, block) {
                    error!(?err, height, round, "polka for an invalid block; precommitting nil");
                    self.sign_add_vote(SignedMsgType::Precommit, BlockId::nil());
                    return;
                }
            }
            info!(height, round, block = %block_id.hash, "polka for proposal block; locking");
            self.rs.locked_round = Some(round);
            self.rs.locked_block = self.rs.proposal_block.clone();
            self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
            self.events.publish(Event::Lock(self.rs.event()));
            self.sign_add_vote(SignedMsgType::Precommit, block_id);
            return;
        }

        // A polka for a block we don't have: fetch it and precommit nil
        info!(height, round, block = %block_id.hash, "polka for unknown block; precommitting nil");
        self.unlock();
        self.reset_proposal_block_for(&block_id);
        self.events.publish(Event::Unlock(self.rs.event()));
        self.sign_add_vote(SignedMsgType::Precommit, BlockId::nil());
    }

    fn enter_precommit_wait(&mut self, height: u64, round: u32) -> Result<(), Error> {
        let rs = &self.rs;
        if rs.height != height
            || round < rs.round
            || (rs.round == round && rs.triggered_timeout_precommit)
        {
            return Ok(());
        }
        if !rs
            .votes
            .precommits(round)
            .is_some_and(VoteSet::has_two_thirds_any)
        {
            warn!(height, round, "entering precommit wait without two thirds of precommits");
            return Ok(());
        }
        info!(height, round, "entering precommit wait step");
        self.rs.triggered_timeout_precommit = true;
        self.new_step()?;
        let timeout = self.config.precommit(round);
        self.schedule_timeout(timeout, height, round, RoundStep::PrecommitWait);
        Ok(())
    }

    fn enter_commit(&mut self, height: u64, commit_round: u32) -> Result<(), Error> {
        if self.rs.height != height || RoundStep::Commit <= self.rs.step {
            return Ok(());
        }
        let Some(block_id) = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(VoteSet::two_thirds_majority)
        else {
            warn!(height, commit_round, "entering commit without two thirds of precommits");
            return Ok(());
        };
        info!(height, commit_round, block = %block_id.hash, "entering commit step");

        // The block we are locked on is the one committed
        if self.locked_block_hashes_to(&block_id) {
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
        }
        if !self.proposal_block_hashes_to(&block_id) && self.reset_proposal_block_for(&block_id) {
            self.events.publish(Event::ValidBlock(self.rs.event()));
        }

        self.rs.step = RoundStep::Commit;
        self.rs.commit_round = Some(commit_round);
        self.rs.commit_time = self.now();
        self.new_step()?;
        self.try_finalize_commit(height)
    }

    fn try_finalize_commit(&mut self, height: u64) -> Result<(), Error> {
        if self.rs.height != height {
            return Ok(());
        }
        let Some(block_id) = self
            .rs
            .commit_round
            .and_then(|round| self.rs.votes.precommits(round))
            .and_then(VoteSet::two_thirds_majority)
        else {
            return Ok(());
        };
        if block_id.is_nil() {
            return Ok(());
        }
        if !self.proposal_block_hashes_to(&block_id) {
            debug!(height, block = %block_id.hash, "waiting for the committed block");
            return Ok(());
        }
        self.finalize_commit(height)
    }

    /// Stores, executes and moves past the committed block.
    fn finalize_commit(&mut self, height: u64) -> Result<(), Error> {
        if self.rs.height != height || self.rs.step != RoundStep::Commit {
            return Ok(());
        }
        let (Some(block), Some(parts), Some(commit_round)) = (
            self.rs.proposal_block.clone(),
            self.rs.proposal_block_parts.clone(),
            self.rs.commit_round,
        ) else {
            return Ok(());
        };
        let block_id = BlockId {
            hash: block.hash(),
            part_set_header: parts.header(),
        };
        self.executor
            .validate_block(&self.state, &block)
            .map_err(|err| Error::InvalidCommittedBlock {
                height,
                reason: err.to_string(),
            })?;
        info!(
            height,
            block = %block_id.hash,
            txs = block.data.txs.len(),
            "finalizing commit of block"
        );

        if self.block_store.height() < height {
            let seen_commit = self
                .rs
                .votes
                .precommits(commit_round)
                .map(VoteSet::make_commit)
                .unwrap_or_default();
            self.block_store.save_block(&block, &parts, &seen_commit)?;
        } else {
            debug!(height, "block already stored");
        }

        // From here on, replaying the WAL can't repeat this height
        self.wal_write(WalMessage::EndHeight(height), true)?;

        let (state, retain_height) =
            self.executor
                .apply_block(self.state.clone(), block_id, &block)?;
        if retain_height > 0 {
            self.prune(retain_height);
        }
        if let Err(err) = self.wal.prune(height) {
            warn!(?err, height, "failed to prune WAL");
        }
        self.record_block_metrics(&block);

        self.update_to_state(state)?;
        self.schedule_round0();
        Ok(())
    }

    fn prune(&mut self, retain_height: u64) {
        match self.block_store.prune_blocks(retain_height) {
            Ok(pruned) => {
                info!(pruned, retain_height, "pruned blocks");
                if let Err(err) = self.executor.store_mut().prune_states(retain_height) {
                    error!(?err, retain_height, "failed to prune states");
                }
            }
            Err(err) => error!(?err, retain_height, "failed to prune blocks"),
        }
    }

    fn record_block_metrics(&self, block: &Block) {
        let height = block.height();
        let txs = block.data.txs.len() as u64;
        self.metrics.committed_height.set(height as i64);
        self.metrics.num_txs.set(txs as i64);
        self.metrics.total_txs.inc_by(txs);
        if height > self.state.initial_height {
            let missing = block
                .last_commit
                .signatures
                .iter()
                .filter(|sig| sig.is_absent())
                .count();
            self.metrics.missing_validators.set(missing as i64);
            let interval = block.header.time.saturating_sub(self.state.last_block_time);
            self.metrics
                .block_interval_seconds
                .observe(interval as f64 / 1_000.0);
        }
    }

    fn try_add_vote(&mut self, vote: Vote, peer: Option<&str>) -> Result<bool, Error> {
        match self.add_vote(vote, peer) {
            Err(Error::ConflictingVotes(conflict)) => {
                let added = conflict.added;
                let (vote_a, vote_b) = (conflict.vote_a, conflict.vote_b);
                if self.address == Some(vote_b.validator_address) {
                    error!(
                        height = vote_b.height,
                        round = vote_b.round,
                        "found conflicting vote from ourselves; did the validator state get reset?"
                    );
                    return Ok(added);
                }
                warn!(
                    height = vote_b.height,
                    round = vote_b.round,
                    validator = %vote_b.validator_address,
                    "found conflicting vote"
                );
                self.metrics.byzantine_validators.inc();
                self.executor.report_conflicting_votes(vote_a, vote_b);
                Ok(added)
            }
            result => result,
        }
    }

    fn add_vote(&mut self, vote: Vote, peer: Option<&str>) -> Result<bool, Error> {
        let height = self.rs.height;

        // A late precommit for the last block
        if vote.height + 1 == height && vote.vote_type == SignedMsgType::Precommit {
            if self.rs.step != RoundStep::NewHeight {
                return Ok(false);
            }
            let Some(last_commit) = self.rs.last_commit.as_mut() else {
                return Ok(false);
            };
            if !last_commit.add_vote(vote.clone())? {
                return Ok(false);
            }
            let has_all = last_commit.has_all();
            debug!(height = vote.height, "added precommit to last commit");
            self.events.publish(Event::Vote(vote));
            if self.config.skip_timeout_commit && has_all {
                self.enter_new_round(height, 0)?;
            }
            return Ok(true);
        }

        if vote.height != height {
            trace!(vote_height = vote.height, height, "ignoring vote for another height");
            return Ok(false);
        }
        let (vote_type, round) = (vote.vote_type, vote.round);
        if !self.rs.votes.add_vote(vote.clone(), peer)? {
            return Ok(false);
        }
        self.events.publish(Event::Vote(vote));
        match vote_type {
            SignedMsgType::Prevote => self.handle_prevote_added(height, round)?,
            SignedMsgType::Precommit => self.handle_precommit_added(height, round)?,
            SignedMsgType::Proposal => {}
        }
        Ok(true)
    }

    fn handle_prevote_added(&mut self, height: u64, vote_round: u32) -> Result<(), Error> {
        let Some(prevotes) = self.rs.votes.prevotes(vote_round) else {
            return Ok(());
        };
        let maj23 = prevotes.two_thirds_majority();
        let two_thirds_any = prevotes.has_two_thirds_any();
        trace!(height, vote_round, ?maj23, "added prevote");

        if let Some(block_id) = &maj23 {
            // Unlock if a later polka is for another block
            if self.rs.locked_block.is_some()
                && self.rs.locked_round.is_some_and(|locked| locked < vote_round)
                && vote_round <= self.rs.round
                && !self.locked_block_hashes_to(block_id)
            {
                info!(height, vote_round, "unlocking because of a later polka");
                self.unlock();
                self.events.publish(Event::Unlock(self.rs.event()));
            }

            // Track the block of a polka in the current round
            if !block_id.is_nil()
                && self.rs.valid_round.map_or(true, |valid| valid < vote_round)
                && vote_round == self.rs.round
            {
                if self.proposal_block_hashes_to(block_id) {
                    debug!(height, vote_round, block = %block_id.hash, "updating valid block");
                    self.rs.valid_round = Some(vote_round);
                    self.rs.valid_block = self.rs.proposal_block.clone();
                    self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
                } else {
                    self.rs.proposal_block = None;
                }
                self.reset_proposal_block_for(block_id);
                self.events.publish(Event::ValidBlock(self.rs.event()));
            }
        }

        let round = self.rs.round;
        if round < vote_round && two_thirds_any {
            // Skip to the round others are in
            self.enter_new_round(height, vote_round)?;
        } else if round == vote_round && RoundStep::Prevote <= self.rs.step {
            match maj23 {
                Some(block_id) if block_id.is_nil() || self.is_proposal_complete() => {
                    self.enter_precommit(height, vote_round)?;
                }
                _ if two_thirds_any => self.enter_prevote_wait(height, vote_round)?,
                _ => {}
            }
        } else if self
            .rs
            .proposal
            .as_ref()
            .is_some_and(|proposal| proposal.pol_round == Some(vote_round))
            && self.is_proposal_complete()
        {
            self.enter_prevote(height, round)?;
        }
        Ok(())
    }

    fn handle_precommit_added(&mut self, height: u64, vote_round: u32) -> Result<(), Error> {
        let Some(precommits) = self.rs.votes.precommits(vote_round) else {
            return Ok(());
        };
        let maj23 = precommits.two_thirds_majority();
        let two_thirds_any = precommits.has_two_thirds_any();
        let has_all = precommits.has_all();
        trace!(height, vote_round, ?maj23, "added precommit");

        match maj23 {
            Some(block_id) => {
                self.enter_new_round(height, vote_round)?;
                self.enter_precommit(height, vote_round)?;
                if block_id.is_nil() {
                    self.enter_precommit_wait(height, vote_round)?;
                } else {
                    self.enter_commit(height, vote_round)?;
                    if self.config.skip_timeout_commit && has_all {
                        self.enter_new_round(self.rs.height, 0)?;
                    }
                }
            }
            None if self.rs.round <= vote_round && two_thirds_any => {
                self.enter_new_round(height, vote_round)?;
                self.enter_precommit_wait(height, vote_round)?;
            }
            None => {}
        }
        Ok(())
    }

    /// Earliest time for our next vote: after the block we vote on and the last block.
    fn vote_time(&self) -> u64 {
        let block_time = self
            .rs
            .locked_block
            .as_ref()
            .or(self.rs.proposal_block.as_ref())
            .map_or(0, |block| block.header.time + 1);
        self.now()
            .max(block_time)
            .max(self.state.last_block_time + 1)
    }

    /// Signs a vote of the current round and queues it (if we are a voter).
    fn sign_add_vote(&mut self, vote_type: SignedMsgType, block_id: BlockId) {
        let Some(address) = self.address else {
            return;
        };
        let Some((index, _)) = self.rs.voters.get_by_address(&address) else {
            return;
        };
        if self.replay_mode {
            self.deferred_votes.push((vote_type, self.rs.round, block_id));
            return;
        }
        let mut vote = Vote {
            vote_type,
            height: self.rs.height,
            round: self.rs.round,
            block_id,
            timestamp: self.vote_time(),
            validator_address: address,
            validator_index: index,
            signature: Bytes::new(),
        };
        let Some(priv_validator) = self.priv_validator.as_mut() else {
            return;
        };
        match priv_validator.sign_vote(&self.state.chain_id, &mut vote) {
            Ok(()) => {
                debug!(height = vote.height, round = vote.round, %vote_type, "signed vote");
                self.internal.push_back(ConsensusMessage::Vote(vote));
            }
            Err(err) => error!(?err, height = vote.height, round = vote.round, "failed to sign vote"),
        }
    }
}
