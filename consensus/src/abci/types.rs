//! Requests and responses exchanged with the application.

use crate::types::{
    BlockParams, ConsensusParams, ConsensusParamsUpdate, EvidenceParams, Header, ValidatorParams,
};
use bytes::{Buf, BufMut, Bytes};
use halcyon_codec::{EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, Write};
use halcyon_cryptography::{Address, Digest, KeyType, PublicKey};

/// Response code of a successful request.
pub const CODE_TYPE_OK: u32 = 0;

const MAX_EVENTS: usize = 1024;
const MAX_ATTRIBUTES: usize = 256;
const MAX_FIELD: usize = 1 << 20;
const MAX_UPDATES: usize = 10_000;
const MAX_TXS: usize = 1 << 20;

/// Key-value annotation attached to a response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventAttribute {
    pub key: Bytes,
    pub value: Bytes,
}

/// Typed group of attributes emitted by the application.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AbciEvent {
    pub kind: String,
    pub attributes: Vec<EventAttribute>,
}

impl Write for EventAttribute {
    fn write(&self, buf: &mut impl BufMut) {
        self.key.write(buf);
        self.value.write(buf);
    }
}

impl EncodeSize for EventAttribute {
    fn encode_size(&self) -> usize {
        self.key.encode_size() + self.value.encode_size()
    }
}

impl Read for EventAttribute {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            key: Bytes::read_cfg(buf, &RangeCfg::from(..=MAX_FIELD))?,
            value: Bytes::read_cfg(buf, &RangeCfg::from(..=MAX_FIELD))?,
        })
    }
}

impl Write for AbciEvent {
    fn write(&self, buf: &mut impl BufMut) {
        self.kind.write(buf);
        self.attributes.write(buf);
    }
}

impl EncodeSize for AbciEvent {
    fn encode_size(&self) -> usize {
        self.kind.encode_size() + self.attributes.encode_size()
    }
}

impl Read for AbciEvent {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            kind: String::read_cfg(buf, &RangeCfg::from(..=MAX_FIELD))?,
            attributes: Vec::<EventAttribute>::read_cfg(
                buf,
                &(RangeCfg::from(..=MAX_ATTRIBUTES), ()),
            )?,
        })
    }
}

fn read_events(buf: &mut impl Buf) -> Result<Vec<AbciEvent>, CodecError> {
    Vec::<AbciEvent>::read_cfg(buf, &(RangeCfg::from(..=MAX_EVENTS), ()))
}

/// Change of a validator's power requested by the application (zero removes it).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatorUpdate {
    pub pub_key: PublicKey,
    pub power: i64,
}

impl Write for ValidatorUpdate {
    fn write(&self, buf: &mut impl BufMut) {
        self.pub_key.write(buf);
        self.power.write(buf);
    }
}

impl EncodeSize for ValidatorUpdate {
    fn encode_size(&self) -> usize {
        self.pub_key.encode_size() + self.power.encode_size()
    }
}

impl Read for ValidatorUpdate {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            pub_key: PublicKey::read(buf)?,
            power: i64::read(buf)?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestInfo {
    pub version: String,
    pub block_version: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseInfo {
    pub data: String,
    pub version: String,
    pub app_version: u64,
    pub last_block_height: u64,
    pub last_block_app_hash: Bytes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestInitChain {
    /// Milliseconds since the UNIX epoch.
    pub time: u64,
    pub chain_id: String,
    pub consensus_params: Option<ConsensusParams>,
    pub validators: Vec<ValidatorUpdate>,
    pub app_state_bytes: Bytes,
    pub initial_height: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseInitChain {
    pub consensus_params: Option<ConsensusParamsUpdate>,
    pub validators: Vec<ValidatorUpdate>,
    pub app_hash: Bytes,
}

/// A voter's participation in the previous block's commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteInfo {
    pub address: Address,
    pub power: i64,
    pub signed_last_block: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LastCommitInfo {
    pub round: u32,
    pub votes: Vec<VoteInfo>,
}

/// Misbehavior reported to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Misbehavior {
    pub address: Address,
    pub power: i64,
    pub height: u64,
    pub time: u64,
    pub total_voting_power: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestBeginBlock {
    pub hash: Digest,
    pub header: Header,
    pub last_commit_info: LastCommitInfo,
    pub byzantine_validators: Vec<Misbehavior>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseBeginBlock {
    pub events: Vec<AbciEvent>,
}

impl Write for ResponseBeginBlock {
    fn write(&self, buf: &mut impl BufMut) {
        self.events.write(buf);
    }
}

impl EncodeSize for ResponseBeginBlock {
    fn encode_size(&self) -> usize {
        self.events.encode_size()
    }
}

impl Read for ResponseBeginBlock {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            events: read_events(buf)?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestDeliverTx {
    pub tx: Bytes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseDeliverTx {
    pub code: u32,
    pub data: Bytes,
    pub log: String,
    pub gas_wanted: i64,
    pub gas_used: i64,
    pub events: Vec<AbciEvent>,
}

impl ResponseDeliverTx {
    pub fn is_ok(&self) -> bool {
        self.code == CODE_TYPE_OK
    }
}

impl Write for ResponseDeliverTx {
    fn write(&self, buf: &mut impl BufMut) {
        self.code.write(buf);
        self.data.write(buf);
        self.log.write(buf);
        self.gas_wanted.write(buf);
        self.gas_used.write(buf);
        self.events.write(buf);
    }
}

impl EncodeSize for ResponseDeliverTx {
    fn encode_size(&self) -> usize {
        self.code.encode_size()
            + self.data.encode_size()
            + self.log.encode_size()
            + self.gas_wanted.encode_size()
            + self.gas_used.encode_size()
            + self.events.encode_size()
    }
}

impl Read for ResponseDeliverTx {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            code: u32::read(buf)?,
            data: Bytes::read_cfg(buf, &RangeCfg::from(..=MAX_FIELD))?,
            log: String::read_cfg(buf, &RangeCfg::from(..=MAX_FIELD))?,
            gas_wanted: i64::read(buf)?,
            gas_used: i64::read(buf)?,
            events: read_events(buf)?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestEndBlock {
    pub height: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseEndBlock {
    pub validator_updates: Vec<ValidatorUpdate>,
    pub consensus_param_updates: Option<ConsensusParamsUpdate>,
    pub events: Vec<AbciEvent>,
}

impl Write for ConsensusParamsUpdate {
    fn write(&self, buf: &mut impl BufMut) {
        self.block.map(|b| b.max_bytes).write(buf);
        self.block.map(|b| b.max_gas).write(buf);
        self.evidence.map(|e| e.max_age_num_blocks).write(buf);
        self.evidence.map(|e| e.max_bytes).write(buf);
        self.validator
            .as_ref()
            .map(|v| v.pub_key_types.clone())
            .write(buf);
        self.app_version.write(buf);
    }
}

impl EncodeSize for ConsensusParamsUpdate {
    fn encode_size(&self) -> usize {
        let block = if self.block.is_some() { 2 + 16 } else { 2 };
        let evidence = if self.evidence.is_some() { 2 + 16 } else { 2 };
        block
            + evidence
            + self
                .validator
                .as_ref()
                .map(|v| v.pub_key_types.clone())
                .encode_size()
            + self.app_version.encode_size()
    }
}

impl Read for ConsensusParamsUpdate {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let max_bytes = Option::<i64>::read(buf)?;
        let max_gas = Option::<i64>::read(buf)?;
        let block = match (max_bytes, max_gas) {
            (Some(max_bytes), Some(max_gas)) => Some(BlockParams { max_bytes, max_gas }),
            (None, None) => None,
            _ => return Err(CodecError::Invalid("ConsensusParamsUpdate", "partial block")),
        };
        let max_age_num_blocks = Option::<u64>::read(buf)?;
        let max_evidence_bytes = Option::<i64>::read(buf)?;
        let evidence = match (max_age_num_blocks, max_evidence_bytes) {
            (Some(max_age_num_blocks), Some(max_bytes)) => Some(EvidenceParams {
                max_age_num_blocks,
                max_bytes,
            }),
            (None, None) => None,
            _ => return Err(CodecError::Invalid("ConsensusParamsUpdate", "partial evidence")),
        };
        let validator = Option::<Vec<KeyType>>::read_cfg(buf, &(RangeCfg::from(..=8), ()))?
            .map(|pub_key_types| ValidatorParams { pub_key_types });
        Ok(Self {
            block,
            evidence,
            validator,
            app_version: Option::<u64>::read(buf)?,
        })
    }
}

impl Write for ResponseEndBlock {
    fn write(&self, buf: &mut impl BufMut) {
        self.validator_updates.write(buf);
        self.consensus_param_updates.write(buf);
        self.events.write(buf);
    }
}

impl EncodeSize for ResponseEndBlock {
    fn encode_size(&self) -> usize {
        self.validator_updates.encode_size()
            + self.consensus_param_updates.encode_size()
            + self.events.encode_size()
    }
}

impl Read for ResponseEndBlock {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            validator_updates: Vec::<ValidatorUpdate>::read_cfg(
                buf,
                &(RangeCfg::from(..=MAX_UPDATES), ()),
            )?,
            consensus_param_updates: Option::<ConsensusParamsUpdate>::read(buf)?,
            events: read_events(buf)?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseCommit {
    /// The application hash after the block.
    pub data: Bytes,
    /// Blocks below this height may be pruned (zero retains everything).
    pub retain_height: u64,
}

/// Whether a transaction is checked for the first time or re-checked after a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CheckTxKind {
    #[default]
    New,
    Recheck,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestCheckTx {
    pub tx: Bytes,
    pub kind: CheckTxKind,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseCheckTx {
    pub code: u32,
    pub data: Bytes,
    pub log: String,
    pub gas_wanted: i64,
}

impl ResponseCheckTx {
    pub fn is_ok(&self) -> bool {
        self.code == CODE_TYPE_OK
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestQuery {
    pub data: Bytes,
    pub path: String,
    pub height: u64,
    pub prove: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseQuery {
    pub code: u32,
    pub log: String,
    pub key: Bytes,
    pub value: Bytes,
    pub height: u64,
}

/// Description of a state snapshot offered by the application.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub height: u64,
    pub format: u32,
    pub chunks: u32,
    pub hash: Bytes,
    pub metadata: Bytes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseListSnapshots {
    pub snapshots: Vec<Snapshot>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestOfferSnapshot {
    pub snapshot: Snapshot,
    pub app_hash: Bytes,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OfferSnapshotResult {
    #[default]
    Unknown,
    Accept,
    Abort,
    Reject,
    RejectFormat,
    RejectSender,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseOfferSnapshot {
    pub result: OfferSnapshotResult,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestLoadSnapshotChunk {
    pub height: u64,
    pub format: u32,
    pub chunk: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseLoadSnapshotChunk {
    pub chunk: Bytes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestApplySnapshotChunk {
    pub index: u32,
    pub chunk: Bytes,
    pub sender: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ApplySnapshotChunkResult {
    #[default]
    Unknown,
    Accept,
    Abort,
    Retry,
    RetrySnapshot,
    RejectSnapshot,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseApplySnapshotChunk {
    pub result: ApplySnapshotChunkResult,
    pub refetch_chunks: Vec<u32>,
    pub reject_senders: Vec<String>,
}

/// Any request to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Flush,
    Info(RequestInfo),
    InitChain(RequestInitChain),
    BeginBlock(RequestBeginBlock),
    DeliverTx(RequestDeliverTx),
    EndBlock(RequestEndBlock),
    Commit,
    CheckTx(RequestCheckTx),
    Query(RequestQuery),
    ListSnapshots,
    OfferSnapshot(RequestOfferSnapshot),
    LoadSnapshotChunk(RequestLoadSnapshotChunk),
    ApplySnapshotChunk(RequestApplySnapshotChunk),
}

/// Any response from the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Flush,
    Info(ResponseInfo),
    InitChain(ResponseInitChain),
    BeginBlock(ResponseBeginBlock),
    DeliverTx(ResponseDeliverTx),
    EndBlock(ResponseEndBlock),
    Commit(ResponseCommit),
    CheckTx(ResponseCheckTx),
    Query(ResponseQuery),
    ListSnapshots(ResponseListSnapshots),
    OfferSnapshot(ResponseOfferSnapshot),
    LoadSnapshotChunk(ResponseLoadSnapshotChunk),
    ApplySnapshotChunk(ResponseApplySnapshotChunk),
}

/// Responses of the application to the execution of a block.
///
/// Persisted per height so a block can be re-applied to a fresh application without
/// executing it again.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AbciResponses {
    pub deliver_txs: Vec<ResponseDeliverTx>,
    pub end_block: ResponseEndBlock,
    pub begin_block: ResponseBeginBlock,
}

impl AbciResponses {
    /// Hash of the deterministic fields of the transaction results.
    pub fn results_hash(&self) -> Digest {
        let leaves: Vec<Vec<u8>> = self
            .deliver_txs
            .iter()
            .map(|res| {
                let mut leaf = Vec::new();
                res.code.write(&mut leaf);
                res.data.write(&mut leaf);
                res.gas_wanted.write(&mut leaf);
                res.gas_used.write(&mut leaf);
                leaf
            })
            .collect();
        crate::types::merkle::hash_from_byte_slices(&leaves)
    }
}

impl Write for AbciResponses {
    fn write(&self, buf: &mut impl BufMut) {
        self.deliver_txs.write(buf);
        self.end_block.write(buf);
        self.begin_block.write(buf);
    }
}

impl EncodeSize for AbciResponses {
    fn encode_size(&self) -> usize {
        self.deliver_txs.encode_size() + self.end_block.encode_size() + self.begin_block.encode_size()
    }
}

impl Read for AbciResponses {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            deliver_txs: Vec::<ResponseDeliverTx>::read_cfg(buf, &(RangeCfg::from(..=MAX_TXS), ()))?,
            end_block: ResponseEndBlock::read(buf)?,
            begin_block: ResponseBeginBlock::read(buf)?,
        })
    }
}
