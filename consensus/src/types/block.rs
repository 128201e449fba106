use super::{
    merkle::hash_from_byte_slices, vote::MAX_CHAIN_ID_LENGTH, vote::MAX_SIGNATURE_SIZE, Commit,
    DuplicateVoteEvidence, PartSet, PartSetHeader,
};
use crate::Error;
use bytes::{Buf, BufMut, Bytes};
use halcyon_codec::{Encode, EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, Write};
use halcyon_cryptography::{hash, Address, Digest};
use std::fmt::Display;

/// Version of the block layout.
pub const BLOCK_PROTOCOL: u64 = 11;

/// Upper bound on the size of an encoded block.
pub const MAX_BLOCK_SIZE_BYTES: usize = 104_857_600;

/// Upper bound on the size of an application hash.
pub const MAX_APP_HASH_SIZE: usize = 256;

/// Upper bound on the number of transactions in a block.
const MAX_TXS: usize = 1 << 20;

/// Upper bound on the number of evidence items in a block.
const MAX_EVIDENCE: usize = 1 << 10;

/// Identifies a block by its header hash and the header of its part set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub hash: Digest,
    pub part_set_header: PartSetHeader,
}

impl BlockId {
    /// The id used by votes for no block.
    pub fn nil() -> Self {
        Self::default()
    }

    pub fn is_nil(&self) -> bool {
        self.hash.is_zero() && self.part_set_header.is_zero()
    }

    /// True when both the hash and the part set header are set.
    pub fn is_complete(&self) -> bool {
        !self.hash.is_zero() && self.part_set_header.total > 0 && !self.part_set_header.hash.is_zero()
    }

    /// Key used to tally votes for this block.
    pub fn key(&self) -> Vec<u8> {
        self.encode().to_vec()
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_nil() {
            return f.write_str("nil");
        }
        let hash = self.hash.to_string();
        let parts = self.part_set_header.hash.to_string();
        write!(
            f,
            "{}:{}:{}",
            &hash[..12],
            self.part_set_header.total,
            &parts[..12]
        )
    }
}

impl Write for BlockId {
    fn write(&self, buf: &mut impl BufMut) {
        self.hash.write(buf);
        self.part_set_header.write(buf);
    }
}

impl EncodeSize for BlockId {
    fn encode_size(&self) -> usize {
        self.hash.encode_size() + self.part_set_header.encode_size()
    }
}

impl Read for BlockId {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            hash: Digest::read(buf)?,
            part_set_header: PartSetHeader::read(buf)?,
        })
    }
}

/// Protocol versions a block was produced under.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Version {
    pub block: u64,
    pub app: u64,
}

impl Write for Version {
    fn write(&self, buf: &mut impl BufMut) {
        self.block.write(buf);
        self.app.write(buf);
    }
}

impl EncodeSize for Version {
    fn encode_size(&self) -> usize {
        self.block.encode_size() + self.app.encode_size()
    }
}

impl Read for Version {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            block: u64::read(buf)?,
            app: u64::read(buf)?,
        })
    }
}

/// Block header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub version: Version,
    pub chain_id: String,
    pub height: u64,
    /// Milliseconds since the UNIX epoch.
    pub time: u64,

    pub last_block_id: BlockId,

    pub last_commit_hash: Digest,
    pub data_hash: Digest,

    pub validators_hash: Digest,
    pub next_validators_hash: Digest,
    pub voters_hash: Digest,
    pub consensus_hash: Digest,
    pub app_hash: Bytes,
    pub last_results_hash: Digest,

    pub evidence_hash: Digest,
    pub proposer_address: Address,

    /// Round in which the block was proposed.
    pub round: u32,
    /// VRF proof of the proposer over the round's hash message.
    pub proof: Bytes,
}

impl Header {
    /// Merkle root over the encoded header fields.
    pub fn hash(&self) -> Digest {
        let fields: Vec<Vec<u8>> = vec![
            self.version.encode().to_vec(),
            self.chain_id.encode().to_vec(),
            self.height.encode().to_vec(),
            self.time.encode().to_vec(),
            self.last_block_id.encode().to_vec(),
            self.last_commit_hash.to_vec(),
            self.data_hash.to_vec(),
            self.validators_hash.to_vec(),
            self.next_validators_hash.to_vec(),
            self.voters_hash.to_vec(),
            self.consensus_hash.to_vec(),
            self.app_hash.to_vec(),
            self.last_results_hash.to_vec(),
            self.evidence_hash.to_vec(),
            self.proposer_address.as_ref().to_vec(),
            self.round.encode().to_vec(),
            self.proof.to_vec(),
        ];
        hash_from_byte_slices(&fields)
    }

    pub fn validate_basic(&self) -> Result<(), Error> {
        if self.version.block != BLOCK_PROTOCOL {
            return Err(Error::InvalidBlock(format!(
                "block protocol is incorrect: got {}, want {}",
                self.version.block, BLOCK_PROTOCOL
            )));
        }
        if self.chain_id.len() > MAX_CHAIN_ID_LENGTH {
            return Err(Error::InvalidBlock(format!(
                "chain id is too long: {}",
                self.chain_id.len()
            )));
        }
        if self.height == 0 {
            return Err(Error::InvalidBlock("zero height".into()));
        }
        if !self.last_block_id.is_nil() && !self.last_block_id.is_complete() {
            return Err(Error::InvalidBlock("incomplete last block id".into()));
        }
        if self.app_hash.len() > MAX_APP_HASH_SIZE {
            return Err(Error::InvalidBlock("app hash is too long".into()));
        }
        Ok(())
    }
}

impl Write for Header {
    fn write(&self, buf: &mut impl BufMut) {
        self.version.write(buf);
        self.chain_id.write(buf);
        self.height.write(buf);
        self.time.write(buf);
        self.last_block_id.write(buf);
        self.last_commit_hash.write(buf);
        self.data_hash.write(buf);
        self.validators_hash.write(buf);
        self.next_validators_hash.write(buf);
        self.voters_hash.write(buf);
        self.consensus_hash.write(buf);
        self.app_hash.write(buf);
        self.last_results_hash.write(buf);
        self.evidence_hash.write(buf);
        self.proposer_address.write(buf);
        self.round.write(buf);
        self.proof.write(buf);
    }
}

impl EncodeSize for Header {
    fn encode_size(&self) -> usize {
        self.version.encode_size()
            + self.chain_id.encode_size()
            + self.height.encode_size()
            + self.time.encode_size()
            + self.last_block_id.encode_size()
            + self.last_commit_hash.encode_size() * 6
            + self.app_hash.encode_size()
            + self.last_results_hash.encode_size() * 2
            + self.proposer_address.encode_size()
            + self.round.encode_size()
            + self.proof.encode_size()
    }
}

impl Read for Header {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            version: Version::read(buf)?,
            chain_id: String::read_cfg(buf, &RangeCfg::from(..=MAX_CHAIN_ID_LENGTH))?,
            height: u64::read(buf)?,
            time: u64::read(buf)?,
            last_block_id: BlockId::read(buf)?,
            last_commit_hash: Digest::read(buf)?,
            data_hash: Digest::read(buf)?,
            validators_hash: Digest::read(buf)?,
            next_validators_hash: Digest::read(buf)?,
            voters_hash: Digest::read(buf)?,
            consensus_hash: Digest::read(buf)?,
            app_hash: Bytes::read_cfg(buf, &RangeCfg::from(..=MAX_APP_HASH_SIZE))?,
            last_results_hash: Digest::read(buf)?,
            evidence_hash: Digest::read(buf)?,
            proposer_address: Address::read(buf)?,
            round: u32::read(buf)?,
            proof: Bytes::read_cfg(buf, &RangeCfg::from(..=MAX_SIGNATURE_SIZE))?,
        })
    }
}

/// Transactions included in a block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Data {
    pub txs: Vec<Bytes>,
}

impl Data {
    /// Merkle root over the hashes of the transactions.
    pub fn hash(&self) -> Digest {
        let leaves: Vec<Digest> = self.txs.iter().map(|tx| hash(tx)).collect();
        hash_from_byte_slices(&leaves)
    }
}

/// Merkle root over the hashes of a list of evidence.
pub fn evidence_hash(evidence: &[DuplicateVoteEvidence]) -> Digest {
    let leaves: Vec<Digest> = evidence.iter().map(|ev| ev.hash()).collect();
    hash_from_byte_slices(&leaves)
}

/// A block: header, transactions, evidence and the commit for the previous block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub data: Data,
    pub evidence: Vec<DuplicateVoteEvidence>,

    /// Empty at the initial height.
    pub last_commit: Commit,
}

impl Block {
    /// Creates a block at `height` with its derived hashes filled in.
    pub fn new(
        height: u64,
        txs: Vec<Bytes>,
        last_commit: Commit,
        evidence: Vec<DuplicateVoteEvidence>,
    ) -> Self {
        let mut block = Self {
            header: Header {
                version: Version {
                    block: BLOCK_PROTOCOL,
                    app: 0,
                },
                height,
                ..Default::default()
            },
            data: Data { txs },
            evidence,
            last_commit,
        };
        block.fill_header();
        block
    }

    /// Computes the hashes derived from the block's contents.
    pub fn fill_header(&mut self) {
        self.header.last_commit_hash = self.last_commit.hash();
        self.header.data_hash = self.data.hash();
        self.header.evidence_hash = evidence_hash(&self.evidence);
    }

    pub fn hash(&self) -> Digest {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Returns true if the block hashes to `hash`.
    pub fn hashes_to(&self, hash: &Digest) -> bool {
        !hash.is_zero() && self.hash() == *hash
    }

    /// Splits the encoded block into parts of `part_size` bytes.
    pub fn make_part_set(&self, part_size: usize) -> PartSet {
        PartSet::from_data(&self.encode(), part_size)
    }

    /// Size of the encoded block.
    pub fn size(&self) -> usize {
        self.encode_size()
    }

    /// Performs checks that do not depend on chain state.
    pub fn validate_basic(&self) -> Result<(), Error> {
        self.header.validate_basic()?;
        if !self.last_commit.is_empty() {
            self.last_commit.validate_basic()?;
        }
        if self.header.last_commit_hash != self.last_commit.hash() {
            return Err(Error::InvalidBlock("wrong last commit hash".into()));
        }
        if self.header.data_hash != self.data.hash() {
            return Err(Error::InvalidBlock("wrong data hash".into()));
        }
        for evidence in &self.evidence {
            evidence.validate_basic()?;
        }
        if self.header.evidence_hash != evidence_hash(&self.evidence) {
            return Err(Error::InvalidBlock("wrong evidence hash".into()));
        }
        Ok(())
    }
}

impl Write for Block {
    fn write(&self, buf: &mut impl BufMut) {
        self.header.write(buf);
        self.data.txs.write(buf);
        self.evidence.write(buf);
        self.last_commit.write(buf);
    }
}

impl EncodeSize for Block {
    fn encode_size(&self) -> usize {
        self.header.encode_size()
            + self.data.txs.encode_size()
            + self.evidence.encode_size()
            + self.last_commit.encode_size()
    }
}

impl Read for Block {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let header = Header::read(buf)?;
        let txs = Vec::<Bytes>::read_cfg(
            buf,
            &(
                RangeCfg::from(..=MAX_TXS),
                RangeCfg::from(..=MAX_BLOCK_SIZE_BYTES),
            ),
        )?;
        let evidence =
            Vec::<DuplicateVoteEvidence>::read_cfg(buf, &(RangeCfg::from(..=MAX_EVIDENCE), ()))?;
        let last_commit = Commit::read(buf)?;
        Ok(Self {
            header,
            data: Data { txs },
            evidence,
            last_commit,
        })
    }
}

/// Summary of a stored block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMeta {
    pub block_id: BlockId,
    pub block_size: u64,
    pub header: Header,
    pub num_txs: u64,
}

impl BlockMeta {
    pub fn new(block: &Block, parts: &PartSet) -> Self {
        Self {
            block_id: BlockId {
                hash: block.hash(),
                part_set_header: parts.header(),
            },
            block_size: parts.byte_size() as u64,
            header: block.header.clone(),
            num_txs: block.data.txs.len() as u64,
        }
    }
}

impl Write for BlockMeta {
    fn write(&self, buf: &mut impl BufMut) {
        self.block_id.write(buf);
        self.block_size.write(buf);
        self.header.write(buf);
        self.num_txs.write(buf);
    }
}

impl EncodeSize for BlockMeta {
    fn encode_size(&self) -> usize {
        self.block_id.encode_size()
            + self.block_size.encode_size()
            + self.header.encode_size()
            + self.num_txs.encode_size()
    }
}

impl Read for BlockMeta {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            block_id: BlockId::read(buf)?,
            block_size: u64::read(buf)?,
            header: Header::read(buf)?,
            num_txs: u64::read(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BLOCK_PART_SIZE;
    use halcyon_codec::DecodeExt;

    fn example_block() -> Block {
        let mut block = Block::new(
            1,
            vec![Bytes::from_static(b"a=1"), Bytes::from_static(b"b=2")],
            Commit::default(),
            Vec::new(),
        );
        block.header.chain_id = "test-chain".into();
        block.header.time = 1_600_000_000_000;
        block.header.proposer_address = Address::new([7; 20]);
        block
    }

    #[test]
    fn test_block_id_nil() {
        assert!(BlockId::nil().is_nil());
        assert!(!BlockId::nil().is_complete());
        assert_eq!(BlockId::nil().to_string(), "nil");

        let id = BlockId {
            hash: hash(b"block"),
            part_set_header: PartSetHeader {
                total: 1,
                hash: hash(b"parts"),
            },
        };
        assert!(!id.is_nil());
        assert!(id.is_complete());
        assert_ne!(id.key(), BlockId::nil().key());
    }

    #[test]
    fn test_block_validate_basic() {
        let block = example_block();
        block.validate_basic().unwrap();

        let mut tampered = block.clone();
        tampered.data.txs.push(Bytes::from_static(b"c=3"));
        assert!(matches!(
            tampered.validate_basic(),
            Err(Error::InvalidBlock(_))
        ));

        let mut zero = block.clone();
        zero.header.height = 0;
        assert!(zero.validate_basic().is_err());
    }

    #[test]
    fn test_header_hash_covers_fields() {
        let block = example_block();
        let mut other = block.clone();
        other.header.round = 1;
        assert_ne!(block.hash(), other.hash());

        let mut other = block.clone();
        other.header.proof = Bytes::from_static(b"proof");
        assert_ne!(block.hash(), other.hash());
    }

    #[test]
    fn test_block_part_set_reassembles() {
        let block = example_block();
        let parts = block.make_part_set(BLOCK_PART_SIZE);
        assert!(parts.is_complete());
        let decoded = Block::decode(parts.assemble().unwrap()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());

        let meta = BlockMeta::new(&block, &parts);
        assert_eq!(meta.num_txs, 2);
        assert_eq!(BlockMeta::decode(meta.encode()).unwrap(), meta);
    }
}
