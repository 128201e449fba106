//! Durable store of committed blocks, used by the state machine and the handshake.
//!
//! [BlockJournal] appends every block to its own [Journal] section (its meta, its parts,
//! the commit it carries for the previous block and the commit seen for it) and keeps the
//! offset of each item in memory. Only the range of stored heights is kept in [Metadata],
//! so saving a block costs the same at any height.
//!
//! A block is written and synced before the range is extended to cover it. On restart, any
//! section outside of the stored range (left by a crash during a save or a prune) is
//! removed.

use crate::{
    types::{Block, BlockMeta, Commit, Part, PartSet},
    Error,
};
use bytes::{Buf, BufMut};
use halcyon_codec::{DecodeExt, Encode, EncodeSize, FixedSize, Read, ReadExt, Write};
use halcyon_runtime::Storage;
use halcyon_storage::{
    journal::{self, Journal},
    metadata::{self, Metadata},
};
use std::collections::BTreeMap;
use tracing::debug;

/// Store of committed blocks, indexed by height.
///
/// Blocks are stored as their parts along with a [BlockMeta], the commit for each block
/// (taken from the next block) and the commit this node observed for it.
pub trait BlockStore: Send + 'static {
    /// Lowest stored height (zero if empty).
    fn base(&self) -> u64;

    /// Highest stored height (zero if empty).
    fn height(&self) -> u64;

    /// Number of stored blocks.
    fn size(&self) -> u64 {
        match self.height() {
            0 => 0,
            height => height + 1 - self.base(),
        }
    }

    /// Reassembles the block at `height`.
    fn load_block(&self, height: u64) -> Result<Option<Block>, Error>;

    fn load_block_meta(&self, height: u64) -> Result<Option<BlockMeta>, Error>;

    fn load_block_part(&self, height: u64, index: u32) -> Result<Option<Part>, Error>;

    /// Commit for the block at `height`, as included in the block at `height + 1`.
    fn load_block_commit(&self, height: u64) -> Result<Option<Commit>, Error>;

    /// Commit observed locally for the block at `height` (which may differ from the
    /// canonical commit).
    fn load_seen_commit(&self, height: u64) -> Result<Option<Commit>, Error>;

    /// Durably stores `block` (which must extend the stored chain), its parts and the
    /// commit observed for it.
    fn save_block(
        &mut self,
        block: &Block,
        parts: &PartSet,
        seen_commit: &Commit,
    ) -> Result<(), Error>;

    /// Removes all blocks below `retain_height`, returning the number of blocks removed.
    fn prune_blocks(&mut self, retain_height: u64) -> Result<u64, Error>;
}

/// Largest item (a part, a commit or a block meta) accepted by the journal.
const MAX_ITEM_SIZE: u32 = 16 * 1024 * 1024;

const STATE: &[u8] = b"block_store";

// Kind of a journal item (its first byte)
const META: u8 = b'H';
const PART: u8 = b'P';
const LAST_COMMIT: u8 = b'C';
const SEEN_COMMIT: u8 = b'S';

/// Range of stored heights.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct StoreState {
    base: u64,
    height: u64,
}

impl Write for StoreState {
    fn write(&self, buf: &mut impl BufMut) {
        self.base.write(buf);
        self.height.write(buf);
    }
}

impl FixedSize for StoreState {
    const SIZE: usize = u64::SIZE * 2;
}

impl Read for StoreState {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, halcyon_codec::Error> {
        Ok(Self {
            base: u64::read(buf)?,
            height: u64::read(buf)?,
        })
    }
}

/// Offsets of the items stored in a block's section.
#[derive(Clone, Debug, Default)]
struct Locations {
    meta: Option<u64>,
    parts: Vec<u64>,

    /// Commit for the previous block, as included in this one.
    last_commit: Option<u64>,
    seen_commit: Option<u64>,
}

/// Configuration for a [BlockJournal].
#[derive(Clone, Debug)]
pub struct Config {
    /// Prefix of the [Storage] partitions holding the blocks and the stored range.
    pub partition: String,
}

/// [BlockStore] keeping one [Journal] section per height.
pub struct BlockJournal<S: Storage> {
    metadata: Metadata<S>,
    journal: Journal<S>,

    state: StoreState,
    index: BTreeMap<u64, Locations>,
}

impl<S: Storage> BlockJournal<S> {
    /// Opens the store, discarding anything a crash left outside of the stored range.
    pub fn init(storage: S, cfg: Config) -> Result<Self, Error> {
        let metadata = Metadata::init(
            storage.clone(),
            metadata::Config {
                partition: format!("{}-range", cfg.partition),
            },
        )?;
        let state = match metadata.get(STATE) {
            Some(raw) => StoreState::decode(raw.clone())?,
            None => StoreState::default(),
        };
        let mut journal = Journal::init(
            storage,
            journal::Config {
                partition: format!("{}-blocks", cfg.partition),
                max_item_size: MAX_ITEM_SIZE,
            },
        )?;
        journal.rewind(state.height)?;
        if state.base > 0 {
            journal.prune(state.base)?;
        }

        let mut index = BTreeMap::<u64, Locations>::new();
        let mut unknown = None;
        journal.replay(state.base, |height, offset, item| {
            let locations = index.entry(height).or_default();
            match item.first() {
                Some(&META) => locations.meta = Some(offset),
                Some(&PART) => locations.parts.push(offset),
                Some(&LAST_COMMIT) => locations.last_commit = Some(offset),
                Some(&SEEN_COMMIT) => locations.seen_commit = Some(offset),
                _ => {
                    unknown = Some(height);
                    return false;
                }
            }
            true
        })?;
        if let Some(height) = unknown {
            return Err(Error::InvalidBlock(format!(
                "unknown item stored for block {height}"
            )));
        }
        debug!(
            base = state.base,
            height = state.height,
            blocks = index.len(),
            "opened block store"
        );
        Ok(Self {
            metadata,
            journal,
            state,
            index,
        })
    }

    /// Syncs and closes the store.
    pub fn close(self) -> Result<(), Error> {
        self.journal.close()?;
        self.metadata.close()?;
        Ok(())
    }

    fn load<T: Read<Cfg = ()>>(
        &self,
        section: u64,
        locate: impl FnOnce(&Locations) -> Option<u64>,
    ) -> Result<Option<T>, Error> {
        let Some(offset) = self.index.get(&section).and_then(locate) else {
            return Ok(None);
        };
        let item = self.journal.get(section, offset)?.ok_or_else(|| {
            Error::InvalidBlock(format!("missing section of block {section}"))
        })?;
        Ok(Some(T::decode(item.slice(1..))?))
    }

    fn append(&mut self, height: u64, kind: u8, item: &impl Encode) -> Result<u64, Error> {
        let mut buf = Vec::with_capacity(1 + EncodeSize::encode_size(item));
        buf.push(kind);
        item.write(&mut buf);
        Ok(self.journal.append(height, &buf)?)
    }

    fn set_state(&mut self, state: StoreState) -> Result<(), Error> {
        self.metadata.put(STATE.to_vec(), state.encode().freeze());
        self.metadata.sync()?;
        self.state = state;
        Ok(())
    }
}

impl<S: Storage> BlockStore for BlockJournal<S> {
    fn base(&self) -> u64 {
        self.state.base
    }

    fn height(&self) -> u64 {
        self.state.height
    }

    fn load_block(&self, height: u64) -> Result<Option<Block>, Error> {
        let Some(meta) = self.load_block_meta(height)? else {
            return Ok(None);
        };
        let mut parts = PartSet::from_header(&meta.block_id.part_set_header);
        for index in 0..meta.block_id.part_set_header.total {
            let part = self.load_block_part(height, index)?.ok_or_else(|| {
                Error::InvalidBlock(format!("missing part {index} of block {height}"))
            })?;
            parts.add_part(part)?;
        }
        let data = parts
            .assemble()
            .ok_or_else(|| Error::InvalidBlock(format!("incomplete block {height}")))?;
        Ok(Some(Block::decode(data)?))
    }

    fn load_block_meta(&self, height: u64) -> Result<Option<BlockMeta>, Error> {
        self.load(height, |locations| locations.meta)
    }

    fn load_block_part(&self, height: u64, index: u32) -> Result<Option<Part>, Error> {
        self.load(height, |locations| locations.parts.get(index as usize).copied())
    }

    fn load_block_commit(&self, height: u64) -> Result<Option<Commit>, Error> {
        if height < self.state.base {
            return Ok(None);
        }
        self.load(height + 1, |locations| locations.last_commit)
    }

    fn load_seen_commit(&self, height: u64) -> Result<Option<Commit>, Error> {
        self.load(height, |locations| locations.seen_commit)
    }

    fn save_block(
        &mut self,
        block: &Block,
        parts: &PartSet,
        seen_commit: &Commit,
    ) -> Result<(), Error> {
        let height = block.height();
        if self.state.height > 0 && height != self.state.height + 1 {
            return Err(Error::InvalidBlock(format!(
                "can only save contiguous blocks: wanted {}, got {height}",
                self.state.height + 1
            )));
        }
        if !parts.is_complete() {
            return Err(Error::InvalidBlock(format!(
                "can only save complete block part sets: {}/{}",
                parts.count(),
                parts.total()
            )));
        }

        // Drop the remains of an earlier failed save
        self.journal.rewind(self.state.height)?;

        let mut locations = Locations {
            meta: Some(self.append(height, META, &BlockMeta::new(block, parts))?),
            ..Default::default()
        };
        for index in 0..parts.total() {
            let part = parts.get_part(index).ok_or_else(|| {
                Error::InvalidBlock(format!("missing part {index} of block {height}"))
            })?;
            locations.parts.push(self.append(height, PART, part)?);
        }
        if height > 1 && !block.last_commit.is_empty() {
            locations.last_commit = Some(self.append(height, LAST_COMMIT, &block.last_commit)?);
        }
        locations.seen_commit = Some(self.append(height, SEEN_COMMIT, seen_commit)?);
        self.journal.sync(height)?;
        self.index.insert(height, locations);

        let base = if self.state.base == 0 {
            height
        } else {
            self.state.base
        };
        self.set_state(StoreState { base, height })?;
        debug!(height, parts = parts.total(), "saved block");
        Ok(())
    }

    fn prune_blocks(&mut self, retain_height: u64) -> Result<u64, Error> {
        if retain_height == 0 {
            return Err(Error::InvalidPruneHeight {
                requested: retain_height,
                reason: "height must be greater than 0".into(),
            });
        }
        if retain_height > self.state.height {
            return Err(Error::InvalidPruneHeight {
                requested: retain_height,
                reason: format!(
                    "height must be at most the store height {}",
                    self.state.height
                ),
            });
        }
        if retain_height <= self.state.base {
            return Ok(0);
        }

        // Move the base first so a crash never exposes a partially pruned block
        let pruned = retain_height - self.state.base;
        self.set_state(StoreState {
            base: retain_height,
            height: self.state.height,
        })?;
        self.journal.prune(retain_height)?;
        self.index = self.index.split_off(&retain_height);
        debug!(pruned, base = retain_height, "pruned blocks");
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockId, BlockIdFlag, CommitSig, BLOCK_PART_SIZE};
    use bytes::Bytes;
    use halcyon_cryptography::Address;
    use halcyon_macros::test_traced;
    use halcyon_runtime::storage::memory;

    fn commit(height: u64, block_id: BlockId) -> Commit {
        Commit {
            height,
            round: 0,
            block_id,
            signatures: vec![CommitSig {
                flag: BlockIdFlag::Commit,
                validator_address: Address::new([1; 20]),
                timestamp: height,
                signature: Some(Bytes::from_static(&[7; 64])),
            }],
            aggregated_signature: None,
        }
    }

    /// Builds a chain of `count` blocks (with txs large enough to span parts).
    fn chain(count: u64) -> Vec<(Block, PartSet, Commit)> {
        let mut blocks = Vec::new();
        let mut last_commit = Commit::default();
        for height in 1..=count {
            let txs = vec![Bytes::from(vec![height as u8; BLOCK_PART_SIZE + 10])];
            let mut block = Block::new(height, txs, last_commit.clone(), Vec::new());
            block.header.chain_id = "test".into();
            block.fill_header();
            let parts = block.make_part_set(BLOCK_PART_SIZE);
            let block_id = BlockId {
                hash: block.hash(),
                part_set_header: parts.header(),
            };
            let seen = commit(height, block_id);
            last_commit = seen.clone();
            blocks.push((block, parts, seen));
        }
        blocks
    }

    fn open(storage: &memory::Storage) -> BlockJournal<memory::Storage> {
        BlockJournal::init(
            storage.clone(),
            Config {
                partition: "blocks".into(),
            },
        )
        .unwrap()
    }

    #[test_traced]
    fn test_save_load_prune() {
        let storage = memory::Storage::default();
        let mut store = open(&storage);
        assert_eq!(store.base(), 0);
        assert_eq!(store.height(), 0);
        assert_eq!(store.size(), 0);
        assert!(store.load_block(1).unwrap().is_none());

        let blocks = chain(5);
        for (block, parts, seen) in &blocks {
            store.save_block(block, parts, seen).unwrap();
        }
        assert_eq!(store.base(), 1);
        assert_eq!(store.height(), 5);
        assert_eq!(store.size(), 5);

        // Blocks round trip through their parts
        let loaded = store.load_block(3).unwrap().unwrap();
        assert_eq!(loaded, blocks[2].0);
        assert_eq!(blocks[2].1.total(), 2);
        let meta = store.load_block_meta(3).unwrap().unwrap();
        assert_eq!(meta.block_id.hash, blocks[2].0.hash());
        assert_eq!(meta.num_txs, 1);

        // Canonical commit of 4 comes from block 5, seen commit of 5 is local
        assert_eq!(store.load_block_commit(4).unwrap().unwrap(), blocks[3].2);
        assert!(store.load_block_commit(5).unwrap().is_none());
        assert_eq!(store.load_seen_commit(5).unwrap().unwrap(), blocks[4].2);

        // Non-contiguous blocks are refused
        let (block, parts, seen) = &blocks[1];
        assert!(store.save_block(block, parts, seen).is_err());

        // Pruning moves the base
        assert!(store.prune_blocks(0).is_err());
        assert!(store.prune_blocks(6).is_err());
        assert_eq!(store.prune_blocks(3).unwrap(), 2);
        assert_eq!(store.base(), 3);
        assert_eq!(store.size(), 3);
        assert!(store.load_block(2).unwrap().is_none());
        assert!(store.load_block_part(1, 0).unwrap().is_none());
        assert_eq!(store.prune_blocks(2).unwrap(), 0);

        // Survives a restart
        store.close().unwrap();
        let store = open(&storage);
        assert_eq!(store.base(), 3);
        assert_eq!(store.height(), 5);
        assert_eq!(store.load_block(5).unwrap().unwrap(), blocks[4].0);
    }

    #[test_traced]
    fn test_restart_after_pruning() {
        let storage = memory::Storage::default();
        let mut store = open(&storage);
        let blocks = chain(6);
        for (block, parts, seen) in &blocks[..5] {
            store.save_block(block, parts, seen).unwrap();
        }
        assert_eq!(store.prune_blocks(3).unwrap(), 2);
        store.close().unwrap();

        // Only the retained sections are left on disk
        let mut sections = storage.scan("blocks-blocks").unwrap();
        sections.sort();
        assert_eq!(
            sections,
            (3u64..=5).map(|h| h.to_be_bytes().to_vec()).collect::<Vec<_>>()
        );

        let mut store = open(&storage);
        assert_eq!(store.base(), 3);
        assert_eq!(store.height(), 5);
        assert!(store.load_block(2).unwrap().is_none());
        assert!(store.load_block_commit(2).unwrap().is_none());
        assert_eq!(store.load_block_commit(3).unwrap().unwrap(), blocks[2].2);
        for (block, _, seen) in &blocks[2..5] {
            let height = block.height();
            assert_eq!(&store.load_block(height).unwrap().unwrap(), block);
            assert_eq!(&store.load_seen_commit(height).unwrap().unwrap(), seen);
        }

        // The chain keeps growing from the reopened store
        let (block, parts, seen) = &blocks[5];
        store.save_block(block, parts, seen).unwrap();
        assert_eq!(store.prune_blocks(5).unwrap(), 2);
        store.close().unwrap();
        let store = open(&storage);
        assert_eq!(store.base(), 5);
        assert_eq!(store.height(), 6);
        assert_eq!(store.load_block_commit(5).unwrap().unwrap(), blocks[4].2);
        assert_eq!(&store.load_block(6).unwrap().unwrap(), block);
    }

    #[test_traced]
    fn test_discards_interrupted_save() {
        let storage = memory::Storage::default();
        let mut store = open(&storage);
        let blocks = chain(3);
        for (block, parts, seen) in &blocks[..2] {
            store.save_block(block, parts, seen).unwrap();
        }
        store.close().unwrap();

        // A crash after writing part of block 3 but before extending the range
        let mut journal = Journal::init(
            storage.clone(),
            journal::Config {
                partition: "blocks-blocks".into(),
                max_item_size: MAX_ITEM_SIZE,
            },
        )
        .unwrap();
        journal.append(3, &[META, 1, 2, 3]).unwrap();
        journal.close().unwrap();

        let mut store = open(&storage);
        assert_eq!(store.height(), 2);
        assert!(store.load_block_meta(3).unwrap().is_none());
        let (block, parts, seen) = &blocks[2];
        store.save_block(block, parts, seen).unwrap();
        store.close().unwrap();

        let store = open(&storage);
        assert_eq!(store.height(), 3);
        assert_eq!(&store.load_block(3).unwrap().unwrap(), block);
        assert_eq!(store.load_block_commit(2).unwrap().unwrap(), blocks[1].2);
    }

    #[test]
    fn test_rejects_incomplete_parts() {
        let storage = memory::Storage::default();
        let mut store = open(&storage);
        let (block, parts, seen) = chain(1).remove(0);
        let partial = PartSet::from_header(&parts.header());
        assert!(store.save_block(&block, &partial, &seen).is_err());
        assert_eq!(store.height(), 0);
    }
}
