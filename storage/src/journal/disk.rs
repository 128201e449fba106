use super::{Config, Error};
use bytes::{BufMut, Bytes};
use halcyon_runtime::{Blob, Error as RError, Storage};
use std::collections::{btree_map::Entry, BTreeMap};
use tracing::{debug, trace, warn};

/// Size of the length prefix and checksum surrounding each item.
const ITEM_OVERHEAD: u64 = 4 + 4;

struct Section<B: Blob> {
    blob: B,
    len: u64,
}

/// Implementation of `Journal` storage.
pub struct Journal<S: Storage> {
    storage: S,
    cfg: Config,

    sections: BTreeMap<u64, Section<S::Blob>>,

    /// A section number before which all sections have been pruned (used to reject
    /// appends that would resurrect pruned data).
    oldest_allowed: Option<u64>,
}

impl<S: Storage> Journal<S> {
    /// Initialize a new `Journal` instance.
    ///
    /// All backing blobs are opened but not read during initialization. The `replay` method
    /// can be used to iterate over all items in the `Journal`.
    pub fn init(storage: S, cfg: Config) -> Result<Self, Error> {
        let mut sections = BTreeMap::new();
        let stored_blobs = match storage.scan(&cfg.partition) {
            Ok(blobs) => blobs,
            Err(RError::PartitionMissing(_)) => Vec::new(),
            Err(err) => return Err(Error::Runtime(err)),
        };
        for name in stored_blobs {
            let (blob, len) = storage.open(&cfg.partition, &name)?;
            let Ok(raw) = <[u8; 8]>::try_from(name.as_slice()) else {
                return Err(Error::InvalidBlobName(format!("{name:?}")));
            };
            let section = u64::from_be_bytes(raw);
            debug!(section, len, "loaded section");
            sections.insert(section, Section { blob, len });
        }

        Ok(Self {
            storage,
            cfg,

            sections,

            oldest_allowed: None,
        })
    }

    /// Reads the item at `offset`, returning the offset of the next item.
    fn read(
        cfg: &Config,
        blob: &S::Blob,
        len: u64,
        offset: u64,
    ) -> Result<(u64, Bytes), Error> {
        // Read item size
        if offset + ITEM_OVERHEAD > len {
            return Err(Error::BlobCorrupt);
        }
        let mut size = [0u8; 4];
        blob.read_at(&mut size, offset)?;
        let size = u32::from_be_bytes(size);
        if size > cfg.max_item_size || offset + ITEM_OVERHEAD + size as u64 > len {
            return Err(Error::BlobCorrupt);
        }

        // Read item and checksum
        let mut buf = vec![0u8; size as usize + 4];
        blob.read_at(&mut buf, offset + 4)?;
        let stored_checksum = u32::from_be_bytes([
            buf[size as usize],
            buf[size as usize + 1],
            buf[size as usize + 2],
            buf[size as usize + 3],
        ]);
        buf.truncate(size as usize);
        if crc32fast::hash(&buf) != stored_checksum {
            return Err(Error::BlobCorrupt);
        }
        Ok((offset + ITEM_OVERHEAD + size as u64, Bytes::from(buf)))
    }

    /// Replays all items stored in sections `>= start`, in order.
    ///
    /// `f` is called with each `(section, offset, item)` and returns whether replay should
    /// continue.
    ///
    /// If a section ends with an incomplete or corrupt item, the section is truncated at the
    /// last valid item (and replay continues with the next section).
    pub fn replay(
        &mut self,
        start: u64,
        mut f: impl FnMut(u64, u64, Bytes) -> bool,
    ) -> Result<(), Error> {
        for (section, entry) in self.sections.range_mut(start..) {
            debug!(section = *section, "replaying section");
            let mut cursor = 0;
            while cursor < entry.len {
                match Self::read(&self.cfg, &entry.blob, entry.len, cursor) {
                    Ok((next, item)) => {
                        trace!(section = *section, cursor, "replayed item");
                        let offset = cursor;
                        cursor = next;
                        if !f(*section, offset, item) {
                            return Ok(());
                        }
                    }
                    Err(Error::BlobCorrupt) => {
                        // Truncate section
                        //
                        // This is a best-effort attempt to recover from corruption. If there is an
                        // unclean shutdown, it is possible that some trailing item was not fully
                        // written to disk.
                        warn!(
                            section = *section,
                            new_size = cursor,
                            old_size = entry.len,
                            "corruption detected: truncating section"
                        );
                        entry.blob.resize(cursor)?;
                        entry.blob.sync()?;
                        entry.len = cursor;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    /// Appends an item to a section (creating the section if it does not exist), returning
    /// its offset within the section.
    ///
    /// The item is not durable until [Journal::sync] is called on its section.
    pub fn append(&mut self, section: u64, item: &[u8]) -> Result<u64, Error> {
        if item.len() > self.cfg.max_item_size as usize {
            return Err(Error::ItemTooLarge(item.len()));
        }
        if let Some(oldest_allowed) = self.oldest_allowed {
            if section < oldest_allowed {
                return Err(Error::AlreadyPrunedToSection(oldest_allowed));
            }
        }

        // Get existing section or create new one
        let entry = match self.sections.entry(section) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let (blob, len) = self
                    .storage
                    .open(&self.cfg.partition, &section.to_be_bytes())?;
                debug!(section, "created section");
                entry.insert(Section { blob, len })
            }
        };

        // Write item
        let offset = entry.len;
        let mut buf = Vec::with_capacity(ITEM_OVERHEAD as usize + item.len());
        buf.put_u32(item.len() as u32);
        buf.put_slice(item);
        buf.put_u32(crc32fast::hash(item));
        entry.blob.write_at(&buf, offset)?;
        entry.len += buf.len() as u64;
        trace!(section, offset, size = item.len(), "appended item");
        Ok(offset)
    }

    /// Reads the item stored at `offset` in `section`.
    ///
    /// Returns `None` if the section does not exist. An offset that does not point at a
    /// valid item is reported as [Error::BlobCorrupt].
    pub fn get(&self, section: u64, offset: u64) -> Result<Option<Bytes>, Error> {
        let Some(entry) = self.sections.get(&section) else {
            return Ok(None);
        };
        let (_, item) = Self::read(&self.cfg, &entry.blob, entry.len, offset)?;
        Ok(Some(item))
    }

    /// Ensures all items in `section` are durable.
    ///
    /// If the section does not exist, no error will be returned.
    pub fn sync(&mut self, section: u64) -> Result<(), Error> {
        match self.sections.get(&section) {
            Some(entry) => Ok(entry.blob.sync()?),
            None => Ok(()),
        }
    }

    /// Ensures all items in all sections are durable.
    pub fn sync_all(&mut self) -> Result<(), Error> {
        for entry in self.sections.values() {
            entry.blob.sync()?;
        }
        Ok(())
    }

    /// Removes all sections less than `min`.
    pub fn prune(&mut self, min: u64) -> Result<(), Error> {
        while let Some((&section, _)) = self.sections.first_key_value() {
            if section >= min {
                break;
            }
            self.sections.remove(&section);
            self.storage
                .remove(&self.cfg.partition, Some(&section.to_be_bytes()))?;
            debug!(section, "pruned section");
        }
        if self.oldest_allowed.map_or(true, |oldest| min > oldest) {
            self.oldest_allowed = Some(min);
        }
        Ok(())
    }

    /// Removes all sections greater than `max`.
    pub fn rewind(&mut self, max: u64) -> Result<(), Error> {
        while let Some((&section, _)) = self.sections.last_key_value() {
            if section <= max {
                break;
            }
            self.sections.remove(&section);
            self.storage
                .remove(&self.cfg.partition, Some(&section.to_be_bytes()))?;
            debug!(section, "rewound section");
        }
        Ok(())
    }

    /// Returns the sections currently stored, in ascending order.
    pub fn sections(&self) -> impl Iterator<Item = u64> + '_ {
        self.sections.keys().copied()
    }

    /// Returns the number of bytes stored in `section` (if it exists).
    pub fn size(&self, section: u64) -> Option<u64> {
        self.sections.get(&section).map(|entry| entry.len)
    }

    /// Syncs all sections and closes the journal.
    pub fn close(mut self) -> Result<(), Error> {
        self.sync_all()
    }

    /// Removes all sections (and the partition) from storage.
    pub fn destroy(self) -> Result<(), Error> {
        match self.storage.remove(&self.cfg.partition, None) {
            Ok(()) | Err(RError::PartitionMissing(_)) => Ok(()),
            Err(err) => Err(Error::Runtime(err)),
        }
    }
}
