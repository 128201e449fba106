use super::{Config, Error};
use bytes::{Buf, BufMut, Bytes};
use halcyon_runtime::{Blob, Storage};
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const BLOB_NAMES: [&[u8]; 2] = [b"left", b"right"];

struct Wrapper<B: Blob> {
    blob: B,
    version: u64,
}

/// Implementation of [Metadata] storage.
pub struct Metadata<S: Storage> {
    storage: S,
    cfg: Config,

    map: BTreeMap<Vec<u8>, Bytes>,
    cursor: usize,
    blobs: [Wrapper<S::Blob>; 2],

    syncs: Counter,
    keys: Gauge,
}

impl<S: Storage> Metadata<S> {
    /// Initialize a new [Metadata] instance, loading the most recent committed state.
    pub fn init(storage: S, cfg: Config) -> Result<Self, Error> {
        let (left_blob, left_len) = storage.open(&cfg.partition, BLOB_NAMES[0])?;
        let (right_blob, right_len) = storage.open(&cfg.partition, BLOB_NAMES[1])?;

        let (left_map, left_version) = Self::load(0, &left_blob, left_len)?;
        let (right_map, right_version) = Self::load(1, &right_blob, right_len)?;

        // Choose the latest blob (the next write goes to the other one)
        let (map, cursor) = if left_version > right_version {
            (left_map, 0)
        } else {
            (right_map, 1)
        };
        let keys = Gauge::default();
        keys.set(map.len() as i64);
        debug!(partition = cfg.partition.as_str(), keys = map.len(), "loaded metadata");

        Ok(Self {
            storage,
            cfg,

            map,
            cursor,
            blobs: [
                Wrapper {
                    blob: left_blob,
                    version: left_version,
                },
                Wrapper {
                    blob: right_blob,
                    version: right_version,
                },
            ],

            syncs: Counter::default(),
            keys,
        })
    }

    /// Register metrics (`syncs_total` and `keys`) with `registry`.
    pub fn register(&self, registry: &mut Registry) {
        registry.register("syncs", "number of syncs", self.syncs.clone());
        registry.register("keys", "number of tracked keys", self.keys.clone());
    }

    fn load(index: usize, blob: &S::Blob, len: u64) -> Result<(BTreeMap<Vec<u8>, Bytes>, u64), Error> {
        // Empty blob
        if len == 0 {
            return Ok((BTreeMap::new(), 0));
        }

        // Read blob
        let len_usize: usize = len.try_into().map_err(|_| Error::BlobTooLarge(len))?;
        let mut buf = vec![0u8; len_usize];
        blob.read_at(&mut buf, 0)?;

        // Verify integrity
        let parsed = if len_usize < 8 + 4 {
            None
        } else {
            let (data, checksum) = buf.split_at(len_usize - 4);
            let stored = u32::from_be_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);
            if crc32fast::hash(data) == stored {
                Self::parse(data)
            } else {
                None
            }
        };
        match parsed {
            Some(result) => Ok(result),
            None => {
                // Truncate and return none
                warn!(blob = index, len, "invalid blob: truncating");
                blob.resize(0)?;
                blob.sync()?;
                Ok((BTreeMap::new(), 0))
            }
        }
    }

    fn parse(mut data: &[u8]) -> Option<(BTreeMap<Vec<u8>, Bytes>, u64)> {
        let version = data.get_u64();
        let mut map = BTreeMap::new();
        while data.has_remaining() {
            if data.remaining() < 4 {
                return None;
            }
            let key_len = data.get_u32() as usize;
            if data.remaining() < key_len + 4 {
                return None;
            }
            let key = data[..key_len].to_vec();
            data.advance(key_len);
            let value_len = data.get_u32() as usize;
            if data.remaining() < value_len {
                return None;
            }
            let value = Bytes::copy_from_slice(&data[..value_len]);
            data.advance(value_len);
            map.insert(key, value);
        }
        Some((map, version))
    }

    /// Get a value from [Metadata] (if it exists).
    pub fn get(&self, key: &[u8]) -> Option<&Bytes> {
        self.map.get(key)
    }

    /// Put a value into [Metadata].
    ///
    /// If the key already exists, the value will be overwritten. The value is not persisted
    /// until [Metadata::sync] is called.
    pub fn put(&mut self, key: Vec<u8>, value: Bytes) {
        self.map.insert(key, value);
        self.keys.set(self.map.len() as i64);
    }

    /// Remove a value from [Metadata] (if it exists).
    pub fn remove(&mut self, key: &[u8]) -> Option<Bytes> {
        let previous = self.map.remove(key);
        self.keys.set(self.map.len() as i64);
        previous
    }

    /// Iterate over all keys (in order).
    pub fn keys(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.map.keys()
    }

    /// Iterate over all keys that start with `prefix` (in order).
    pub fn prefix<'a>(&'a self, prefix: &'a [u8]) -> impl Iterator<Item = (&'a Vec<u8>, &'a Bytes)> {
        self.map
            .range(prefix.to_vec()..)
            .take_while(move |(key, _)| key.starts_with(prefix))
    }

    /// Clear all values from [Metadata]. The new state is not persisted until [Metadata::sync]
    /// is called.
    pub fn clear(&mut self) {
        self.map.clear();
        self.keys.set(0);
    }

    /// Atomically commit the current state of [Metadata].
    pub fn sync(&mut self) -> Result<(), Error> {
        self.syncs.inc();

        // Serialize the current state into the older blob
        let next_cursor = 1 - self.cursor;
        let next_version = self.blobs[self.cursor].version + 1;
        let mut buf = Vec::new();
        buf.put_u64(next_version);
        for (key, value) in &self.map {
            let Ok(value_len) = u32::try_from(value.len()) else {
                return Err(Error::ValueTooBig(key.clone()));
            };
            buf.put_u32(key.len() as u32);
            buf.put_slice(key);
            buf.put_u32(value_len);
            buf.put_slice(value);
        }
        buf.put_u32(crc32fast::hash(&buf));

        let target = &mut self.blobs[next_cursor];
        target.blob.write_at(&buf, 0)?;
        target.blob.resize(buf.len() as u64)?;
        target.blob.sync()?;
        target.version = next_version;
        self.cursor = next_cursor;
        Ok(())
    }

    /// Sync outstanding data and close [Metadata].
    pub fn close(mut self) -> Result<(), Error> {
        self.sync()
    }

    /// Remove the underlying blobs for this [Metadata].
    pub fn destroy(self) -> Result<(), Error> {
        for name in BLOB_NAMES {
            self.storage.remove(&self.cfg.partition, Some(name))?;
        }
        Ok(())
    }
}
