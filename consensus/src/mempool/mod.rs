//! Pending transactions waiting to be included in a block.
//!
//! Consensus only needs a narrow view of the mempool: reap transactions when proposing,
//! hold the mempool lock while a block is committed (so no transaction is checked against a
//! stale application state), and remove the committed transactions afterwards.

mod tx;

use crate::{abci::ResponseCheckTx, abci::ResponseDeliverTx, Error};
use bytes::Bytes;
use futures::channel::mpsc;
use std::sync::{RwLock, RwLockWriteGuard};
pub use tx::TxMempool;

/// Configuration for a [TxMempool].
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of pending transactions.
    pub size: usize,

    /// Maximum size of a single transaction.
    pub max_tx_bytes: usize,

    /// Maximum total size of the pending transactions.
    pub max_txs_bytes: usize,

    /// Whether pending transactions are checked again after every block.
    pub recheck: bool,

    /// Number of committed transaction hashes remembered to reject replays.
    pub cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            size: 5000,
            max_tx_bytes: 1024 * 1024,
            max_txs_bytes: 1024 * 1024 * 1024,
            recheck: true,
            cache_size: 10_000,
        }
    }
}

impl Config {
    /// Panics if the configuration is nonsensical.
    pub fn assert(&self) {
        assert!(self.size > 0, "mempool size must be positive");
        assert!(self.max_tx_bytes > 0, "max tx bytes must be positive");
        assert!(
            self.max_txs_bytes >= self.max_tx_bytes,
            "max txs bytes must fit at least one tx"
        );
    }
}

/// Source of the transactions included in proposed blocks.
pub trait Mempool: Send + Sync + 'static {
    /// Blocks other users of the mempool until the guard is dropped.
    ///
    /// Held while reaping a proposal and while a block is committed. [Mempool::check_tx]
    /// waits for it to be released.
    fn lock(&self) -> RwLockWriteGuard<'_, ()>;

    /// Checks a transaction with the application and keeps it if valid.
    ///
    /// Never runs while the lock is held.
    fn check_tx(&self, tx: Bytes) -> Result<ResponseCheckTx, Error>;

    /// Oldest transactions fitting in `max_bytes` and `max_gas` (negative means no limit).
    fn reap_max_bytes_max_gas(&self, max_bytes: i64, max_gas: i64) -> Vec<Bytes>;

    /// Removes the transactions committed at `height`.
    ///
    /// Must be called with the lock held.
    fn update(
        &self,
        height: u64,
        txs: &[Bytes],
        responses: &[ResponseDeliverTx],
    ) -> Result<(), Error>;

    /// Waits for in-flight requests to the application to complete.
    fn flush_app_conn(&self) -> Result<(), Error>;

    fn size(&self) -> usize;

    /// Takes the stream notified (at most once per height) when transactions are pending.
    ///
    /// Only the first call returns the stream.
    fn txs_available(&self) -> Option<mpsc::UnboundedReceiver<()>>;
}

/// A mempool that never has transactions (used while replaying blocks).
#[derive(Default)]
pub struct EmptyMempool {
    lock: RwLock<()>,
}

impl EmptyMempool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Mempool for EmptyMempool {
    fn lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_tx(&self, _tx: Bytes) -> Result<ResponseCheckTx, Error> {
        Ok(ResponseCheckTx::default())
    }

    fn reap_max_bytes_max_gas(&self, _max_bytes: i64, _max_gas: i64) -> Vec<Bytes> {
        Vec::new()
    }

    fn update(
        &self,
        _height: u64,
        _txs: &[Bytes],
        _responses: &[ResponseDeliverTx],
    ) -> Result<(), Error> {
        Ok(())
    }

    fn flush_app_conn(&self) -> Result<(), Error> {
        Ok(())
    }

    fn size(&self) -> usize {
        0
    }

    fn txs_available(&self) -> Option<mpsc::UnboundedReceiver<()>> {
        None
    }
}
