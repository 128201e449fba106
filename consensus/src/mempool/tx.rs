use super::{Config, Mempool};
use crate::{
    abci::{CheckTxKind, Client, RequestCheckTx, ResponseCheckTx, ResponseDeliverTx},
    Error,
};
use bytes::Bytes;
use futures::channel::mpsc;
use halcyon_codec::EncodeSize;
use halcyon_cryptography::{hash, Digest};
use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, RwLock, RwLockWriteGuard},
};
use tracing::{debug, trace};

struct PendingTx {
    tx: Bytes,
    key: Digest,
    gas_wanted: i64,
}

struct Inner {
    txs: VecDeque<PendingTx>,
    keys: HashSet<Digest>,
    bytes: usize,
    height: u64,

    /// Recently committed transactions, oldest first.
    committed: VecDeque<Digest>,
    committed_keys: HashSet<Digest>,

    notified: bool,
    notifier: mpsc::UnboundedSender<()>,
    receiver: Option<mpsc::UnboundedReceiver<()>>,
}

impl Inner {
    fn notify(&mut self) {
        if self.notified || self.txs.is_empty() {
            return;
        }
        self.notified = true;
        let _ = self.notifier.unbounded_send(());
    }

    fn remember_committed(&mut self, key: Digest, cache_size: usize) {
        if !self.committed_keys.insert(key) {
            return;
        }
        self.committed.push_back(key);
        while self.committed.len() > cache_size {
            if let Some(oldest) = self.committed.pop_front() {
                self.committed_keys.remove(&oldest);
            }
        }
    }
}

/// First-in first-out mempool that admits transactions accepted by the application's
/// `CheckTx`.
pub struct TxMempool {
    cfg: Config,
    client: Arc<dyn Client>,

    /// Shared by `check_tx`, exclusive while reaping or committing.
    update_lock: RwLock<()>,
    inner: Mutex<Inner>,
}

impl TxMempool {
    /// Creates a mempool that checks transactions over `client` (the mempool connection).
    pub fn new(cfg: Config, client: Arc<dyn Client>, height: u64) -> Self {
        cfg.assert();
        let (notifier, receiver) = mpsc::unbounded();
        Self {
            cfg,
            client,
            update_lock: RwLock::new(()),
            inner: Mutex::new(Inner {
                txs: VecDeque::new(),
                keys: HashSet::new(),
                bytes: 0,
                height,
                committed: VecDeque::new(),
                committed_keys: HashSet::new(),
                notified: false,
                notifier,
                receiver: Some(receiver),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Height of the last committed block.
    pub fn height(&self) -> u64 {
        self.inner().height
    }

    /// Total size of the pending transactions.
    pub fn txs_bytes(&self) -> usize {
        self.inner().bytes
    }

    /// Pending transactions in arrival order.
    pub fn txs(&self) -> Vec<Bytes> {
        self.inner().txs.iter().map(|pending| pending.tx.clone()).collect()
    }
}

impl Mempool for TxMempool {
    fn lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.update_lock
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_tx(&self, tx: Bytes) -> Result<ResponseCheckTx, Error> {
        if tx.len() > self.cfg.max_tx_bytes {
            return Err(Error::Mempool(format!(
                "tx too large: {} > {}",
                tx.len(),
                self.cfg.max_tx_bytes
            )));
        }
        let _guard = self
            .update_lock
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let key = hash(&tx);
        {
            let inner = self.inner();
            if inner.keys.contains(&key) || inner.committed_keys.contains(&key) {
                return Err(Error::Mempool("tx already exists in cache".into()));
            }
            if inner.txs.len() >= self.cfg.size
                || inner.bytes + tx.len() > self.cfg.max_txs_bytes
            {
                return Err(Error::Mempool(format!(
                    "mempool is full: {} txs, {} bytes",
                    inner.txs.len(),
                    inner.bytes
                )));
            }
        }

        let response = self.client.check_tx(RequestCheckTx {
            tx: tx.clone(),
            kind: CheckTxKind::New,
        })?;
        if !response.is_ok() {
            trace!(code = response.code, log = %response.log, "rejected tx");
            return Ok(response);
        }

        let mut inner = self.inner();
        if inner.keys.insert(key) {
            inner.bytes += tx.len();
            inner.txs.push_back(PendingTx {
                tx,
                key,
                gas_wanted: response.gas_wanted,
            });
            inner.notify();
        }
        Ok(response)
    }

    fn reap_max_bytes_max_gas(&self, max_bytes: i64, max_gas: i64) -> Vec<Bytes> {
        let inner = self.inner();
        let mut total_bytes = 0i64;
        let mut total_gas = 0i64;
        let mut reaped = Vec::new();
        for pending in &inner.txs {
            let size = pending.tx.encode_size() as i64;
            if max_bytes > -1 && total_bytes + size > max_bytes {
                break;
            }
            let gas = total_gas.saturating_add(pending.gas_wanted);
            if max_gas > -1 && gas > max_gas {
                break;
            }
            total_bytes += size;
            total_gas = gas;
            reaped.push(pending.tx.clone());
        }
        reaped
    }

    fn update(
        &self,
        height: u64,
        txs: &[Bytes],
        responses: &[ResponseDeliverTx],
    ) -> Result<(), Error> {
        let remaining = {
            let mut inner = self.inner();
            inner.height = height;
            inner.notified = false;
            for (tx, response) in txs.iter().zip(responses) {
                let key = hash(tx);

                // Invalid txs may be resubmitted once the application state changes
                if response.is_ok() {
                    inner.remember_committed(key, self.cfg.cache_size);
                }
                if inner.keys.remove(&key) {
                    if let Some(position) = inner.txs.iter().position(|p| p.key == key) {
                        if let Some(removed) = inner.txs.remove(position) {
                            inner.bytes -= removed.tx.len();
                        }
                    }
                }
            }
            if !self.cfg.recheck {
                inner.notify();
                return Ok(());
            }
            inner
                .txs
                .iter()
                .map(|pending| (pending.key, pending.tx.clone()))
                .collect::<Vec<_>>()
        };

        // Drop pending txs the application no longer accepts
        let mut rejected = HashSet::new();
        for (key, tx) in remaining {
            let response = self.client.check_tx(RequestCheckTx {
                tx,
                kind: CheckTxKind::Recheck,
            })?;
            if !response.is_ok() {
                rejected.insert(key);
            }
        }
        let mut inner = self.inner();
        if !rejected.is_empty() {
            debug!(height, rejected = rejected.len(), "removed txs after recheck");
            let mut removed_bytes = 0;
            inner.txs.retain(|pending| {
                let keep = !rejected.contains(&pending.key);
                if !keep {
                    removed_bytes += pending.tx.len();
                }
                keep
            });
            inner.bytes -= removed_bytes;
            for key in &rejected {
                inner.keys.remove(key);
            }
        }
        inner.notify();
        Ok(())
    }

    fn flush_app_conn(&self) -> Result<(), Error> {
        self.client.flush()
    }

    fn size(&self) -> usize {
        self.inner().txs.len()
    }

    fn txs_available(&self) -> Option<mpsc::UnboundedReceiver<()>> {
        self.inner().receiver.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abci::{AppConns, Application, KvStoreApplication};
    use std::{sync::mpsc as std_mpsc, thread, time::Duration};

    /// Accepts transactions that do not start with a byte in `banned`.
    #[derive(Default)]
    struct FilterApp {
        banned: Arc<Mutex<Vec<u8>>>,
    }

    impl Application for FilterApp {
        fn check_tx(&mut self, req: RequestCheckTx) -> ResponseCheckTx {
            let banned = self.banned.lock().unwrap();
            if banned.contains(&req.tx[0]) {
                return ResponseCheckTx {
                    code: 1,
                    ..Default::default()
                };
            }
            ResponseCheckTx {
                gas_wanted: 10,
                ..Default::default()
            }
        }
    }

    fn tx(value: &[u8]) -> Bytes {
        Bytes::copy_from_slice(value)
    }

    #[test]
    fn test_check_and_reap() {
        let conns = AppConns::local(KvStoreApplication::new());
        let mempool = TxMempool::new(Config::default(), conns.mempool().clone(), 0);
        let mut available = mempool.txs_available().unwrap();
        assert!(mempool.txs_available().is_none());

        for i in 0..10u8 {
            assert!(mempool.check_tx(tx(&[i; 10])).unwrap().is_ok());
        }
        assert_eq!(mempool.size(), 10);
        assert_eq!(mempool.txs_bytes(), 100);

        // Notified once per height
        assert!(available.try_next().unwrap().is_some());
        assert!(available.try_next().is_err());

        // Duplicates are rejected
        assert!(mempool.check_tx(tx(&[0; 10])).is_err());

        // Each tx is 11 bytes encoded and wants 1 gas
        assert_eq!(mempool.reap_max_bytes_max_gas(-1, -1).len(), 10);
        assert_eq!(mempool.reap_max_bytes_max_gas(33, -1).len(), 3);
        assert_eq!(mempool.reap_max_bytes_max_gas(-1, 4).len(), 4);
        assert_eq!(mempool.reap_max_bytes_max_gas(0, 0).len(), 0);
        assert_eq!(mempool.reap_max_bytes_max_gas(-1, -1)[0], tx(&[0; 10]));
    }

    #[test]
    fn test_update_removes_committed_and_rechecks() {
        let app = FilterApp::default();
        let banned = app.banned.clone();
        let conns = AppConns::local(app);
        let mempool = TxMempool::new(Config::default(), conns.mempool().clone(), 0);
        let mut available = mempool.txs_available().unwrap();

        for i in 0..5u8 {
            mempool.check_tx(tx(&[i])).unwrap();
        }
        assert!(available.try_next().unwrap().is_some());

        // Commit txs 0 and 1, then ban 4 before the recheck
        banned.lock().unwrap().push(4);
        {
            let _guard = mempool.lock();
            mempool
                .update(
                    1,
                    &[tx(&[0]), tx(&[1])],
                    &[ResponseDeliverTx::default(), ResponseDeliverTx::default()],
                )
                .unwrap();
        }
        assert_eq!(mempool.height(), 1);
        assert_eq!(mempool.txs(), vec![tx(&[2]), tx(&[3])]);
        assert_eq!(mempool.txs_bytes(), 2);

        // Pending txs trigger a new notification for the next height
        assert!(available.try_next().unwrap().is_some());

        // Committed txs cannot be replayed
        assert!(mempool.check_tx(tx(&[0])).is_err());

        // Rejected txs are not kept
        assert!(!mempool.check_tx(tx(&[4])).unwrap().is_ok());
        assert_eq!(mempool.size(), 2);
    }

    #[test]
    fn test_check_tx_waits_for_commit() {
        let conns = AppConns::local(KvStoreApplication::new());
        let mempool = Arc::new(TxMempool::new(Config::default(), conns.mempool().clone(), 0));

        // Hold the lock as a commit would
        let guard = mempool.lock();
        let (done, checked) = std_mpsc::channel();
        let handle = thread::spawn({
            let mempool = mempool.clone();
            move || {
                let result = mempool.check_tx(tx(b"key=value"));
                done.send(()).unwrap();
                result
            }
        });
        assert!(checked.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(mempool.size(), 0);

        drop(guard);
        checked.recv().unwrap();
        assert!(handle.join().unwrap().unwrap().is_ok());
        assert_eq!(mempool.size(), 1);
    }
}
