//! Test doubles for the consensus machine.

pub mod fixtures;

use crate::{
    abci::{
        Application, KvStoreApplication, RequestBeginBlock, RequestCheckTx, RequestDeliverTx,
        RequestEndBlock, RequestInfo, RequestInitChain, RequestQuery, ResponseBeginBlock,
        ResponseCheckTx, ResponseCommit, ResponseDeliverTx, ResponseEndBlock, ResponseInfo,
        ResponseInitChain, ResponseQuery,
    },
    machine::Broadcaster,
    wal::{ConsensusMessage, Wal, WalMessage, WalReader},
    Error,
};
use bytes::Bytes;
use std::sync::{Arc, Mutex};

/// Wraps a [Wal] and fails every message write after the first `writes`.
///
/// Only received and signed messages count. Step changes, timeouts and height markers are
/// always passed through.
pub struct CrashingWal<W: Wal> {
    inner: W,
    remaining: usize,
}

impl<W: Wal> CrashingWal<W> {
    pub fn new(inner: W, writes: usize) -> Self {
        Self {
            inner,
            remaining: writes,
        }
    }

    fn check(&mut self, msg: &WalMessage) -> Result<(), Error> {
        if !matches!(msg, WalMessage::MsgInfo(_)) {
            return Ok(());
        }
        if self.remaining == 0 {
            return Err(Error::Stopped);
        }
        self.remaining -= 1;
        Ok(())
    }
}

impl<W: Wal> Wal for CrashingWal<W> {
    fn write(&mut self, msg: WalMessage) -> Result<(), Error> {
        self.check(&msg)?;
        self.inner.write(msg)
    }

    fn write_sync(&mut self, msg: WalMessage) -> Result<(), Error> {
        self.check(&msg)?;
        self.inner.write_sync(msg)
    }

    fn flush_and_sync(&mut self) -> Result<(), Error> {
        self.inner.flush_and_sync()
    }

    fn search_for_end_height(&mut self, height: u64) -> Result<WalReader, Error> {
        self.inner.search_for_end_height(height)
    }

    fn prune(&mut self, height: u64) -> Result<(), Error> {
        self.inner.prune(height)
    }

    fn stop(&mut self) -> Result<(), Error> {
        self.inner.stop()
    }
}

/// Records everything broadcast.
#[derive(Clone, Default)]
pub struct RecordingBroadcaster {
    sent: Arc<Mutex<Vec<ConsensusMessage>>>,
}

impl RecordingBroadcaster {
    pub fn sent(&self) -> Vec<ConsensusMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn broadcast(&mut self, msg: ConsensusMessage) {
        self.sent.lock().unwrap().push(msg);
    }
}

/// A [KvStoreApplication] that reports a wrong app hash for every block from `from` onwards.
pub struct BadHashApplication {
    inner: KvStoreApplication,
    from: u64,
}

impl BadHashApplication {
    pub fn new(from: u64) -> Self {
        Self {
            inner: KvStoreApplication::new(),
            from,
        }
    }
}

impl Application for BadHashApplication {
    fn info(&mut self, req: RequestInfo) -> ResponseInfo {
        self.inner.info(req)
    }

    fn init_chain(&mut self, req: RequestInitChain) -> ResponseInitChain {
        self.inner.init_chain(req)
    }

    fn begin_block(&mut self, req: RequestBeginBlock) -> ResponseBeginBlock {
        self.inner.begin_block(req)
    }

    fn deliver_tx(&mut self, req: RequestDeliverTx) -> ResponseDeliverTx {
        self.inner.deliver_tx(req)
    }

    fn end_block(&mut self, req: RequestEndBlock) -> ResponseEndBlock {
        self.inner.end_block(req)
    }

    fn commit(&mut self) -> ResponseCommit {
        let mut resp = self.inner.commit();
        let height = self.inner.info(RequestInfo::default()).last_block_height;
        if height >= self.from {
            resp.data = Bytes::from_static(b"bad hash");
        }
        resp
    }

    fn check_tx(&mut self, req: RequestCheckTx) -> ResponseCheckTx {
        self.inner.check_tx(req)
    }

    fn query(&mut self, req: RequestQuery) -> ResponseQuery {
        self.inner.query(req)
    }
}
