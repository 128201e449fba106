use super::{ingress::Message, ConsensusState, Mailbox};
use crate::{state::StateStore, store::BlockStore, wal::Wal, Error};
use futures::{
    channel::mpsc::{self, UnboundedReceiver},
    future, StreamExt,
};
use halcyon_runtime::Clock;
use tokio::{select, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

/// Drives a [ConsensusState] from its mailbox, its timeouts and the mempool.
pub struct Actor<S: StateStore, B: BlockStore, W: Wal, C: Clock> {
    consensus: ConsensusState<S, B, W, C>,
    mailbox: mpsc::Receiver<Message>,
    txs_available: Option<UnboundedReceiver<()>>,
}

impl<S: StateStore, B: BlockStore, W: Wal, C: Clock> Actor<S, B, W, C> {
    pub fn new(consensus: ConsensusState<S, B, W, C>) -> (Self, Mailbox) {
        let (sender, receiver) = mpsc::channel(consensus.config().mailbox_size);
        let mailbox = Mailbox::new(sender, consensus.snapshot());
        let txs_available = consensus.executor().mempool().txs_available();
        (
            Self {
                consensus,
                mailbox: receiver,
                txs_available,
            },
            mailbox,
        )
    }

    /// Runs the actor until it is stopped or hits a fatal error.
    pub fn start(self) -> JoinHandle<Result<(), Error>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<(), Error> {
        let result = match self.consensus.start() {
            Ok(()) => self.run_loop().await,
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            warn!(?err, "consensus failed");
        }
        if let Err(err) = self.consensus.stop() {
            warn!(?err, "failed to close WAL");
        }
        result
    }

    async fn run_loop(&mut self) -> Result<(), Error> {
        let Self {
            consensus,
            mailbox,
            txs_available,
        } = self;
        loop {
            // Our own messages go first
            while consensus.process_internal()? {}

            let deadline = consensus.ticker().deadline();
            select! {
                _ = sleep_until(deadline) => {
                    if let Some(timeout) = consensus.ticker().fire() {
                        consensus.receive_timeout(timeout)?;
                    }
                },
                available = next_available(txs_available) => match available {
                    Some(()) => consensus.receive_txs_available()?,
                    None => *txs_available = None,
                },
                message = mailbox.next() => {
                    let Some(message) = message else {
                        info!("mailbox closed");
                        return Ok(());
                    };
                    match message {
                        Message::Peer { msg, peer } => consensus.receive_peer_message(msg, peer)?,
                        Message::PeerMaj23 {
                            height,
                            round,
                            vote_type,
                            block_id,
                            peer,
                        } => {
                            if let Err(err) = consensus
                                .receive_peer_maj23(height, round, vote_type, block_id, &peer)
                            {
                                debug!(?err, peer, "ignoring majority claim");
                            }
                        }
                        Message::TxsAvailable => consensus.receive_txs_available()?,
                        Message::Stop => {
                            info!("stopping consensus");
                            return Ok(());
                        }
                    }
                },
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn next_available(receiver: &mut Option<UnboundedReceiver<()>>) -> Option<()> {
    match receiver {
        Some(receiver) => receiver.next().await,
        None => future::pending().await,
    }
}
