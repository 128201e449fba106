use super::{Block, BlockId, Header, RoundStep, Vote};
use crate::abci::{ResponseBeginBlock, ResponseDeliverTx, ResponseEndBlock};
use bytes::Bytes;
use futures::channel::mpsc;
use halcyon_cryptography::Address;
use std::sync::{Arc, Mutex};

/// Height, round and step of the consensus state at the time of an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundStateEvent {
    pub height: u64,
    pub round: u32,
    pub step: RoundStep,
}

/// Events published while running consensus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    NewRoundStep(RoundStateEvent),
    NewRound {
        state: RoundStateEvent,
        proposer: Address,
    },
    CompleteProposal {
        state: RoundStateEvent,
        block_id: BlockId,
    },
    TimeoutPropose(RoundStateEvent),
    TimeoutWait(RoundStateEvent),
    Polka(RoundStateEvent),
    Lock(RoundStateEvent),
    Relock(RoundStateEvent),
    Unlock(RoundStateEvent),
    ValidBlock(RoundStateEvent),
    Vote(Vote),
    NewBlock {
        block: Box<Block>,
        begin_block: ResponseBeginBlock,
        end_block: ResponseEndBlock,
    },
    NewBlockHeader {
        header: Box<Header>,
        num_txs: u64,
    },
    Tx {
        height: u64,
        index: u32,
        tx: Bytes,
        result: ResponseDeliverTx,
    },
}

impl Event {
    /// Name of the event kind (used to filter subscriptions).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewRoundStep(_) => "NewRoundStep",
            Self::NewRound { .. } => "NewRound",
            Self::CompleteProposal { .. } => "CompleteProposal",
            Self::TimeoutPropose(_) => "TimeoutPropose",
            Self::TimeoutWait(_) => "TimeoutWait",
            Self::Polka(_) => "Polka",
            Self::Lock(_) => "Lock",
            Self::Relock(_) => "Relock",
            Self::Unlock(_) => "Unlock",
            Self::ValidBlock(_) => "ValidBlock",
            Self::Vote(_) => "Vote",
            Self::NewBlock { .. } => "NewBlock",
            Self::NewBlockHeader { .. } => "NewBlockHeader",
            Self::Tx { .. } => "Tx",
        }
    }
}

/// Fans events out to subscribers.
///
/// Subscribers that dropped their receiver are removed on the next publish.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

struct Subscriber {
    kinds: Option<Vec<&'static str>>,
    sender: mpsc::UnboundedSender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to every event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        self.add(None)
    }

    /// Subscribes to the events with one of the given kinds.
    pub fn subscribe_to(&self, kinds: &[&'static str]) -> mpsc::UnboundedReceiver<Event> {
        self.add(Some(kinds.to_vec()))
    }

    fn add(&self, kinds: Option<Vec<&'static str>>) -> mpsc::UnboundedReceiver<Event> {
        let (sender, receiver) = mpsc::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Subscriber { kinds, sender });
        receiver
    }

    pub fn publish(&self, event: Event) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|subscriber| {
            if let Some(kinds) = &subscriber.kinds {
                if !kinds.contains(&event.kind()) {
                    return !subscriber.sender.is_closed();
                }
            }
            subscriber.sender.unbounded_send(event.clone()).is_ok()
        });
    }

    pub fn num_subscribers(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RoundStateEvent {
        RoundStateEvent {
            height: 1,
            round: 0,
            step: RoundStep::Propose,
        }
    }

    #[test]
    fn test_event_bus() {
        let bus = EventBus::new();
        let mut all = bus.subscribe();
        let mut timeouts = bus.subscribe_to(&["TimeoutPropose"]);

        bus.publish(Event::NewRoundStep(state()));
        bus.publish(Event::TimeoutPropose(state()));

        assert_eq!(
            all.try_next().unwrap().unwrap(),
            Event::NewRoundStep(state())
        );
        assert_eq!(
            all.try_next().unwrap().unwrap(),
            Event::TimeoutPropose(state())
        );
        assert_eq!(
            timeouts.try_next().unwrap().unwrap(),
            Event::TimeoutPropose(state())
        );
        assert!(timeouts.try_next().is_err());

        // Dropped subscribers are pruned
        drop(all);
        bus.publish(Event::Unlock(state()));
        assert_eq!(bus.num_subscribers(), 1);
    }
}
