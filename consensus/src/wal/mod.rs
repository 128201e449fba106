//! Write-ahead log of consensus inputs.
//!
//! Every message, timeout and step change is written before the state machine acts on it, so
//! a restarted node can replay the messages of an unfinished height and reach the same round
//! state it had before crashing.
//!
//! # Layout
//!
//! Entries are stored in a [Journal] with one section per height: the entries of height `h`
//! (followed by `EndHeight(h)`) are appended to section `h`. A fresh log starts with
//! `EndHeight(0)` so that the first height can always be located.
//!
//! A torn write at the end of the log (a partially written entry or one failing its checksum)
//! is truncated when the log is opened, as if it was never written.

mod message;

pub use message::{ConsensusMessage, MsgInfo, TimedWalMessage, TimeoutInfo, WalMessage};

use crate::Error;
use halcyon_codec::{DecodeExt, Encode, EncodeSize};
use halcyon_runtime::{Clock, Storage};
use halcyon_storage::journal::{self, Journal};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Largest encoded entry accepted by the log.
pub const MAX_MSG_SIZE_BYTES: usize = 1024 * 1024;

/// Durable log of the inputs of the consensus state machine.
pub trait Wal: Send + 'static {
    /// Buffers `msg` (an `EndHeight` marker is always synced).
    fn write(&mut self, msg: WalMessage) -> Result<(), Error>;

    /// Writes `msg` and syncs the log before returning.
    fn write_sync(&mut self, msg: WalMessage) -> Result<(), Error>;

    fn flush_and_sync(&mut self) -> Result<(), Error>;

    /// Returns the entries written after `EndHeight(height)`.
    ///
    /// Fails with [Error::EndHeightNotFound] if the marker was never written.
    fn search_for_end_height(&mut self, height: u64) -> Result<WalReader, Error>;

    /// Discards the entries that are only needed to replay heights below `height`.
    fn prune(&mut self, _height: u64) -> Result<(), Error> {
        Ok(())
    }

    /// Syncs and closes the log. Later writes fail.
    fn stop(&mut self) -> Result<(), Error>;
}

/// Entries of the log in the order they were written.
#[derive(Debug, Default)]
pub struct WalReader {
    entries: VecDeque<TimedWalMessage>,
}

impl WalReader {
    pub fn new(entries: Vec<TimedWalMessage>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Iterator for WalReader {
    type Item = TimedWalMessage;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.pop_front()
    }
}

/// Configuration for [BaseWal].
#[derive(Clone, Debug)]
pub struct Config {
    /// The [Storage] partition to store entries in.
    pub partition: String,
}

/// [Wal] stored in a [Journal].
pub struct BaseWal<S: Storage, C: Clock> {
    clock: C,
    journal: Option<Journal<S>>,

    /// Section new entries are appended to.
    section: u64,
}

impl<S: Storage, C: Clock> BaseWal<S, C> {
    /// Opens the log stored in `cfg.partition`, truncating a torn tail.
    pub fn init(storage: S, clock: C, cfg: Config) -> Result<Self, Error> {
        let mut journal = Journal::init(
            storage,
            journal::Config {
                partition: cfg.partition,
                max_item_size: MAX_MSG_SIZE_BYTES as u32,
            },
        )?;

        let mut wal = match journal.sections().last() {
            None => {
                let mut wal = Self {
                    clock,
                    journal: Some(journal),
                    section: 0,
                };
                wal.write_sync(WalMessage::EndHeight(0))?;
                wal
            }
            Some(last) => {
                // Reading the last section repairs its tail and tells which height it ended
                let mut ended = None;
                journal.replay(last, |_, _, raw| {
                    if let Ok(entry) = TimedWalMessage::decode(raw) {
                        ended = match entry.msg {
                            WalMessage::EndHeight(height) => Some(height),
                            _ => None,
                        };
                    }
                    true
                })?;
                let section = ended.map_or(last, |height| height + 1);
                Self {
                    clock,
                    journal: Some(journal),
                    section,
                }
            }
        };
        wal.flush_and_sync()?;
        debug!(section = wal.section, "opened WAL");
        Ok(wal)
    }

    fn journal(&mut self) -> Result<&mut Journal<S>, Error> {
        self.journal.as_mut().ok_or(Error::Stopped)
    }

    fn append(&mut self, msg: WalMessage) -> Result<u64, Error> {
        let entry = TimedWalMessage {
            time: self.clock.epoch_millis(),
            msg,
        };
        let size = entry.encode_size();
        if size > MAX_MSG_SIZE_BYTES {
            return Err(Error::WalMessageTooLarge(size));
        }
        let section = self.section;
        self.journal()?.append(section, &entry.encode())?;
        if let WalMessage::EndHeight(height) = entry.msg {
            self.section = height + 1;
        }
        Ok(section)
    }
}

impl<S: Storage, C: Clock> Wal for BaseWal<S, C> {
    fn write(&mut self, msg: WalMessage) -> Result<(), Error> {
        if matches!(msg, WalMessage::EndHeight(_)) {
            return self.write_sync(msg);
        }
        self.append(msg)?;
        Ok(())
    }

    fn write_sync(&mut self, msg: WalMessage) -> Result<(), Error> {
        let section = self.append(msg)?;
        self.journal()?.sync(section)?;
        Ok(())
    }

    fn flush_and_sync(&mut self) -> Result<(), Error> {
        self.journal()?.sync_all()?;
        Ok(())
    }

    fn search_for_end_height(&mut self, height: u64) -> Result<WalReader, Error> {
        // The marker is in the last section started at or before the height
        let journal = self.journal()?;
        let start = journal
            .sections()
            .take_while(|section| *section <= height)
            .last()
            .unwrap_or(0);

        let mut found = false;
        let mut entries = Vec::new();
        journal.replay(start, |section, _, raw| {
            let entry = match TimedWalMessage::decode(raw) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(?err, section, "undecodable WAL entry: stopping search");
                    return false;
                }
            };
            if found {
                entries.push(entry);
            } else if entry.msg == WalMessage::EndHeight(height) {
                found = true;
            }
            true
        })?;
        if !found {
            return Err(Error::EndHeightNotFound(height));
        }
        debug!(height, entries = entries.len(), "found end of height in WAL");
        Ok(WalReader::new(entries))
    }

    fn prune(&mut self, height: u64) -> Result<(), Error> {
        let journal = self.journal()?;
        let Some(keep) = journal
            .sections()
            .take_while(|section| *section < height)
            .last()
        else {
            return Ok(());
        };
        journal.prune(keep)?;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Error> {
        if let Some(journal) = self.journal.take() {
            journal.close()?;
            debug!(section = self.section, "closed WAL");
        }
        Ok(())
    }
}

/// [Wal] that discards every entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct NilWal;

impl Wal for NilWal {
    fn write(&mut self, _: WalMessage) -> Result<(), Error> {
        Ok(())
    }

    fn write_sync(&mut self, _: WalMessage) -> Result<(), Error> {
        Ok(())
    }

    fn flush_and_sync(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn search_for_end_height(&mut self, height: u64) -> Result<WalReader, Error> {
        Err(Error::EndHeightNotFound(height))
    }

    fn stop(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl<W: Wal + ?Sized> Wal for Box<W> {
    fn write(&mut self, msg: WalMessage) -> Result<(), Error> {
        (**self).write(msg)
    }

    fn write_sync(&mut self, msg: WalMessage) -> Result<(), Error> {
        (**self).write_sync(msg)
    }

    fn flush_and_sync(&mut self) -> Result<(), Error> {
        (**self).flush_and_sync()
    }

    fn search_for_end_height(&mut self, height: u64) -> Result<WalReader, Error> {
        (**self).search_for_end_height(height)
    }

    fn prune(&mut self, height: u64) -> Result<(), Error> {
        (**self).prune(height)
    }

    fn stop(&mut self) -> Result<(), Error> {
        (**self).stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PartSet, RoundStateEvent, RoundStep};
    use halcyon_macros::test_traced;
    use halcyon_runtime::{
        storage::{disk, memory},
        Blob, ManualClock,
    };
    use std::time::{Duration, SystemTime};

    const PARTITION: &str = "wal";

    fn open(
        storage: &memory::Storage,
        clock: &ManualClock,
    ) -> BaseWal<memory::Storage, ManualClock> {
        BaseWal::init(
            storage.clone(),
            clock.clone(),
            Config {
                partition: PARTITION.into(),
            },
        )
        .unwrap()
    }

    fn step(height: u64, round: u32, step: RoundStep) -> WalMessage {
        WalMessage::RoundState(RoundStateEvent {
            height,
            round,
            step,
        })
    }

    #[test_traced]
    fn test_new_log_starts_with_end_of_height_zero() {
        let storage = memory::Storage::default();
        let clock = ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_millis(1_000));
        let mut wal = open(&storage, &clock);
        assert!(wal.search_for_end_height(0).unwrap().is_empty());
        assert!(matches!(
            wal.search_for_end_height(1),
            Err(Error::EndHeightNotFound(1))
        ));
    }

    #[test_traced]
    fn test_search_for_end_height() {
        let storage = memory::Storage::default();
        let clock = ManualClock::default();
        let mut wal = open(&storage, &clock);
        for height in 1..=3 {
            clock.advance(Duration::from_millis(10));
            wal.write(step(height, 0, RoundStep::NewHeight)).unwrap();
            wal.write_sync(step(height, 0, RoundStep::Propose)).unwrap();
            if height < 3 {
                wal.write(WalMessage::EndHeight(height)).unwrap();
            }
        }
        wal.stop().unwrap();
        assert!(matches!(wal.write(WalMessage::EndHeight(3)), Err(Error::Stopped)));

        // Reopen and find the entries of the unfinished height
        let mut wal = open(&storage, &clock);
        let entries: Vec<_> = wal.search_for_end_height(2).unwrap().collect();
        assert_eq!(
            entries,
            vec![
                TimedWalMessage {
                    time: 30,
                    msg: step(3, 0, RoundStep::NewHeight)
                },
                TimedWalMessage {
                    time: 30,
                    msg: step(3, 0, RoundStep::Propose)
                },
            ]
        );

        // Everything after an earlier height includes its successors
        let entries = wal.search_for_end_height(1).unwrap();
        assert_eq!(entries.len(), 4);
        assert!(matches!(
            wal.search_for_end_height(3),
            Err(Error::EndHeightNotFound(3))
        ));

        // New entries keep going to the unfinished height
        wal.write(WalMessage::EndHeight(3)).unwrap();
        wal.write(step(4, 0, RoundStep::NewHeight)).unwrap();
        wal.flush_and_sync().unwrap();
        let entries: Vec<_> = wal.search_for_end_height(3).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test_traced]
    fn test_reopen_after_skipping_heights() {
        let storage = memory::Storage::default();
        let clock = ManualClock::default();

        // A chain starting at height 5 ends height 4 right after the initial marker
        let mut wal = open(&storage, &clock);
        wal.write_sync(WalMessage::EndHeight(4)).unwrap();
        wal.stop().unwrap();

        let mut wal = open(&storage, &clock);
        assert_eq!(wal.section, 5);
        wal.write(step(5, 0, RoundStep::NewHeight)).unwrap();
        wal.write(WalMessage::EndHeight(5)).unwrap();
        wal.write(step(6, 0, RoundStep::NewHeight)).unwrap();
        wal.stop().unwrap();

        let mut sections = storage.scan(PARTITION).unwrap();
        sections.sort();
        assert_eq!(
            sections,
            vec![
                0u64.to_be_bytes().to_vec(),
                1u64.to_be_bytes().to_vec(),
                5u64.to_be_bytes().to_vec(),
                6u64.to_be_bytes().to_vec(),
            ]
        );
        let mut wal = open(&storage, &clock);
        assert_eq!(wal.section, 6);
        let entries: Vec<_> = wal.search_for_end_height(4).unwrap().collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].msg, step(5, 0, RoundStep::NewHeight));
        let entries: Vec<_> = wal.search_for_end_height(5).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].msg, step(6, 0, RoundStep::NewHeight));
    }

    #[test_traced]
    fn test_unsynced_writes_are_lost_on_crash() {
        let storage = memory::Storage::default();
        let clock = ManualClock::default();
        let mut wal = open(&storage, &clock);
        wal.write_sync(step(1, 0, RoundStep::NewHeight)).unwrap();
        wal.write(step(1, 0, RoundStep::Propose)).unwrap();
        drop(wal);

        let mut wal = open(&storage, &clock);
        let entries: Vec<_> = wal.search_for_end_height(0).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].msg, step(1, 0, RoundStep::NewHeight));
    }

    #[test_traced]
    fn test_torn_tail_is_truncated() {
        let storage = memory::Storage::default();
        let clock = ManualClock::default();
        let mut wal = open(&storage, &clock);
        wal.write_sync(step(1, 0, RoundStep::Prevote)).unwrap();
        wal.stop().unwrap();

        // Append half an entry to the unfinished section
        let (blob, len) = storage.open(PARTITION, &1u64.to_be_bytes()).unwrap();
        blob.write_at(&[0, 0, 0, 40, 1, 2, 3], len).unwrap();
        blob.sync().unwrap();

        let mut wal = open(&storage, &clock);
        let entries: Vec<_> = wal.search_for_end_height(0).unwrap().collect();
        assert_eq!(entries.last().unwrap().msg, step(1, 0, RoundStep::Prevote));

        // Writes continue after the last valid entry
        wal.write_sync(step(1, 0, RoundStep::Precommit)).unwrap();
        let entries: Vec<_> = wal.search_for_end_height(0).unwrap().collect();
        assert_eq!(entries.last().unwrap().msg, step(1, 0, RoundStep::Precommit));
    }

    #[test]
    fn test_rejects_oversized_entries() {
        let storage = memory::Storage::default();
        let mut wal = open(&storage, &ManualClock::default());
        let mut part = PartSet::from_data(&[1u8; 8], 8)
            .get_part(0)
            .unwrap()
            .clone();
        part.bytes = vec![0u8; MAX_MSG_SIZE_BYTES].into();
        let msg = WalMessage::MsgInfo(MsgInfo {
            msg: ConsensusMessage::BlockPart {
                height: 1,
                round: 0,
                part,
            },
            peer: None,
        });
        assert!(matches!(wal.write(msg), Err(Error::WalMessageTooLarge(_))));
    }

    #[test]
    fn test_prune_keeps_end_of_previous_height() {
        let storage = memory::Storage::default();
        let mut wal = open(&storage, &ManualClock::default());
        for height in 1..=4 {
            wal.write(step(height, 0, RoundStep::NewHeight)).unwrap();
            wal.write(WalMessage::EndHeight(height)).unwrap();
        }
        wal.prune(3).unwrap();
        assert!(wal.search_for_end_height(1).is_err());
        assert_eq!(wal.search_for_end_height(2).unwrap().len(), 4);
    }

    #[test_traced]
    fn test_disk_wal_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = disk::Config::new(dir.path().to_path_buf());
        let clock = ManualClock::default();
        let wal_config = || Config {
            partition: PARTITION.into(),
        };

        let mut wal =
            BaseWal::init(disk::Storage::new(cfg.clone()), clock.clone(), wal_config()).unwrap();
        wal.write(step(1, 0, RoundStep::NewHeight)).unwrap();
        wal.write_sync(WalMessage::EndHeight(1)).unwrap();
        wal.write_sync(step(2, 0, RoundStep::Propose)).unwrap();
        wal.stop().unwrap();

        let mut wal = BaseWal::init(disk::Storage::new(cfg), clock, wal_config()).unwrap();
        assert!(matches!(
            wal.search_for_end_height(2),
            Err(Error::EndHeightNotFound(2))
        ));
        let entries: Vec<_> = wal.search_for_end_height(1).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].msg, step(2, 0, RoundStep::Propose));
    }

    #[test]
    fn test_nil_wal() {
        let mut wal = NilWal;
        wal.write_sync(WalMessage::EndHeight(1)).unwrap();
        assert!(matches!(
            wal.search_for_end_height(1),
            Err(Error::EndHeightNotFound(1))
        ));
    }
}
