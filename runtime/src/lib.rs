//! Durable storage and clocks for deterministic state machines.
//!
//! # Overview
//!
//! The consensus core runs as a single logical thread that must be able to persist
//! intermediate state (and recover it after a crash) without depending on a particular
//! filesystem or wall clock. This crate provides the two seams that make that testable:
//!
//! - [Storage]/[Blob]: partitioned, named byte arrays with explicit durability via [Blob::sync].
//! - [Clock]: the source of "now" used for block timestamps and timeout scheduling.
//!
//! Implementations:
//! - [storage::memory]: volatile storage (survives "restarts" within a process by sharing state)
//! - [storage::disk]: files under a root directory
//! - [SystemClock] and [ManualClock]

use std::{
    io::Error as IoError,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};
use thiserror::Error;

pub mod storage;

/// Errors that can occur when interacting with the runtime.
#[derive(Error, Debug)]
pub enum Error {
    #[error("read failed")]
    ReadFailed,
    #[error("write failed")]
    WriteFailed,
    #[error("partition name invalid, must only contain alphanumeric, dash ('-'), or underscore ('_') characters: {0}")]
    PartitionNameInvalid(String),
    #[error("partition creation failed: {0}")]
    PartitionCreationFailed(String),
    #[error("partition missing: {0}")]
    PartitionMissing(String),
    #[error("blob open failed: {0}/{1} error: {2}")]
    BlobOpenFailed(String, String, IoError),
    #[error("blob missing: {0}/{1}")]
    BlobMissing(String, String),
    #[error("blob resize failed: {0}/{1} error: {2}")]
    BlobResizeFailed(String, String, IoError),
    #[error("blob sync failed: {0}/{1} error: {2}")]
    BlobSyncFailed(String, String, IoError),
    #[error("blob insufficient length")]
    BlobInsufficientLength,
    #[error("offset overflow")]
    OffsetOverflow,
    #[error("io error: {0}")]
    Io(#[from] IoError),
}

/// Interface to open, remove and list blobs grouped into partitions.
pub trait Storage: Clone + Send + Sync + 'static {
    /// The readable/writeable storage buffer that can be opened by this Storage.
    type Blob: Blob;

    /// Open an existing blob in a given partition or create a new one, returning
    /// the blob and its length.
    ///
    /// Multiple instances of the same blob can be opened, however, writing to the
    /// same blob through different instances is undefined behavior.
    fn open(&self, partition: &str, name: &[u8]) -> Result<(Self::Blob, u64), Error>;

    /// Remove a blob from a given partition.
    ///
    /// If no `name` is provided, the entire partition is removed.
    fn remove(&self, partition: &str, name: Option<&[u8]>) -> Result<(), Error>;

    /// Return all blobs in a given partition (sorted).
    fn scan(&self, partition: &str) -> Result<Vec<Vec<u8>>, Error>;
}

/// Interface to read and write to a blob.
///
/// Cloning a blob is similar to wrapping a single file descriptor in a lock.
///
/// When a blob is dropped, any unsynced changes may be discarded. Call `sync`
/// before dropping to ensure all changes are durably persisted.
#[allow(clippy::len_without_is_empty)]
pub trait Blob: Clone + Send + Sync + 'static {
    /// Fill `buf` with the bytes at `offset`, failing if the blob is too short.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error>;

    /// Write `buf` to the blob at the given offset (extending the blob if needed).
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error>;

    /// Resize the blob to the given length.
    ///
    /// If the length is greater than the current length, the blob is extended with zeros.
    fn resize(&self, len: u64) -> Result<(), Error>;

    /// Ensure all pending data is durably persisted.
    fn sync(&self) -> Result<(), Error>;
}

/// Interface that provides the current time.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Returns the current time.
    fn current(&self) -> SystemTime;

    /// Returns the milliseconds elapsed since the UNIX epoch (zero before it).
    fn epoch_millis(&self) -> u64 {
        self.current()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Returns the duration from now until `deadline` (zero if it has passed).
    fn until(&self, deadline: SystemTime) -> Duration {
        deadline
            .duration_since(self.current())
            .unwrap_or(Duration::ZERO)
    }
}

/// [Clock] backed by the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn current(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// [Clock] that only moves when told to.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Moves the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += duration;
    }

    /// Sets the clock to `time` (which may be in the past).
    pub fn set(&self, time: SystemTime) {
        *self.now.lock().unwrap() = time;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn current(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::default();
        assert_eq!(clock.current(), SystemTime::UNIX_EPOCH);

        let shared = clock.clone();
        shared.advance(Duration::from_secs(3));
        assert_eq!(
            clock.current(),
            SystemTime::UNIX_EPOCH + Duration::from_secs(3)
        );

        let deadline = SystemTime::UNIX_EPOCH + Duration::from_secs(5);
        assert_eq!(clock.until(deadline), Duration::from_secs(2));
        clock.set(SystemTime::UNIX_EPOCH + Duration::from_secs(10));
        assert_eq!(clock.until(deadline), Duration::ZERO);
    }

    #[test]
    fn test_system_clock_moves() {
        let clock = SystemClock;
        let first = clock.current();
        assert!(clock.current() >= first);
    }
}
