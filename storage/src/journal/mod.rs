//! An append-only log for storing arbitrary data.
//!
//! Items are grouped into `sections` (each stored in its own [halcyon_runtime::Blob]) so that
//! old data can be pruned a section at a time. Within a section, items are stored in the
//! order they were appended.
//!
//! # Format
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+---+---+
//! | 0 | 1 | 2 | 3 | 4 |    ...    | 8 | 9 |10 |11 |
//! +---+---+---+---+---+---+---+---+---+---+---+---+
//! |   Size (u32)  |   Data    |    C(u32)         |
//! +---+---+---+---+---+---+---+---+---+---+---+---+
//!
//! C = CRC32(Data)
//! ```
//!
//! # Recovery
//!
//! An unclean shutdown may leave a partially written item at the end of a section. When
//! [Journal::replay] encounters an item that is incomplete or fails its checksum, the section
//! is truncated at the last valid item and replay continues with the next section.
//!
//! # Durability
//!
//! [Journal::append] only buffers data in the underlying blob. Call [Journal::sync] (or
//! [Journal::close]) to make it durable.

mod disk;

pub use disk::Journal;

use halcyon_runtime::Error as RError;
use thiserror::Error;

/// Errors that can occur when interacting with the journal.
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] RError),
    #[error("invalid blob name: {0}")]
    InvalidBlobName(String),
    #[error("blob corrupt")]
    BlobCorrupt,
    #[error("item too large: {0}")]
    ItemTooLarge(usize),
    #[error("section already pruned: {0}")]
    AlreadyPrunedToSection(u64),
}

/// Configuration for [Journal] storage.
#[derive(Clone, Debug)]
pub struct Config {
    /// The [halcyon_runtime::Storage] partition to use for storing sections.
    pub partition: String,

    /// The largest item that can be appended (and the largest size accepted on replay).
    pub max_item_size: u32,
}
