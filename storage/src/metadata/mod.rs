//! A key-value store optimized for atomically committing a small collection of metadata.
//!
//! [Metadata] keeps every key in memory and allows multiple updates to be committed in a
//! single batch with [Metadata::sync]. It is used to persist state that must survive restarts
//! (validator sets, application responses, signing state).
//!
//! # Format
//!
//! Data stored in [Metadata] is serialized as a sequence of key-value pairs in either a
//! "left" or "right" blob:
//!
//! ```text
//! +---------------+------------+------+------------+--------+-----+------------+
//! | Version (u64) | Len(K1) u32| Key1 | Len(V1) u32| Value1 | ... | CRC32(u32) |
//! +---------------+------------+------+------------+--------+-----+------------+
//! ```
//!
//! # Atomic Updates
//!
//! To provide support for atomic updates, [Metadata] maintains two blobs. When a new update is
//! committed, it is written to the blob holding the older version. Writes to a
//! [halcyon_runtime::Blob] are not atomic and may only complete partially, so the newer blob is
//! never overwritten in place: on restart, the valid blob with the highest version wins.

mod storage;

pub use storage::Metadata;
use thiserror::Error;

/// Errors that can occur when interacting with [Metadata].
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] halcyon_runtime::Error),
    #[error("blob too large: {0}")]
    BlobTooLarge(u64),
    #[error("value too big for key: {0:?}")]
    ValueTooBig(Vec<u8>),
}

/// Configuration for [Metadata] storage.
#[derive(Clone, Debug)]
pub struct Config {
    /// The [halcyon_runtime::Storage] partition to use for storing metadata.
    pub partition: String,
}
