//! Persist and retrieve data from an abstract store.
//!
//! - [journal]: append-only log of items grouped into sections, recovering from torn writes
//! - [metadata]: small key-value store committed atomically

pub mod journal;
pub mod metadata;
