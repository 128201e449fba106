//! Error types for codec operations

use thiserror::Error;

/// Error type for codec operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unexpected end of buffer")]
    EndOfBuffer,
    #[error("extra data found: {0} bytes")]
    ExtraData(usize),
    #[error("invalid length: {0}")]
    InvalidLength(usize),
    #[error("invalid varint")]
    InvalidVarint,
    #[error("invalid bool")]
    InvalidBool,
    #[error("invalid enum tag in {0}: {1}")]
    InvalidEnum(&'static str, u8),
    #[error("invalid data in {0}: {1}")]
    Invalid(&'static str, &'static str),
}
