//! Serialize structured data.
//!
//! # Overview
//!
//! A binary serialization library designed to:
//! - Serialize structured data into a deterministic binary format (signatures are computed
//!   over these bytes, so two honest nodes must always agree on them)
//! - Deserialize untrusted binary input into structured data without unbounded allocation
//!
//! # Supported Types
//!
//! Natively supports:
//! - Primitives: `u8`, `u16`, `u32`, `u64`, `i8`, `i16`, `i32`, `i64`, `bool`
//! - Collections: `Vec<T>`, `Option<T>`, `Bytes`, `String` and fixed-size arrays `[u8; N]`
//!
//! User-defined types implement [Write], [EncodeSize] and [Read] and then receive [Encode] and
//! [Decode] for free.
//!
//! # Example
//!
//! ```
//! use bytes::{Buf, BufMut};
//! use halcyon_codec::{DecodeExt, Encode, EncodeSize, Error, Read, ReadExt, Write};
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Item {
//!     height: u64,
//!     round: Option<u32>,
//! }
//!
//! impl Write for Item {
//!     fn write(&self, buf: &mut impl BufMut) {
//!         self.height.write(buf);
//!         self.round.write(buf);
//!     }
//! }
//!
//! impl EncodeSize for Item {
//!     fn encode_size(&self) -> usize {
//!         self.height.encode_size() + self.round.encode_size()
//!     }
//! }
//!
//! impl Read for Item {
//!     type Cfg = ();
//!
//!     fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
//!         let height = u64::read(buf)?;
//!         let round = Option::<u32>::read_cfg(buf, &())?;
//!         Ok(Self { height, round })
//!     }
//! }
//!
//! let item = Item { height: 7, round: Some(1) };
//! let decoded = Item::decode(item.encode()).unwrap();
//! assert_eq!(item, decoded);
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod types;
pub mod util;
pub mod varint;

pub use codec::{Codec, Decode, DecodeExt, Encode, EncodeSize, FixedSize, Read, ReadExt, Write};
pub use config::RangeCfg;
pub use error::Error;
