//! Interface to the application driven by consensus.
//!
//! The application is a deterministic state machine reached through a request/response
//! protocol. [AppConns] holds the connections consensus uses: one to execute blocks, one
//! for the mempool, one for queries and one for state sync snapshots.

mod application;
mod client;
mod types;

pub use application::{
    make_validator_tx, Application, KvStoreApplication, CODE_TYPE_ENCODING_ERROR,
    CODE_TYPE_UNAUTHORIZED, VALIDATOR_SET_CHANGE_PREFIX,
};
pub use client::{AppConns, Callback, Client, LocalClient, ReqRes};
pub use types::*;
