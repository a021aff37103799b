//! `rdms` is a versioned, single-writer/many-reader key-subkey store
//! built around a block-structured, append-only memory layout: every
//! write lands in a fresh [`blob::Blob`] version, every reader holds a
//! [`Snapshot`] pinning exactly one version alive, and the writer never
//! blocks behind a reader.
//!
//! A [`Storage`] owns the current blob and dispatches each
//! [`Transaction`] through [`apply`] when it fits in place, or through
//! [`merge`] when the blob must be reallocated to make room. Host
//! applications plug in key/payload ownership and allocation through
//! [`Behavior`].

mod aatree;
mod apply;
mod behavior;
mod blob;
mod cell;
mod config;
mod error;
mod index_block;
mod merge;
mod refcount;
mod snapshot;
mod state_block;
mod storage;
mod transaction;
mod util;
mod version_block;

pub use crate::behavior::{
    Behavior, KeyHandle, KeySubscriptionHandle, PayloadHandle, SubkeySubscriptionHandle,
};
pub use crate::config::Config;
pub use crate::error::{Error, Result, TxnOutcome};
pub use crate::snapshot::{KeyIter, Snapshot, SubkeyIter};
pub use crate::storage::Storage;
pub use crate::transaction::Transaction;
