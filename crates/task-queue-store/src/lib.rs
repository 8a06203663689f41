//! Backing-store contract for the priority task queue.
//!
//! The queue never talks to a database directly. Brokers and workers hold an
//! `Arc<dyn Store>` and use three families of primitives through it:
//! ordered sets (ready and delayed sets), an append log with consumer groups
//! (the distribution log) and plain keys with expiry (locks), plus watch-style
//! optimistic transactions.
//!
//! Two adapters ship with the crate: [`MemoryStore`], an in-process model of
//! the contract, and `RedisStore` behind the `redis` feature.

mod config;
mod memory;
mod store;

#[cfg(feature = "redis")]
mod redis;

pub use config::StoreConfig;
pub use memory::MemoryStore;
pub use store::{
    AutoClaim, EntryId, KeyTtl, LogEntry, ScoredMember, Store, Transaction, WriteOp,
};

#[cfg(feature = "redis")]
pub use crate::redis::RedisStore;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// A key watched by a transaction was modified before `exec`.
    #[error("Transaction aborted: a watched key was modified")]
    Conflict,

    #[error("No consumer group {group} on log {key}")]
    NoGroup { key: String, group: String },

    #[error("Key {0} holds the wrong kind of value")]
    WrongType(String),

    #[error("Invalid log entry id: {0}")]
    InvalidEntryId(String),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// True for the optimistic-transaction collision that callers retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
