use crate::{Result, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Member of an ordered set together with its score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

impl ScoredMember {
    pub fn new(member: impl Into<String>, score: f64) -> Self {
        ScoredMember {
            member: member.into(),
            score,
        }
    }
}

/// Entry of an append log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl LogEntry {
    /// Value of a single field, if present
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Result of an idle-time claim pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoClaim {
    /// Cursor to resume the scan from; `0-0` once the scan is complete
    pub next: String,
    pub claimed: Vec<LogEntry>,
}

/// Remaining lifetime of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    /// The key exists but never expires
    Persistent,
    Expires(Duration),
}

/// Write buffered by a [`Transaction`] and applied atomically on `exec`
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    ZAdd {
        key: String,
        member: String,
        score: f64,
    },
    ZRem {
        key: String,
        member: String,
    },
    Del {
        key: String,
    },
}

/// Log entry id in `<millis>-<sequence>` form
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        EntryId { ms, seq }
    }

    /// Smallest id strictly greater than this one
    pub fn successor(self) -> Self {
        if self.seq == u64::MAX {
            EntryId::new(self.ms + 1, 0)
        } else {
            EntryId::new(self.ms, self.seq + 1)
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || StoreError::InvalidEntryId(s.to_string());
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        Ok(EntryId {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// Primitives the queue needs from its backing store.
///
/// Every call is a single round-trip against shared state; nothing here
/// retries. Compound atomic updates go through [`Store::watch`].
#[async_trait]
pub trait Store: Send + Sync {
    // Ordered sets

    /// Adds `member` with `score`, replacing the score of an existing member.
    /// Returns true if the member is new.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool>;

    /// Members with `min <= score <= max`, lowest score first.
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<ScoredMember>>;

    /// Members by rank, inclusive on both ends; negative ranks count from the end.
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<ScoredMember>>;

    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    async fn zcard(&self, key: &str) -> Result<usize>;

    // Append log with consumer groups

    /// Creates `group` on the log at `key`, creating the log if needed. The
    /// group starts before the first entry. Returns false if it already exists.
    async fn xgroup_create(&self, key: &str, group: &str) -> Result<bool>;

    /// Appends an entry and returns its id.
    async fn xadd(&self, key: &str, fields: &[(&str, &str)]) -> Result<String>;

    /// Reads up to `count` entries never delivered to `group`, assigning them
    /// to `consumer`. Waits up to `block` when none is available; a zero
    /// `block` does not wait.
    async fn xread_group_new(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>>;

    /// Entries delivered to `consumer` and not yet acknowledged.
    async fn xread_group_pending(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Vec<LogEntry>>;

    /// Transfers up to `count` pending entries idle for at least `min_idle`
    /// to `consumer`, scanning from `start`.
    async fn xautoclaim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: &str,
        count: usize,
    ) -> Result<AutoClaim>;

    /// Removes entries from the group's pending list. Returns how many were
    /// pending.
    async fn xack(&self, key: &str, group: &str, ids: &[&str]) -> Result<usize>;

    async fn xlen(&self, key: &str) -> Result<usize>;

    // Keys

    /// Sets `key` to `value` with an expiry, only if the key does not exist.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// Sets the expiry of an existing key. Returns false if the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    // Optimistic transactions

    /// Starts a transaction watching `keys`. If any of them changes before
    /// [`Transaction::exec`], the commit fails with [`StoreError::Conflict`].
    async fn watch(&self, keys: &[&str]) -> Result<Box<dyn Transaction>>;
}

/// Watch-style optimistic transaction
#[async_trait]
pub trait Transaction: Send {
    async fn get(&mut self, key: &str) -> Result<Option<String>>;

    async fn zrange_by_score(&mut self, key: &str, min: f64, max: f64) -> Result<Vec<ScoredMember>>;

    /// Applies `ops` atomically, or fails with [`StoreError::Conflict`].
    async fn exec(self: Box<Self>, ops: Vec<WriteOp>) -> Result<()>;

    /// Ends the transaction without writing.
    async fn discard(self: Box<Self>) -> Result<()>;
}
