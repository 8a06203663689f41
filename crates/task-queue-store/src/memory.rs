use crate::store::{AutoClaim, EntryId, KeyTtl, LogEntry, ScoredMember, Store, Transaction, WriteOp};
use crate::{Result, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::ops::Bound;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// In-process implementation of the [`Store`] contract.
///
/// Clones share the same state, so one `MemoryStore` can stand in for the
/// shared backing store of several brokers and workers inside one process.
/// Every key carries a version that changes on each write; transactions
/// compare those versions at `exec` time the way `WATCH` does. Time-based
/// behaviour (expiry, idle time) follows `tokio::time`, so paused-clock tests
/// can drive it.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

type WatchHook = Box<dyn FnOnce(MemoryStore) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    appended: Notify,
    watch_hook: Mutex<Option<WatchHook>>,
    failures: Mutex<Vec<&'static str>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain `SET` without expiry
    pub fn set(&self, key: &str, value: &str) {
        let mut state = self.shared.state.lock();
        state.keys.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at: None,
            },
        );
        state.touch(key);
    }

    /// Runs `hook` once, right after the next `watch` has recorded the
    /// versions of its keys. Writes made by the hook look like a concurrent
    /// writer to that transaction.
    pub fn on_next_watch<F, Fut>(&self, hook: F)
    where
        F: FnOnce(MemoryStore) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: WatchHook =
            Box::new(move |store| -> Pin<Box<dyn Future<Output = ()> + Send>> {
                Box::pin(hook(store))
            });
        *self.shared.watch_hook.lock() = Some(hook);
    }

    /// Makes the next call of `command` (the `Store` method name, e.g.
    /// `"xack"`) fail with a backend error.
    pub fn fail_next(&self, command: &'static str) {
        self.shared.failures.lock().push(command);
    }

    fn injected(&self, command: &'static str) -> Result<()> {
        let mut failures = self.shared.failures.lock();
        match failures.iter().position(|c| *c == command) {
            Some(i) => {
                failures.remove(i);
                Err(StoreError::Backend(format!("injected {} failure", command)))
            }
            None => Ok(()),
        }
    }

    /// `(entry id, consumer)` for every pending entry of `group`
    pub fn pending_owners(&self, key: &str, group: &str) -> Vec<(String, String)> {
        let mut state = self.shared.state.lock();
        match state.log(key) {
            Ok(Some(log)) => log
                .groups
                .get(group)
                .map(|group| {
                    group
                        .pending
                        .iter()
                        .map(|(id, pending)| (id.to_string(), pending.consumer.clone()))
                        .collect()
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.shared.state.lock().keys.len())
            .finish()
    }
}

#[derive(Default)]
struct State {
    keys: HashMap<String, Slot>,
    versions: HashMap<String, u64>,
}

struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

enum Value {
    Str(String),
    Sorted(SortedSet),
    Log(Log),
}

impl State {
    fn touch(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_default() += 1;
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn purge_if_expired(&mut self, key: &str) {
        let now = Instant::now();
        let expired = self
            .keys
            .get(key)
            .and_then(|slot| slot.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            trace!("Key {} expired", key);
            self.keys.remove(key);
            self.touch(key);
        }
    }

    fn slot(&mut self, key: &str) -> Option<&mut Slot> {
        self.purge_if_expired(key);
        self.keys.get_mut(key)
    }

    fn insert_if_absent(&mut self, key: &str, value: impl FnOnce() -> Value) {
        if self.slot(key).is_none() {
            self.keys.insert(
                key.to_string(),
                Slot {
                    value: value(),
                    expires_at: None,
                },
            );
        }
    }

    fn string(&mut self, key: &str) -> Result<Option<String>> {
        match self.slot(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Str(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn sorted(&mut self, key: &str) -> Result<Option<&mut SortedSet>> {
        match self.slot(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Sorted(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn sorted_or_create(&mut self, key: &str) -> Result<&mut SortedSet> {
        self.insert_if_absent(key, || Value::Sorted(SortedSet::default()));
        match self.keys.get_mut(key) {
            Some(Slot {
                value: Value::Sorted(set),
                ..
            }) => Ok(set),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn log(&mut self, key: &str) -> Result<Option<&mut Log>> {
        match self.slot(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Log(log),
                ..
            }) => Ok(Some(log)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn log_or_create(&mut self, key: &str) -> Result<&mut Log> {
        self.insert_if_absent(key, || Value::Log(Log::default()));
        match self.keys.get_mut(key) {
            Some(Slot {
                value: Value::Log(log),
                ..
            }) => Ok(log),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn group_log(&mut self, key: &str, group: &str) -> Result<&mut Log> {
        match self.log(key)? {
            Some(log) if log.groups.contains_key(group) => Ok(log),
            _ => Err(StoreError::NoGroup {
                key: key.to_string(),
                group: group.to_string(),
            }),
        }
    }

    fn zadd(&mut self, key: &str, member: &str, score: f64) -> Result<bool> {
        let added = self.sorted_or_create(key)?.insert(member, score);
        self.touch(key);
        Ok(added)
    }

    fn zrem(&mut self, key: &str, member: &str) -> Result<bool> {
        let (removed, now_empty) = match self.sorted(key)? {
            Some(set) => (set.remove(member), set.is_empty()),
            None => return Ok(false),
        };
        if now_empty {
            self.keys.remove(key);
        }
        if removed {
            self.touch(key);
        }
        Ok(removed)
    }

    fn zrange_by_score(&mut self, key: &str, min: f64, max: f64) -> Result<Vec<ScoredMember>> {
        Ok(self
            .sorted(key)?
            .map(|set| set.range_by_score(min, max))
            .unwrap_or_default())
    }

    fn del(&mut self, key: &str) -> bool {
        let existed = self.slot(key).is_some();
        if existed {
            self.keys.remove(key);
            self.touch(key);
        }
        existed
    }

    fn apply(&mut self, op: WriteOp) -> Result<()> {
        match op {
            WriteOp::ZAdd { key, member, score } => {
                self.zadd(&key, &member, score)?;
            }
            WriteOp::ZRem { key, member } => {
                self.zrem(&key, &member)?;
            }
            WriteOp::Del { key } => {
                self.del(&key);
            }
        }
        Ok(())
    }
}

/// f64 with a total order so it can key a `BTreeSet`
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Members ordered by score, then lexicographically
#[derive(Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    order: BTreeSet<(Score, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) -> bool {
        let is_new = match self.scores.insert(member.to_string(), score) {
            Some(old) => {
                self.order.remove(&(Score(old), member.to_string()));
                false
            }
            None => true,
        };
        self.order.insert((Score(score), member.to_string()));
        is_new
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.order.remove(&(Score(score), member.to_string()));
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn range_by_score(&self, min: f64, max: f64) -> Vec<ScoredMember> {
        self.order
            .range((Bound::Included((Score(min), String::new())), Bound::Unbounded))
            .take_while(|(score, _)| score.0 <= max)
            .map(|(score, member)| ScoredMember::new(member.clone(), score.0))
            .collect()
    }

    fn range_by_rank(&self, start: isize, stop: isize) -> Vec<ScoredMember> {
        let len = self.order.len() as isize;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Vec::new();
        }

        self.order
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .map(|(score, member)| ScoredMember::new(member.clone(), score.0))
            .collect()
    }
}

#[derive(Default)]
struct Log {
    last_id: EntryId,
    entries: BTreeMap<EntryId, HashMap<String, String>>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Group {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, Pending>,
}

struct Pending {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

impl Log {
    fn append(&mut self, fields: &[(&str, &str)]) -> EntryId {
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let id = if now_ms > self.last_id.ms {
            EntryId::new(now_ms, 0)
        } else {
            self.last_id.successor()
        };
        let fields = fields
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        self.entries.insert(id, fields);
        self.last_id = id;
        id
    }

    fn entry(&self, id: EntryId) -> Option<LogEntry> {
        self.entries.get(&id).map(|fields| LogEntry {
            id: id.to_string(),
            fields: fields.clone(),
        })
    }

    fn read_new(&mut self, group: &str, consumer: &str, count: usize) -> Vec<LogEntry> {
        let Some(group) = self.groups.get_mut(group) else {
            return Vec::new();
        };
        let limit = if count == 0 { usize::MAX } else { count };
        let now = Instant::now();

        let ids: Vec<EntryId> = self
            .entries
            .range((Bound::Excluded(group.last_delivered), Bound::Unbounded))
            .take(limit)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            group.pending.insert(
                *id,
                Pending {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
        }
        if let Some(last) = ids.last() {
            group.last_delivered = *last;
        }

        ids.into_iter().filter_map(|id| self.entry(id)).collect()
    }

    fn read_pending(&mut self, group: &str, consumer: &str) -> Vec<LogEntry> {
        let Some(group) = self.groups.get_mut(group) else {
            return Vec::new();
        };
        let now = Instant::now();

        let mut ids = Vec::new();
        for (id, pending) in group.pending.iter_mut() {
            if pending.consumer == consumer {
                pending.delivered_at = now;
                pending.deliveries += 1;
                ids.push(*id);
            }
        }

        ids.into_iter().filter_map(|id| self.entry(id)).collect()
    }

    fn ack(&mut self, group: &str, ids: &[EntryId]) -> usize {
        let Some(group) = self.groups.get_mut(group) else {
            return 0;
        };
        ids.iter()
            .filter(|id| group.pending.remove(*id).is_some())
            .count()
    }

    fn auto_claim(
        &mut self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: EntryId,
        count: usize,
    ) -> AutoClaim {
        let Some(group) = self.groups.get_mut(group) else {
            return AutoClaim {
                next: EntryId::ZERO.to_string(),
                claimed: Vec::new(),
            };
        };
        let limit = count.max(1);
        let now = Instant::now();

        let mut claimed_ids = Vec::new();
        let mut next = EntryId::ZERO;
        for (id, pending) in group.pending.range_mut(start..) {
            if claimed_ids.len() == limit {
                next = *id;
                break;
            }
            if now.saturating_duration_since(pending.delivered_at) >= min_idle {
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                pending.deliveries += 1;
                claimed_ids.push(*id);
            }
        }

        AutoClaim {
            next: next.to_string(),
            claimed: claimed_ids
                .into_iter()
                .filter_map(|id| self.entry(id))
                .collect(),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool> {
        self.injected("zadd")?;
        self.shared.state.lock().zadd(key, member, score)
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<ScoredMember>> {
        self.injected("zrange_by_score")?;
        self.shared.state.lock().zrange_by_score(key, min, max)
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<ScoredMember>> {
        self.injected("zrange")?;
        Ok(self
            .shared
            .state
            .lock()
            .sorted(key)?
            .map(|set| set.range_by_rank(start, stop))
            .unwrap_or_default())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        self.injected("zrem")?;
        self.shared.state.lock().zrem(key, member)
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        self.injected("zcard")?;
        Ok(self
            .shared
            .state
            .lock()
            .sorted(key)?
            .map(|set| set.len())
            .unwrap_or(0))
    }

    async fn xgroup_create(&self, key: &str, group: &str) -> Result<bool> {
        self.injected("xgroup_create")?;
        let mut state = self.shared.state.lock();
        let log = state.log_or_create(key)?;
        if log.groups.contains_key(group) {
            return Ok(false);
        }
        log.groups.insert(group.to_string(), Group::default());
        state.touch(key);
        Ok(true)
    }

    async fn xadd(&self, key: &str, fields: &[(&str, &str)]) -> Result<String> {
        self.injected("xadd")?;
        let id = {
            let mut state = self.shared.state.lock();
            let id = state.log_or_create(key)?.append(fields);
            state.touch(key);
            id
        };
        self.shared.appended.notify_waiters();
        Ok(id.to_string())
    }

    async fn xread_group_new(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        self.injected("xread_group_new")?;
        let deadline = Instant::now() + block;
        loop {
            let appended = self.shared.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let entries = {
                let mut state = self.shared.state.lock();
                let entries = state.group_log(key, group)?.read_new(group, consumer, count);
                if !entries.is_empty() {
                    state.touch(key);
                }
                entries
            };
            if !entries.is_empty() || block.is_zero() {
                return Ok(entries);
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn xread_group_pending(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Vec<LogEntry>> {
        self.injected("xread_group_pending")?;
        let mut state = self.shared.state.lock();
        let entries = state.group_log(key, group)?.read_pending(group, consumer);
        if !entries.is_empty() {
            state.touch(key);
        }
        Ok(entries)
    }

    async fn xautoclaim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: &str,
        count: usize,
    ) -> Result<AutoClaim> {
        self.injected("xautoclaim")?;
        let start: EntryId = start.parse()?;
        let mut state = self.shared.state.lock();
        let claim = state
            .group_log(key, group)?
            .auto_claim(group, consumer, min_idle, start, count);
        if !claim.claimed.is_empty() {
            state.touch(key);
        }
        Ok(claim)
    }

    async fn xack(&self, key: &str, group: &str, ids: &[&str]) -> Result<usize> {
        self.injected("xack")?;
        let ids = ids
            .iter()
            .map(|id| id.parse())
            .collect::<Result<Vec<EntryId>>>()?;
        let mut state = self.shared.state.lock();
        let acked = match state.log(key)? {
            Some(log) => log.ack(group, &ids),
            None => 0,
        };
        if acked > 0 {
            state.touch(key);
        }
        Ok(acked)
    }

    async fn xlen(&self, key: &str) -> Result<usize> {
        self.injected("xlen")?;
        Ok(self
            .shared
            .state
            .lock()
            .log(key)?
            .map(|log| log.entries.len())
            .unwrap_or(0))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.injected("set_nx")?;
        let mut state = self.shared.state.lock();
        if state.slot(key).is_some() {
            return Ok(false);
        }
        state.keys.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        state.touch(key);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.injected("get")?;
        self.shared.state.lock().string(key)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.injected("ttl")?;
        let mut state = self.shared.state.lock();
        Ok(match state.slot(key) {
            None => KeyTtl::Missing,
            Some(Slot {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(Slot {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(at.saturating_duration_since(Instant::now())),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.injected("expire")?;
        let mut state = self.shared.state.lock();
        match state.slot(key) {
            Some(slot) => {
                slot.expires_at = Some(Instant::now() + ttl);
                state.touch(key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn watch(&self, keys: &[&str]) -> Result<Box<dyn Transaction>> {
        self.injected("watch")?;
        let watched: Vec<(String, u64)> = {
            let mut state = self.shared.state.lock();
            keys.iter()
                .map(|key| {
                    state.purge_if_expired(key);
                    (key.to_string(), state.version(key))
                })
                .collect()
        };

        let hook = self.shared.watch_hook.lock().take();
        if let Some(hook) = hook {
            hook(self.clone()).await;
        }

        Ok(Box::new(MemoryTransaction {
            shared: self.shared.clone(),
            watched,
        }))
    }
}

struct MemoryTransaction {
    shared: Arc<Shared>,
    watched: Vec<(String, u64)>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&mut self, key: &str) -> Result<Option<String>> {
        self.shared.state.lock().string(key)
    }

    async fn zrange_by_score(&mut self, key: &str, min: f64, max: f64) -> Result<Vec<ScoredMember>> {
        self.shared.state.lock().zrange_by_score(key, min, max)
    }

    async fn exec(self: Box<Self>, ops: Vec<WriteOp>) -> Result<()> {
        let mut state = self.shared.state.lock();
        let changed = self
            .watched
            .iter()
            .any(|(key, version)| state.version(key) != *version);
        if changed {
            return Err(StoreError::Conflict);
        }
        for op in ops {
            state.apply(op)?;
        }
        Ok(())
    }

    async fn discard(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
