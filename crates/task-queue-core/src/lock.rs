//! Cross-process mutual exclusion on top of the backing store.
//!
//! A lock is a plain key holding a random token with an expiry. Acquisition
//! spins on a conditional set; release deletes the key inside a watched
//! transaction, and only if it still holds the caller's token.

use crate::error::{QueueError, Result, StoreContext};
use crate::keys::lock_key;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use task_queue_store::{KeyTtl, Store, WriteOp};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Delay between two acquisition attempts
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Lock on a delayed set, held by a promotion sweep or a delayed push
pub const DELAYED_LOCK_TIMEOUTS: LockTimeouts =
    LockTimeouts::new(Duration::from_secs(3), Duration::from_secs(2));

/// Lock on a ready set, held by a dispatch or an immediate push
pub const READY_LOCK_TIMEOUTS: LockTimeouts =
    LockTimeouts::new(Duration::from_secs(3), Duration::from_millis(200));

/// Token identifying one successful acquisition
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockId(String);

impl LockId {
    pub fn generate() -> Self {
        LockId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Timeouts used when taking a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockTimeouts {
    /// How long to keep trying before giving up
    #[serde(with = "crate::serde_millis")]
    pub acquisition: Duration,
    /// Expiry of the lock record once taken
    #[serde(with = "crate::serde_millis")]
    pub ttl: Duration,
}

impl LockTimeouts {
    pub const fn new(acquisition: Duration, ttl: Duration) -> Self {
        LockTimeouts { acquisition, ttl }
    }
}

#[async_trait]
pub trait LockHandler: Send + Sync {
    /// Takes the lock guarding `key`, retrying until `acquisition_timeout`.
    /// The lock expires on its own after `lock_timeout`.
    async fn acquire_lock(
        &self,
        key: &str,
        acquisition_timeout: Duration,
        lock_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockId>;

    /// Releases the lock guarding `key` if it is still held with `lock_id`.
    /// A lock that already expired counts as released.
    async fn release_lock(
        &self,
        key: &str,
        lock_id: &LockId,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// [`LockHandler`] storing lock records in a [`Store`]
#[derive(Clone)]
pub struct StoreLockHandler {
    store: Arc<dyn Store>,
}

impl StoreLockHandler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        StoreLockHandler { store }
    }

    /// Gives an expiry to a lock record that has none, so a crashed owner
    /// cannot block the key forever.
    async fn repair_expiry(&self, lock_key: &str, lock_timeout: Duration) -> Result<()> {
        let ttl = self
            .store
            .ttl(lock_key)
            .await
            .context(|| format!("reading the expiry of {}", lock_key))?;

        if ttl == KeyTtl::Persistent {
            warn!("Lock {} has no expiry, setting it to {:?}", lock_key, lock_timeout);
            self.store
                .expire(lock_key, lock_timeout)
                .await
                .context(|| format!("setting the expiry of {}", lock_key))?;
        }
        Ok(())
    }
}

#[async_trait]
impl LockHandler for StoreLockHandler {
    async fn acquire_lock(
        &self,
        key: &str,
        acquisition_timeout: Duration,
        lock_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockId> {
        let lock_key = lock_key(key);
        let lock_id = LockId::generate();
        let deadline = Instant::now() + acquisition_timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            let acquired = self
                .store
                .set_nx(&lock_key, lock_id.as_str(), lock_timeout)
                .await
                .context(|| format!("acquiring {}", lock_key))?;
            if acquired {
                debug!("Acquired lock {} ({})", lock_key, lock_id);
                return Ok(lock_id);
            }

            self.repair_expiry(&lock_key, lock_timeout).await?;

            if Instant::now() >= deadline {
                return Err(QueueError::AcquisitionTimeout { key: lock_key });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                _ = tokio::time::sleep(LOCK_RETRY_INTERVAL) => {}
            }
        }
    }

    async fn release_lock(
        &self,
        key: &str,
        lock_id: &LockId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let lock_key = lock_key(key);
        let context = || format!("releasing {}", lock_key);

        loop {
            let mut tx = self.store.watch(&[lock_key.as_str()]).await.context(context)?;
            let current = tx.get(&lock_key).await.context(context)?;

            match current {
                None => {
                    tx.discard().await.context(context)?;
                    debug!("Lock {} already expired", lock_key);
                    return Ok(());
                }
                Some(token) if token != lock_id.as_str() => {
                    tx.discard().await.context(context)?;
                    return Err(QueueError::CorruptedLock { key: lock_key });
                }
                Some(_) => {}
            }

            let delete = vec![WriteOp::Del {
                key: lock_key.clone(),
            }];
            match tx.exec(delete).await {
                Ok(()) => {
                    debug!("Released lock {} ({})", lock_key, lock_id);
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    if cancel.is_cancelled() {
                        return Err(QueueError::Cancelled);
                    }
                    debug!("Lock {} changed during release, retrying", lock_key);
                }
                Err(e) => return Err(e).context(context),
            }
        }
    }
}

/// Runs `operation` while holding the lock guarding `key`.
///
/// The lock is released whatever the outcome. If both the operation and the
/// release fail, the operation's error is returned and the release error is
/// logged.
pub async fn with_lock<L, F, Fut, T>(
    locks: &L,
    key: &str,
    timeouts: LockTimeouts,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T>
where
    L: LockHandler + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let lock_id = locks
        .acquire_lock(key, timeouts.acquisition, timeouts.ttl, cancel)
        .await?;

    let outcome = operation().await;
    let released = locks.release_lock(key, &lock_id, cancel).await;

    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_err)) => {
            warn!("Failed to release lock on {} after error: {}", key, release_err);
            Err(e)
        }
    }
}
