//! Broker-side queue operations: promoting due delayed tasks into the ready
//! set and dispatching the top ready task into the distribution log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use task_queue_core::store::{Store, WriteOp};
use task_queue_core::{
    with_lock, CancellationToken, LockHandler, LockTimeouts, QueueError, QueueKeys, Result,
    StoreContext, StoreLockHandler, Task, DELAYED_LOCK_TIMEOUTS, READY_LOCK_TIMEOUTS, TASK_FIELD,
};
use tracing::debug;

#[async_trait]
pub trait QueueHandler: Send + Sync {
    /// Moves every delayed task due at or before `due_before` into the ready
    /// set. Returns how many were moved.
    async fn move_due_delayed_tasks(
        &self,
        due_before: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<usize>;

    /// Appends the lowest-priority-value ready task to the distribution log
    /// and removes it from the ready set. Returns `None` if the set is empty.
    async fn execute_top_task(&self, cancel: &CancellationToken) -> Result<Option<Task>>;
}

/// [`QueueHandler`] working directly against the backing store
pub struct StoreQueueHandler {
    store: Arc<dyn Store>,
    locks: Arc<dyn LockHandler>,
    keys: QueueKeys,
    delayed_lock: LockTimeouts,
    ready_lock: LockTimeouts,
}

impl StoreQueueHandler {
    pub fn new(store: Arc<dyn Store>, queue_id: &str) -> Self {
        StoreQueueHandler {
            locks: Arc::new(StoreLockHandler::new(store.clone())),
            store,
            keys: QueueKeys::new(queue_id),
            delayed_lock: DELAYED_LOCK_TIMEOUTS,
            ready_lock: READY_LOCK_TIMEOUTS,
        }
    }

    pub fn with_lock_timeouts(mut self, delayed: LockTimeouts, ready: LockTimeouts) -> Self {
        self.delayed_lock = delayed;
        self.ready_lock = ready;
        self
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    async fn promote(&self, due_before: DateTime<Utc>, cancel: &CancellationToken) -> Result<usize> {
        let delayed = self.keys.delayed.as_str();
        let max_score = due_before.timestamp_millis() as f64;
        let context = || format!("promoting due tasks from {}", delayed);

        loop {
            let mut tx = self.store.watch(&[delayed]).await.context(context)?;
            let due = tx
                .zrange_by_score(delayed, f64::NEG_INFINITY, max_score)
                .await
                .context(context)?;

            if due.is_empty() {
                tx.discard().await.context(context)?;
                return Ok(0);
            }

            let mut ops = Vec::with_capacity(due.len() * 2);
            for entry in &due {
                let task = match Task::decode(&entry.member) {
                    Ok(task) => task,
                    Err(e) => {
                        tx.discard().await.context(context)?;
                        return Err(QueueError::decode(entry.member.clone(), e));
                    }
                };
                ops.push(WriteOp::ZAdd {
                    key: self.keys.ready.clone(),
                    member: entry.member.clone(),
                    score: task.priority,
                });
                ops.push(WriteOp::ZRem {
                    key: self.keys.delayed.clone(),
                    member: entry.member.clone(),
                });
            }

            match tx.exec(ops).await {
                Ok(()) => {
                    debug!("Promoted {} due tasks into {}", due.len(), self.keys.ready);
                    return Ok(due.len());
                }
                Err(e) if e.is_conflict() => {
                    if cancel.is_cancelled() {
                        return Err(QueueError::Cancelled);
                    }
                    debug!("Delayed set changed during promotion, retrying");
                }
                Err(e) => return Err(e).context(context),
            }
        }
    }

    async fn dispatch_top(&self) -> Result<Option<Task>> {
        let ready = self.keys.ready.as_str();
        let top = self
            .store
            .zrange(ready, 0, 0)
            .await
            .context(|| format!("reading the top of {}", ready))?;

        let Some(top) = top.into_iter().next() else {
            return Ok(None);
        };

        let entry_id = self
            .store
            .xadd(&self.keys.log, &[(TASK_FIELD, top.member.as_str())])
            .await
            .context(|| format!("appending to {}", self.keys.log))?;
        self.store
            .zrem(ready, &top.member)
            .await
            .context(|| format!("removing a dispatched task from {}", ready))?;

        // Already moved, so a malformed blob cannot wedge the ready set
        let task = Task::decode(&top.member).map_err(|e| QueueError::decode(entry_id.clone(), e))?;
        debug!("Dispatched task {} as entry {}", task.id, entry_id);
        Ok(Some(task))
    }
}

#[async_trait]
impl QueueHandler for StoreQueueHandler {
    async fn move_due_delayed_tasks(
        &self,
        due_before: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        with_lock(
            self.locks.as_ref(),
            &self.keys.delayed,
            self.delayed_lock,
            cancel,
            || self.promote(due_before, cancel),
        )
        .await
    }

    async fn execute_top_task(&self, cancel: &CancellationToken) -> Result<Option<Task>> {
        with_lock(
            self.locks.as_ref(),
            &self.keys.ready,
            self.ready_lock,
            cancel,
            || self.dispatch_top(),
        )
        .await
    }
}
