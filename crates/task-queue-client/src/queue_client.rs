use crate::{ClientConfig, TaskHandler};
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use task_queue_core::store::{LogEntry, Store};
use task_queue_core::{
    with_lock, CancellationToken, HandlerFailure, HandlerFailures, LockHandler, QueueError,
    QueueKeys, Result, StoreContext, StoreLockHandler, Task, START_CURSOR, TASK_FIELD,
};
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Producer and consumer handle on one queue.
///
/// Each client consumes under its own consumer name; two live clients must
/// not share one.
pub struct QueueClient {
    store: Arc<dyn Store>,
    locks: Arc<dyn LockHandler>,
    keys: QueueKeys,
    consumer: String,
    config: ClientConfig,
    group_ready: OnceCell<()>,
}

impl QueueClient {
    pub fn new(store: Arc<dyn Store>, queue_id: &str, consumer: impl Into<String>) -> Self {
        QueueClient {
            locks: Arc::new(StoreLockHandler::new(store.clone())),
            store,
            keys: QueueKeys::new(queue_id),
            consumer: consumer.into(),
            config: ClientConfig::default(),
            group_ready: OnceCell::new(),
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Adds a task to the queue.
    ///
    /// A task whose `execute_after` lies in the future goes to the delayed
    /// set; any other task goes straight to the ready set.
    pub async fn push_task(&self, task: &Task, cancel: &CancellationToken) -> Result<()> {
        let blob = task.encode().map_err(|source| QueueError::EncodeFailure {
            id: task.id.clone(),
            source,
        })?;

        let (key, score, timeouts) = if task.execute_after > Utc::now() {
            (&self.keys.delayed, task.delay_score(), self.config.delayed_lock)
        } else {
            (&self.keys.ready, task.priority, self.config.ready_lock)
        };

        with_lock(self.locks.as_ref(), key, timeouts, cancel, || async {
            self.store
                .zadd(key, &blob, score)
                .await
                .context(|| format!("pushing task {} to {}", task.id, key))
        })
        .await?;

        debug!("Pushed task {} to {}", task.id, key);
        Ok(())
    }

    /// Takes over up to one batch of log entries idle for at least
    /// `min_idle`, scanning from `cursor`. Returns the cursor to continue
    /// from, or [`START_CURSOR`] once the scan is complete.
    ///
    /// Claimed entries join this consumer's backlog and are handled by
    /// [`take_pending_tasks`](Self::take_pending_tasks).
    pub async fn claim_dangling_tasks(
        &self,
        min_idle: Duration,
        cursor: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        self.ensure_group().await?;

        let claim = self
            .store
            .xautoclaim(
                &self.keys.log,
                &self.keys.group,
                &self.consumer,
                min_idle,
                cursor,
                self.config.claim_batch,
            )
            .await
            .context(|| format!("claiming idle entries of {}", self.keys.log))?;

        if !claim.claimed.is_empty() {
            info!(
                "Consumer {} reclaimed {} idle entries",
                self.consumer,
                claim.claimed.len()
            );
        }
        Ok(claim.next)
    }

    /// Handles every entry currently owned by this consumer
    pub async fn take_pending_tasks(
        &self,
        handler: Arc<dyn TaskHandler>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        if cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        self.ensure_group().await?;

        let entries = self
            .store
            .xread_group_pending(&self.keys.log, &self.keys.group, &self.consumer)
            .await
            .context(|| format!("reading the backlog of {}", self.consumer))?;

        self.take_tasks(entries, handler).await
    }

    /// Takes up to `count` entries never delivered to any consumer and
    /// handles them. Waits up to the configured `new_task_wait` when none is
    /// available; an empty read handles nothing and succeeds.
    pub async fn take_new_tasks(
        &self,
        count: usize,
        handler: Arc<dyn TaskHandler>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        self.ensure_group().await?;

        let read = self.store.xread_group_new(
            &self.keys.log,
            &self.keys.group,
            &self.consumer,
            count,
            self.config.new_task_wait,
        );
        let entries = tokio::select! {
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            read = read => read.context(|| format!("reading new entries of {}", self.keys.log))?,
        };

        self.take_tasks(entries, handler).await
    }

    /// One unit of work: reclaims every long-idle entry, finishes this
    /// consumer's backlog, then takes a single new task.
    pub async fn take_task(
        &self,
        handler: Arc<dyn TaskHandler>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut cursor = START_CURSOR.to_string();
        loop {
            cursor = self
                .claim_dangling_tasks(self.config.claim_min_idle, &cursor, cancel)
                .await?;
            if cursor == START_CURSOR {
                break;
            }
        }

        let pending = self.take_pending_tasks(handler.clone(), cancel).await?;
        let new = self.take_new_tasks(1, handler, cancel).await?;
        Ok(pending + new)
    }

    /// Acknowledges log entries by id so they leave their owner's backlog.
    /// Returns how many were pending.
    pub async fn acknowledge(&self, entries: &[&str]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        self.ensure_group().await?;
        self.store
            .xack(&self.keys.log, &self.keys.group, entries)
            .await
            .context(|| format!("acknowledging entries of {}", self.keys.log))
    }

    async fn ensure_group(&self) -> Result<()> {
        self.group_ready
            .get_or_try_init(|| async {
                let created = self
                    .store
                    .xgroup_create(&self.keys.log, &self.keys.group)
                    .await
                    .context(|| format!("creating consumer group {}", self.keys.group))?;
                if created {
                    info!("Created consumer group {}", self.keys.group);
                }
                Ok::<_, QueueError>(())
            })
            .await?;
        Ok(())
    }

    /// Decodes `entries` in order and runs the handler for each one
    /// concurrently. The first undecodable entry stops dispatch: handlers
    /// already started are awaited, then the decode failure is returned.
    async fn take_tasks(
        &self,
        entries: Vec<LogEntry>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<usize> {
        let mut running = JoinSet::new();
        let mut decode_failure = None;

        for entry in entries {
            let task = match decode_entry(&entry) {
                Ok(task) => task,
                Err(e) => {
                    decode_failure = Some(e);
                    break;
                }
            };

            let handler = handler.clone();
            running.spawn(async move {
                let task_id = task.id.clone();
                let outcome = AssertUnwindSafe(handler.handle(task)).catch_unwind().await;
                (entry.id, task_id, outcome)
            });
        }

        let mut handled = Vec::new();
        let mut failures = HandlerFailures::default();
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((entry, _, Ok(Ok(())))) => handled.push(entry),
                Ok((entry, task_id, Ok(Err(e)))) => failures.push(HandlerFailure {
                    entry,
                    task_id,
                    message: format!("{:#}", e),
                }),
                Ok((entry, task_id, Err(panic))) => failures.push(HandlerFailure {
                    entry,
                    task_id,
                    message: format!("handler panicked: {}", panic_message(panic.as_ref())),
                }),
                Err(e) => failures.push(HandlerFailure {
                    entry: String::new(),
                    task_id: String::new(),
                    message: e.to_string(),
                }),
            }
        }

        let acked = if self.config.acknowledge {
            let ids: Vec<&str> = handled.iter().map(String::as_str).collect();
            self.acknowledge(&ids).await
        } else {
            Ok(0)
        };

        // A decode or handler failure outranks a failed acknowledgement
        if let Some(e) = decode_failure {
            if let Err(ack_err) = acked {
                warn!("Consumer {}: {}", self.consumer, ack_err);
            }
            return Err(e);
        }
        if !failures.is_empty() {
            if let Err(ack_err) = acked {
                warn!("Consumer {}: {}", self.consumer, ack_err);
            }
            warn!("Consumer {}: {}", self.consumer, failures);
            return Err(QueueError::Handlers(failures));
        }
        acked?;
        Ok(handled.len())
    }
}

fn decode_entry(entry: &LogEntry) -> Result<Task> {
    let blob = entry.field(TASK_FIELD).ok_or_else(|| {
        QueueError::decode(
            entry.id.clone(),
            serde::de::Error::custom(format!("missing `{}` field", TASK_FIELD)),
        )
    })?;
    Task::decode(blob).map_err(|e| QueueError::decode(entry.id.clone(), e))
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler_fn;
    use parking_lot::Mutex;
    use task_queue_core::store::MemoryStore;
    use task_queue_core::{lock_key, LockTimeouts, Payload};

    const LOG: &str = "tpq:stream:q";
    const GROUP: &str = "tpq:group:q";

    fn client(store: &MemoryStore, consumer: &str) -> QueueClient {
        QueueClient::new(Arc::new(store.clone()), "q", consumer)
    }

    /// Handler recording the ids of the tasks it saw
    fn recorder() -> (Arc<Mutex<Vec<String>>>, Arc<dyn TaskHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = handler_fn(move |task: Task| {
            let sink = sink.clone();
            async move {
                sink.lock().push(task.id);
                Ok::<_, anyhow::Error>(())
            }
        });
        (seen, Arc::new(handler))
    }

    async fn dispatch(store: &MemoryStore, id: &str) -> String {
        let blob = Task::new(id, 1.0, Payload::default()).encode().unwrap();
        store.xadd(LOG, &[(TASK_FIELD, blob.as_str())]).await.unwrap()
    }

    fn sorted(seen: &Mutex<Vec<String>>) -> Vec<String> {
        let mut ids = seen.lock().clone();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_push_due_task_goes_to_ready_set() {
        let store = MemoryStore::new();
        let client = client(&store, "w");
        let task = Task::new("now", 4.0, Payload::default());

        client.push_task(&task, &CancellationToken::new()).await.unwrap();

        let ready = store.zrange("tpq:queue:q", 0, -1).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].score, 4.0);
        assert_eq!(Task::decode(&ready[0].member).unwrap(), task);
        assert_eq!(store.zcard("tpq:delayed:q").await.unwrap(), 0);
        assert_eq!(store.get(&lock_key("tpq:queue:q")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_push_future_task_goes_to_delayed_set_only() {
        let store = MemoryStore::new();
        let client = client(&store, "w");
        let at = Utc::now() + chrono::Duration::minutes(5);
        let task = Task::new("later", 1.0, Payload::default()).execute_after(at);

        client.push_task(&task, &CancellationToken::new()).await.unwrap();

        let delayed = store.zrange("tpq:delayed:q", 0, -1).await.unwrap();
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].score, task.delay_score());
        assert_eq!(store.zcard("tpq:queue:q").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_waits_for_the_set_lock() {
        let store = MemoryStore::new();
        let client = client(&store, "w").with_config(ClientConfig {
            ready_lock: LockTimeouts::new(Duration::from_millis(50), Duration::from_millis(200)),
            ..ClientConfig::default()
        });
        store
            .set_nx(&lock_key("tpq:queue:q"), "broker", Duration::from_secs(10))
            .await
            .unwrap();

        let err = client
            .push_task(&Task::new("t", 1.0, Payload::default()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_acquisition_timeout());
        assert_eq!(store.zcard("tpq:queue:q").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_read_is_success() {
        let store = MemoryStore::new();
        let client = client(&store, "w");
        let (seen, handler) = recorder();

        let handled = client
            .take_new_tasks(10, handler, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(handled, 0);
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_new_tasks_are_handled_once() {
        let store = MemoryStore::new();
        let client = client(&store, "w");
        let (seen, handler) = recorder();
        dispatch(&store, "a").await;
        dispatch(&store, "b").await;
        dispatch(&store, "c").await;
        let cancel = CancellationToken::new();

        let handled = client.take_new_tasks(2, handler.clone(), &cancel).await.unwrap();
        assert_eq!(handled, 2);
        let handled = client.take_new_tasks(2, handler, &cancel).await.unwrap();
        assert_eq!(handled, 1);

        assert_eq!(sorted(&seen), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_decode_failure_stops_the_batch() {
        let store = MemoryStore::new();
        let client = client(&store, "w");
        let (seen, handler) = recorder();
        client.ensure_group().await.unwrap();
        dispatch(&store, "first").await;
        let corrupted = store.xadd(LOG, &[(TASK_FIELD, "{not a task")]).await.unwrap();
        dispatch(&store, "third").await;

        let err = client
            .take_new_tasks(3, handler, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::DecodeFailure { ref entry, .. } if entry == &corrupted));
        assert_eq!(*seen.lock(), vec!["first".to_string()]);
    }

    #[tokio::test]
    async fn test_decode_failure_outranks_acknowledgement_failure() {
        let store = MemoryStore::new();
        let client = client(&store, "w").with_config(ClientConfig {
            acknowledge: true,
            ..ClientConfig::default()
        });
        let (seen, handler) = recorder();
        client.ensure_group().await.unwrap();
        dispatch(&store, "good").await;
        let corrupted = store.xadd(LOG, &[(TASK_FIELD, "{garbage")]).await.unwrap();
        store.fail_next("xack");

        let err = client
            .take_new_tasks(2, handler, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::DecodeFailure { ref entry, .. } if entry == &corrupted));
        assert_eq!(*seen.lock(), vec!["good".to_string()]);
        assert_eq!(store.pending_owners(LOG, GROUP).len(), 2);
    }

    #[tokio::test]
    async fn test_acknowledgement_failure_alone_is_returned() {
        let store = MemoryStore::new();
        let client = client(&store, "w").with_config(ClientConfig {
            acknowledge: true,
            ..ClientConfig::default()
        });
        let (_seen, handler) = recorder();
        dispatch(&store, "good").await;
        store.fail_next("xack");

        let err = client
            .take_new_tasks(1, handler, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Store { .. }));
    }

    #[tokio::test]
    async fn test_acknowledge_removes_entry_from_backlog() {
        let store = MemoryStore::new();
        let client = client(&store, "w");
        let (seen, handler) = recorder();
        client.ensure_group().await.unwrap();
        let corrupted = store.xadd(LOG, &[(TASK_FIELD, "{garbage")]).await.unwrap();
        dispatch(&store, "good").await;
        let cancel = CancellationToken::new();

        let err = client.take_new_tasks(2, handler.clone(), &cancel).await.unwrap_err();
        assert!(matches!(err, QueueError::DecodeFailure { .. }));

        assert_eq!(client.acknowledge(&[corrupted.as_str()]).await.unwrap(), 1);
        assert_eq!(client.acknowledge(&[]).await.unwrap(), 0);
        assert_eq!(client.take_pending_tasks(handler, &cancel).await.unwrap(), 1);
        assert_eq!(*seen.lock(), vec!["good".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_task_field_is_a_decode_failure() {
        let store = MemoryStore::new();
        let client = client(&store, "w");
        let (_seen, handler) = recorder();
        client.ensure_group().await.unwrap();
        store.xadd(LOG, &[("other", "x")]).await.unwrap();

        let err = client
            .take_new_tasks(1, handler, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::DecodeFailure { .. }));
    }

    #[tokio::test]
    async fn test_handler_failures_are_collected() {
        let store = MemoryStore::new();
        let client = client(&store, "w");
        dispatch(&store, "ok").await;
        dispatch(&store, "fails").await;
        dispatch(&store, "panics").await;

        let handler = Arc::new(handler_fn(|task: Task| async move {
            match task.id.as_str() {
                "fails" => anyhow::bail!("refused"),
                "panics" => panic!("handler blew up"),
                _ => Ok(()),
            }
        }));

        let err = client
            .take_new_tasks(3, handler, &CancellationToken::new())
            .await
            .unwrap_err();

        let failures = match err {
            QueueError::Handlers(failures) => failures,
            other => panic!("expected handler failures, got {:?}", other),
        };
        let mut messages: Vec<(String, String)> = failures
            .iter()
            .map(|f| (f.task_id.clone(), f.message.clone()))
            .collect();
        messages.sort();
        assert_eq!(
            messages,
            vec![
                ("fails".to_string(), "refused".to_string()),
                ("panics".to_string(), "handler panicked: handler blew up".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_leaves_fresh_entries_alone() {
        let store = MemoryStore::new();
        let owner = client(&store, "owner");
        let rescuer = client(&store, "rescuer");
        let (_seen, handler) = recorder();
        dispatch(&store, "a").await;
        owner
            .take_new_tasks(1, handler, &CancellationToken::new())
            .await
            .unwrap();

        let cursor = rescuer
            .claim_dangling_tasks(Duration::from_secs(60), START_CURSOR, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(cursor, START_CURSOR);
        let owners: Vec<String> = store
            .pending_owners(LOG, GROUP)
            .into_iter()
            .map(|(_, consumer)| consumer)
            .collect();
        assert_eq!(owners, vec!["owner"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_task_recovers_abandoned_entries() {
        let store = MemoryStore::new();
        let crashed = client(&store, "crashed");
        let config = ClientConfig {
            claim_min_idle: Duration::from_secs(30),
            claim_batch: 1,
            ..ClientConfig::default()
        };
        let rescuer = client(&store, "rescuer").with_config(config);
        let cancel = CancellationToken::new();

        // Delivered to a consumer that never handles them
        crashed.ensure_group().await.unwrap();
        dispatch(&store, "lost-1").await;
        dispatch(&store, "lost-2").await;
        store
            .xread_group_new(LOG, GROUP, "crashed", 0, Duration::ZERO)
            .await
            .unwrap();
        dispatch(&store, "fresh").await;

        tokio::time::advance(Duration::from_secs(31)).await;

        let (seen, handler) = recorder();
        let handled = rescuer.take_task(handler, &cancel).await.unwrap();

        assert_eq!(handled, 3);
        assert_eq!(sorted(&seen), vec!["fresh", "lost-1", "lost-2"]);
        let owners: Vec<String> = store
            .pending_owners(LOG, GROUP)
            .into_iter()
            .map(|(_, consumer)| consumer)
            .collect();
        assert_eq!(owners, vec!["rescuer", "rescuer", "rescuer"]);
    }

    #[tokio::test]
    async fn test_acknowledged_entries_are_not_redelivered() {
        let store = MemoryStore::new();
        let client = client(&store, "w").with_config(ClientConfig {
            acknowledge: true,
            new_task_wait: Duration::ZERO,
            ..ClientConfig::default()
        });
        let (seen, handler) = recorder();
        let cancel = CancellationToken::new();
        dispatch(&store, "once").await;

        assert_eq!(client.take_task(handler.clone(), &cancel).await.unwrap(), 1);
        assert_eq!(client.take_task(handler, &cancel).await.unwrap(), 0);
        assert_eq!(*seen.lock(), vec!["once".to_string()]);
        assert!(store.pending_owners(LOG, GROUP).is_empty());
    }

    #[tokio::test]
    async fn test_unacknowledged_backlog_is_handled_again() {
        let store = MemoryStore::new();
        let client = client(&store, "w").with_config(ClientConfig {
            new_task_wait: Duration::ZERO,
            ..ClientConfig::default()
        });
        let (seen, handler) = recorder();
        let cancel = CancellationToken::new();
        dispatch(&store, "again").await;

        client.take_task(handler.clone(), &cancel).await.unwrap();
        client.take_task(handler, &cancel).await.unwrap();

        assert_eq!(*seen.lock(), vec!["again".to_string(), "again".to_string()]);
    }

    #[tokio::test]
    async fn test_cancelled_claim_loop() {
        let store = MemoryStore::new();
        let client = client(&store, "w");
        let (_seen, handler) = recorder();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client.take_task(handler, &cancel).await.unwrap_err();
        assert!(matches!(err, QueueError::Cancelled));
    }
}
