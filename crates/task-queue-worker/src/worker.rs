use crate::config::WorkerConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use task_queue_client::{QueueClient, TaskHandler};
use task_queue_core::store::Store;
use task_queue_core::{CancellationToken, QueueError};
use tracing::{debug, error, info, warn};

/// Worker process that executes tasks
pub struct Worker {
    client: QueueClient,
    handler: Arc<dyn TaskHandler>,
    error_backoff: Duration,
    handled: AtomicU64,
    failed: AtomicU64,
}

impl Worker {
    pub fn new(config: &WorkerConfig, store: Arc<dyn Store>, handler: Arc<dyn TaskHandler>) -> Self {
        let client = QueueClient::new(store, &config.queue_id, config.generate_worker_id())
            .with_config(config.client_config());

        Worker {
            client,
            handler,
            error_backoff: config.error_backoff(),
            handled: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn worker_id(&self) -> &str {
        self.client.consumer()
    }

    /// Tasks handled successfully so far
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Tasks whose handler failed so far
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Takes tasks until `cancel` fires. A cycle in progress finishes its
    /// running handlers before the loop exits.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        info!(
            "Starting worker {} on {}",
            self.worker_id(),
            self.client.keys().log
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.client.take_task(self.handler.clone(), &cancel).await {
                Ok(0) => {}
                Ok(count) => {
                    debug!("Handled {} tasks", count);
                    self.handled.fetch_add(count as u64, Ordering::Relaxed);
                }
                Err(QueueError::Cancelled) => break,
                Err(QueueError::Handlers(failures)) => {
                    warn!("{}", failures);
                    self.failed
                        .fetch_add(failures.len() as u64, Ordering::Relaxed);
                }
                Err(QueueError::DecodeFailure { entry, source })
                    if self.client.config().acknowledge =>
                {
                    error!("Dropping undecodable entry {}: {}", entry, source);
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = self.client.acknowledge(&[entry.as_str()]).await {
                        error!("Worker {} could not drop entry {}: {}", self.worker_id(), entry, e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.error_backoff) => {}
                        }
                    }
                }
                Err(e) => {
                    error!("Worker {} cycle failed: {}", self.worker_id(), e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.error_backoff) => {}
                    }
                }
            }
        }

        info!(
            "Worker {} stopped ({} handled, {} failed)",
            self.worker_id(),
            self.handled(),
            self.failed()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use parking_lot::Mutex;
    use task_queue_client::handler_fn;
    use task_queue_core::store::MemoryStore;
    use task_queue_core::{Payload, QueueKeys, Task, TASK_FIELD};

    fn config() -> WorkerConfig {
        WorkerConfig {
            queue_id: "jobs".to_string(),
            worker_id: Some("worker-1".to_string()),
            ..WorkerConfig::default()
        }
    }

    async fn dispatch(store: &MemoryStore, id: &str) {
        let encoded = Task::new(id, 1.0, Payload::default()).encode().unwrap();
        store
            .xadd(&QueueKeys::new("jobs").log, &[(TASK_FIELD, encoded.as_str())])
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_handles_and_acknowledges() {
        let store = Arc::new(MemoryStore::new());
        dispatch(&store, "a").await;
        dispatch(&store, "b").await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let handler = handler_fn(move |task: Task| {
            let recorder = recorder.clone();
            async move {
                recorder.lock().push(task.id);
                Ok::<_, anyhow::Error>(())
            }
        });

        let worker = Arc::new(Worker::new(&config(), store.clone(), Arc::new(handler)));
        let cancel = CancellationToken::new();
        let running = tokio::spawn({
            let worker = worker.clone();
            let cancel = cancel.clone();
            async move { worker.run(cancel).await }
        });

        while seen.lock().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(*seen.lock(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(worker.handled(), 2);
        let keys = QueueKeys::new("jobs");
        assert!(store.pending_owners(&keys.log, &keys.group).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_failures_are_counted() {
        let store = Arc::new(MemoryStore::new());
        dispatch(&store, "bad").await;

        let handler = handler_fn(|_task: Task| async { Err::<(), _>(anyhow::anyhow!("boom")) });
        let worker = Arc::new(Worker::new(&config(), store.clone(), Arc::new(handler)));
        let cancel = CancellationToken::new();
        let running = tokio::spawn({
            let worker = worker.clone();
            let cancel = cancel.clone();
            async move { worker.run(cancel).await }
        });

        while worker.failed() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(worker.handled(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_entry_does_not_block_later_tasks() {
        let store = Arc::new(MemoryStore::new());
        let keys = QueueKeys::new("jobs");
        store.xgroup_create(&keys.log, &keys.group).await.unwrap();
        store.xadd(&keys.log, &[(TASK_FIELD, "{garbage")]).await.unwrap();
        dispatch(&store, "good").await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let handler = handler_fn(move |task: Task| {
            let recorder = recorder.clone();
            async move {
                recorder.lock().push(task.id);
                Ok::<_, anyhow::Error>(())
            }
        });

        let worker = Arc::new(Worker::new(&config(), store.clone(), Arc::new(handler)));
        let cancel = CancellationToken::new();
        let running = tokio::spawn({
            let worker = worker.clone();
            let cancel = cancel.clone();
            async move { worker.run(cancel).await }
        });

        while seen.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(*seen.lock(), vec!["good".to_string()]);
        assert_eq!(worker.handled(), 1);
        assert_eq!(worker.failed(), 1);
        assert!(store.pending_owners(&keys.log, &keys.group).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_entry_stays_pending_without_acknowledgement() {
        let store = Arc::new(MemoryStore::new());
        let keys = QueueKeys::new("jobs");
        store.xgroup_create(&keys.log, &keys.group).await.unwrap();
        store.xadd(&keys.log, &[(TASK_FIELD, "{garbage")]).await.unwrap();

        let handler = handler_fn(|_task: Task| async { Ok::<_, anyhow::Error>(()) });
        let config = WorkerConfig {
            acknowledge: false,
            ..config()
        };
        let worker = Worker::new(&config, store.clone(), Arc::new(handler));
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            stopper.cancel();
        });
        worker.run(cancel).await.unwrap();

        assert_eq!(worker.failed(), 0);
        assert_eq!(store.pending_owners(&keys.log, &keys.group).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_errors_back_off_until_cancelled() {
        let store = Arc::new(MemoryStore::new());
        // the log key holds a plain string, so every cycle fails
        store.set(&QueueKeys::new("jobs").log, "not a stream");

        let handler = handler_fn(|_task: Task| async { Ok::<_, anyhow::Error>(()) });
        let worker = Worker::new(&config(), store, Arc::new(handler));
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3500)).await;
            stopper.cancel();
        });

        let started = tokio::time::Instant::now();
        worker.run(cancel).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(3500));
        assert_eq!(worker.handled(), 0);
    }
}
