use crate::{
    config::BrokerConfig,
    metrics::BrokerMetrics,
    queue::{QueueHandler, StoreQueueHandler},
};
use task_queue_core::store::Store;
use task_queue_core::{CancellationToken, QueueError, QueueKeys};

use tokio::time::MissedTickBehavior;

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Timer-driven broker: promotes due delayed tasks and drains the ready set
/// into the distribution log.
pub struct Broker {
    config: Arc<BrokerConfig>,
    queue: Arc<dyn QueueHandler>,
    store: Arc<dyn Store>,
    keys: QueueKeys,
    metrics: Arc<BrokerMetrics>,
}

impl Broker {
    pub fn new(config: BrokerConfig, store: Arc<dyn Store>) -> anyhow::Result<Self> {
        let queue = StoreQueueHandler::new(store.clone(), &config.queue_id).with_lock_timeouts(
            config.scheduler.delayed_lock,
            config.scheduler.ready_lock,
        );
        Self::with_queue_handler(config, store, Arc::new(queue))
    }

    pub fn with_queue_handler(
        config: BrokerConfig,
        store: Arc<dyn Store>,
        queue: Arc<dyn QueueHandler>,
    ) -> anyhow::Result<Self> {
        let metrics = BrokerMetrics::new()?;
        Ok(Broker {
            keys: QueueKeys::new(config.queue_id.as_str()),
            config: Arc::new(config),
            queue,
            store,
            metrics: Arc::new(metrics),
        })
    }

    /// Runs both timers until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut promote = tokio::time::interval(self.config.scheduler.promote_interval());
        promote.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut dispatch = tokio::time::interval(self.config.scheduler.dispatch_interval());
        dispatch.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Broker running for queue {}", self.config.queue_id);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Shutting down broker");
                    break;
                }
                _ = promote.tick() => {
                    self.promote_tick(&cancel).await;
                    self.update_depth().await;
                }
                _ = dispatch.tick() => {
                    self.dispatch_tick(&cancel).await;
                }
            }
        }

        Ok(())
    }

    /// One promotion sweep. Returns how many tasks were promoted.
    pub async fn promote_tick(&self, cancel: &CancellationToken) -> usize {
        match self.queue.move_due_delayed_tasks(Utc::now(), cancel).await {
            Ok(moved) => {
                if moved > 0 {
                    info!("Promoted {} delayed tasks", moved);
                }
                self.metrics.tasks_promoted.inc_by(moved as u64);
                moved
            }
            Err(e) => {
                self.record_failure("promote", &self.keys.delayed, e);
                0
            }
        }
    }

    /// Dispatches ready tasks until the set is empty or the per-tick limit is
    /// reached. Returns how many tasks were dispatched.
    pub async fn dispatch_tick(&self, cancel: &CancellationToken) -> usize {
        let mut dispatched = 0;
        while dispatched < self.config.scheduler.max_dispatch_per_tick {
            match self.queue.execute_top_task(cancel).await {
                Ok(Some(task)) => {
                    debug!("Dispatched task {} (priority {})", task.id, task.priority);
                    dispatched += 1;
                    self.metrics.tasks_dispatched.inc();
                }
                Ok(None) => break,
                Err(e) => {
                    self.record_failure("dispatch", &self.keys.ready, e);
                    break;
                }
            }
        }
        dispatched
    }

    fn record_failure(&self, operation: &str, set: &str, err: QueueError) {
        match err {
            QueueError::Cancelled => debug!("{} cancelled", operation),
            QueueError::AcquisitionTimeout { key } => {
                warn!("Timed out acquiring {}, retrying next tick", key);
                self.metrics.inc_lock_timeout(set);
            }
            e => {
                error!("Failed to {}: {}", operation, e);
                self.metrics.inc_error(operation);
            }
        }
    }

    /// Update queue depth metrics
    async fn update_depth(&self) {
        let depth = async {
            let ready = self.store.zcard(&self.keys.ready).await?;
            let delayed = self.store.zcard(&self.keys.delayed).await?;
            let log = self.store.xlen(&self.keys.log).await?;
            Ok::<_, task_queue_core::store::StoreError>((ready, delayed, log))
        };

        match depth.await {
            Ok((ready, delayed, log)) => self.metrics.update_depth(ready, delayed, log),
            Err(e) => debug!("Failed to read queue depth: {}", e),
        }
    }

    /// Get metrics registry
    pub fn metrics(&self) -> Arc<BrokerMetrics> {
        self.metrics.clone()
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use task_queue_core::store::MemoryStore;
    use task_queue_core::{lock_key, Payload, Task};

    fn broker(store: &MemoryStore, max_dispatch: usize) -> Broker {
        let mut config = BrokerConfig::default();
        config.queue_id = "b".to_string();
        config.scheduler.max_dispatch_per_tick = max_dispatch;
        Broker::new(config, Arc::new(store.clone())).unwrap()
    }

    async fn add_ready(store: &MemoryStore, id: &str, priority: f64) {
        let blob = Task::new(id, priority, Payload::default()).encode().unwrap();
        store.zadd("tpq:queue:b", &blob, priority).await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_tick_respects_limit() {
        let store = MemoryStore::new();
        let broker = broker(&store, 2);
        for i in 0..3 {
            add_ready(&store, &format!("t{}", i), i as f64).await;
        }

        let cancel = CancellationToken::new();
        assert_eq!(broker.dispatch_tick(&cancel).await, 2);
        assert_eq!(broker.dispatch_tick(&cancel).await, 1);
        assert_eq!(broker.dispatch_tick(&cancel).await, 0);
        assert_eq!(broker.metrics().tasks_dispatched.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_timeout_is_counted_not_fatal() {
        let store = MemoryStore::new();
        let broker = broker(&store, 10);
        add_ready(&store, "t", 1.0).await;
        store
            .set_nx(&lock_key("tpq:queue:b"), "other", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(broker.dispatch_tick(&CancellationToken::new()).await, 0);
        assert_eq!(
            broker.metrics().lock_timeouts.with_label_values(&["tpq:queue:b"]).get(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_promotes_and_dispatches_until_cancelled() {
        let store = MemoryStore::new();
        let broker = Arc::new(broker(&store, 100));
        let due = Task::new("later", 1.0, Payload::default())
            .execute_after(Utc::now() - chrono::Duration::milliseconds(1));
        store
            .zadd("tpq:delayed:b", &due.encode().unwrap(), due.delay_score())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let running = {
            let broker = broker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { broker.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(store.zcard("tpq:delayed:b").await.unwrap(), 0);
        assert_eq!(store.zcard("tpq:queue:b").await.unwrap(), 0);
        assert_eq!(store.xlen("tpq:stream:b").await.unwrap(), 1);
        assert_eq!(broker.metrics().tasks_promoted.get(), 1);
    }
}
