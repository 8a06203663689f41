use async_trait::async_trait;
use std::time::Duration;
use task_queue_client::TaskHandler;
use task_queue_core::Task;
use tracing::info;

/// Handler that logs every task it receives
pub struct LogHandler;

#[async_trait]
impl TaskHandler for LogHandler {
    async fn handle(&self, task: Task) -> anyhow::Result<()> {
        info!(
            "Task {} (priority {}, scheduled {}): {}",
            task.id, task.priority, task.scheduled, task.data
        );
        Ok(())
    }
}

/// Example task handler that simulates work
pub struct SleepHandler {
    duration: Duration,
}

impl SleepHandler {
    pub fn new(duration: Duration) -> Self {
        SleepHandler { duration }
    }
}

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn handle(&self, task: Task) -> anyhow::Result<()> {
        tokio::time::sleep(self.duration).await;
        info!("Task {} done after {:?}", task.id, self.duration);
        Ok(())
    }
}
