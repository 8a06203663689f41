use async_trait::async_trait;
use std::future::Future;
use task_queue_core::Task;

/// Processes one task taken from the distribution log.
///
/// The same task may be delivered more than once, so handlers must be
/// idempotent.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task) -> anyhow::Result<()>;
}

/// [`TaskHandler`] backed by an async closure
pub struct HandlerFn<F> {
    f: F,
}

/// Wraps an async closure as a [`TaskHandler`]
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for HandlerFn<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, task: Task) -> anyhow::Result<()> {
        (self.f)(task).await
    }
}
