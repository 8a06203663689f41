//! Shared types of the priority task queue: the task record, key layout,
//! error type and the distributed lock used by brokers and producers.

mod error;
pub mod keys;
pub mod lock;
pub mod serde_millis;
mod task;

pub use error::{HandlerFailure, HandlerFailures, QueueError, Result, StoreContext};
pub use keys::{lock_key, QueueKeys, START_CURSOR, TASK_FIELD};
pub use lock::{
    with_lock, LockHandler, LockId, LockTimeouts, StoreLockHandler, DELAYED_LOCK_TIMEOUTS,
    READY_LOCK_TIMEOUTS,
};
pub use task::{Payload, Task};

pub use task_queue_store as store;
pub use tokio_util::sync::CancellationToken;
