//! Key layout shared by every process attached to a queue.

/// Cursor that starts an idle-entry scan and marks its completion
pub const START_CURSOR: &str = "0-0";

/// Log entry field holding the encoded task
pub const TASK_FIELD: &str = "task";

/// Store keys of one named queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub queue_id: String,
    /// Ordered set of due tasks scored by priority
    pub ready: String,
    /// Ordered set of future tasks scored by due time in milliseconds
    pub delayed: String,
    /// Distribution log read by workers
    pub log: String,
    /// Consumer group of the distribution log
    pub group: String,
}

impl QueueKeys {
    pub fn new(queue_id: impl Into<String>) -> Self {
        let queue_id = queue_id.into();
        QueueKeys {
            ready: format!("tpq:queue:{}", queue_id),
            delayed: format!("tpq:delayed:{}", queue_id),
            log: format!("tpq:stream:{}", queue_id),
            group: format!("tpq:group:{}", queue_id),
            queue_id,
        }
    }
}

/// Key of the lock record guarding `key`
pub fn lock_key(key: &str) -> String {
    format!("tpq:lock:{}", key)
}
