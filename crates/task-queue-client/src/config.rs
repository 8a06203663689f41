use serde::{Deserialize, Serialize};
use std::time::Duration;
use task_queue_core::{LockTimeouts, DELAYED_LOCK_TIMEOUTS, READY_LOCK_TIMEOUTS};

/// Tuning of a [`QueueClient`](crate::QueueClient)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Entries idle longer than this are taken over from their owner
    #[serde(with = "task_queue_core::serde_millis")]
    pub claim_min_idle: Duration,
    /// Entries reassigned per claim round-trip
    pub claim_batch: usize,
    /// How long a read for new entries waits when none is available
    #[serde(with = "task_queue_core::serde_millis")]
    pub new_task_wait: Duration,
    /// Remove successfully handled entries from the pending list. When off,
    /// handled entries stay pending and are delivered again on the next
    /// backlog pass.
    pub acknowledge: bool,
    pub delayed_lock: LockTimeouts,
    pub ready_lock: LockTimeouts,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            claim_min_idle: Duration::from_secs(3600),
            claim_batch: 100,
            new_task_wait: Duration::from_secs(1),
            acknowledge: false,
            delayed_lock: DELAYED_LOCK_TIMEOUTS,
            ready_lock: READY_LOCK_TIMEOUTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.claim_min_idle, Duration::from_secs(3600));
        assert_eq!(config.new_task_wait, Duration::from_secs(1));
        assert!(!config.acknowledge);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"claim_min_idle": 30000, "acknowledge": true}"#).unwrap();
        assert_eq!(config.claim_min_idle, Duration::from_secs(30));
        assert!(config.acknowledge);
        assert_eq!(config.claim_batch, 100);
    }
}
