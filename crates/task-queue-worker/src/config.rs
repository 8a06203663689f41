use serde::{Deserialize, Serialize};
use std::time::Duration;
use task_queue_client::ClientConfig;
use task_queue_core::store::StoreConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    Log,
    Sleep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub queue_id: String,
    pub worker_id: Option<String>,
    pub store: StoreConfig,
    pub client: ClientConfig,
    /// Acknowledge handled entries. Overrides `client.acknowledge`.
    pub acknowledge: bool,
    pub handler: HandlerKind,
    /// Simulated work per task for the sleep handler
    pub sleep_ms: u64,
    /// Pause after a failed unit of work before trying again
    pub error_backoff_ms: u64,
    pub graceful_shutdown_timeout_secs: u64,
    pub log_level: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            queue_id: "default".to_string(),
            worker_id: None,
            store: StoreConfig::default(),
            client: ClientConfig::default(),
            acknowledge: true,
            handler: HandlerKind::Log,
            sleep_ms: 100,
            error_backoff_ms: 1000,
            graceful_shutdown_timeout_secs: 60,
            log_level: "info".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        let config: WorkerConfig = serde_yaml::from_str(contents)?;
        Ok(config)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            acknowledge: self.acknowledge,
            ..self.client.clone()
        }
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }

    /// Consumer name inside the group. Must be stable for one process and
    /// distinct across processes.
    pub fn generate_worker_id(&self) -> String {
        use std::process;
        use uuid::Uuid;

        if let Some(id) = &self.worker_id {
            return id.clone();
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let pid = process::id();
        let uuid = Uuid::new_v4().simple().to_string();

        format!("{}-{}-{}", hostname, pid, &uuid[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_acknowledge() {
        let config = WorkerConfig::default();
        assert!(config.client_config().acknowledge);
        assert_eq!(config.handler, HandlerKind::Log);
        assert_eq!(config.error_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn test_yaml_overrides() {
        let config = WorkerConfig::from_yaml(
            "queue_id: emails\nhandler: sleep\nsleep_ms: 20\nclient:\n  claim_min_idle: 60000\n",
        )
        .unwrap();

        assert_eq!(config.queue_id, "emails");
        assert_eq!(config.handler, HandlerKind::Sleep);
        assert_eq!(config.sleep_ms, 20);
        assert_eq!(config.client.claim_min_idle, Duration::from_secs(60));
        assert!(config.client_config().acknowledge);

        let config = WorkerConfig::from_yaml("acknowledge: false\n").unwrap();
        assert!(!config.client_config().acknowledge);
    }

    #[test]
    fn test_worker_id() {
        let named = WorkerConfig {
            worker_id: Some("worker-a".to_string()),
            ..WorkerConfig::default()
        };
        assert_eq!(named.generate_worker_id(), "worker-a");

        let config = WorkerConfig::default();
        let first = config.generate_worker_id();
        let second = config.generate_worker_id();
        assert_ne!(first, second);
        assert!(first.contains(&std::process::id().to_string()));
    }
}
