use serde::{Deserialize, Serialize};
use std::time::Duration;
use task_queue_core::store::StoreConfig;
use task_queue_core::{LockTimeouts, DELAYED_LOCK_TIMEOUTS, READY_LOCK_TIMEOUTS};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub queue_id: String,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often due delayed tasks are promoted
    pub promote_interval_ms: u64,
    /// How often the ready set is drained into the log
    pub dispatch_interval_ms: u64,
    /// Upper bound on dispatches per tick
    pub max_dispatch_per_tick: usize,
    pub delayed_lock: LockTimeouts,
    pub ready_lock: LockTimeouts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub prometheus_port: u16,
    pub log_level: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            queue_id: "default".to_string(),
            store: StoreConfig::default(),
            scheduler: SchedulerConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            promote_interval_ms: 1000,
            dispatch_interval_ms: 100,
            max_dispatch_per_tick: 1000,
            delayed_lock: DELAYED_LOCK_TIMEOUTS,
            ready_lock: READY_LOCK_TIMEOUTS,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            prometheus_port: 9091,
            log_level: "info".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn promote_interval(&self) -> Duration {
        Duration::from_millis(self.promote_interval_ms.max(1))
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms.max(1))
    }
}

impl BrokerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        let config: BrokerConfig = serde_yaml::from_str(contents)?;
        Ok(config)
    }
}
