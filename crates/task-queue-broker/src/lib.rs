pub mod broker;
pub mod config;
pub mod metrics;
pub mod queue;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use queue::{QueueHandler, StoreQueueHandler};
