pub mod config;
pub mod handler;
pub mod worker;

pub use config::{HandlerKind, WorkerConfig};
pub use handler::{LogHandler, SleepHandler};
pub use worker::Worker;
