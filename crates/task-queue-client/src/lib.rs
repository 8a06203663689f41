//! Producer and worker side of the priority task queue.
//!
//! [`QueueClient::push_task`] places tasks in the ready or delayed set.
//! Workers consume the distribution log in three phases: reclaim entries
//! abandoned by crashed workers, finish their own backlog, then take new
//! entries. [`QueueClient::take_task`] runs one full cycle.

mod config;
mod handler;
mod queue_client;

pub use config::ClientConfig;
pub use handler::{handler_fn, HandlerFn, TaskHandler};
pub use queue_client::QueueClient;
