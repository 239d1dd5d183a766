//! Core traits defined in `taskhub-core` and implemented by other crates.

pub mod broker;
pub mod queue_store;

pub use broker::{Broker, JobStream};
pub use queue_store::{QueueConsumer, QueueStore};
