//! # taskhub-broker
//!
//! Store-backed broker implementations for TaskHub. The broker logic lives in
//! [`StoreBroker`] and runs against any [`QueueStore`]:
//!
//! - **redis**: Redis lists, a hash, and a sorted set via the
//!   [redis](https://crates.io/crates/redis) crate
//! - **memory**: an in-process store for tests and single-node use
//!
//! The store is selected at runtime based on configuration.
//!
//! [`QueueStore`]: taskhub_core::traits::QueueStore

pub mod keys;
#[cfg(feature = "memory")]
pub mod memory;
pub mod provider;
#[cfg(feature = "redis-backend")]
pub mod redis;
pub mod store_broker;
pub mod subscription;
pub mod sweep;

pub use provider::BrokerManager;
pub use store_broker::{BrokerStats, StoreBroker};
pub use sweep::SweepReport;

/// Current wall-clock time as a sorted-set score (seconds since the epoch).
pub(crate) fn now_score() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
