//! In-process queue store.

pub mod store;

pub use store::MemoryQueueStore;
