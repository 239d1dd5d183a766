//! Events emitted by TaskHub workers.
//!
//! Events are broadcast to any number of listeners (logging, metrics,
//! dashboards) and are never required for correct operation.

pub mod worker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use worker::WorkerEvent;

/// Wrapper for worker events with metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Unique event ID.
    pub id: Uuid,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// The event payload.
    pub payload: WorkerEvent,
}

impl DomainEvent {
    /// Create a new domain event.
    pub fn new(payload: WorkerEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}
