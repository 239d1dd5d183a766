//! Broker manager that dispatches to the configured store.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use taskhub_core::config::BrokerConfig;
use taskhub_core::error::AppError;
use taskhub_core::result::AppResult;
use taskhub_core::traits::broker::{Broker, JobStream};
use taskhub_core::types::Job;

/// Broker manager that wraps the configured broker.
///
/// The store is selected at construction time based on configuration.
#[derive(Debug, Clone)]
pub struct BrokerManager {
    /// The inner broker.
    inner: Arc<dyn Broker>,
}

impl BrokerManager {
    /// Create a new broker manager from configuration.
    ///
    /// No connection is made here; call [`Broker::start`] on the result.
    pub fn new(config: &BrokerConfig) -> AppResult<Self> {
        let inner: Arc<dyn Broker> = match config.provider.as_str() {
            #[cfg(feature = "redis-backend")]
            "redis" => {
                info!("Initializing Redis broker");
                let store = crate::redis::RedisQueueStore::new(config.clone());
                Arc::new(crate::StoreBroker::new(store, config.clone()))
            }
            #[cfg(feature = "memory")]
            "memory" => {
                info!("Initializing in-memory broker");
                let store = crate::memory::MemoryQueueStore::new();
                Arc::new(crate::StoreBroker::new(store, config.clone()))
            }
            other => {
                return Err(AppError::configuration(format!(
                    "Unknown broker provider: '{other}'. Supported: memory, redis"
                )));
            }
        };

        Ok(Self { inner })
    }

    /// Shared handle to the inner broker.
    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.inner)
    }
}

#[async_trait]
impl Broker for BrokerManager {
    async fn start(&self) -> AppResult<()> {
        self.inner.start().await
    }

    async fn close(&self) -> AppResult<()> {
        self.inner.close().await
    }

    async fn publish(&self, job: &Job) -> AppResult<()> {
        self.inner.publish(job).await
    }

    async fn subscribe(&self, queues: &[String]) -> AppResult<JobStream> {
        self.inner.subscribe(queues).await
    }

    async fn ack(&self, job_id: &str) -> AppResult<()> {
        self.inner.ack(job_id).await
    }

    fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }
}
