//! Redis connection management.

use std::sync::Arc;

use redis::aio::{ConnectionManager, ConnectionManagerConfig, MultiplexedConnection};
use redis::{AsyncConnectionConfig, Client};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

use taskhub_core::config::BrokerConfig;
use taskhub_core::error::{AppError, ErrorKind};
use taskhub_core::result::AppResult;

use crate::keys::StoreKeys;

/// Redis client wrapper with connection management.
#[derive(Debug, Clone)]
pub struct RedisClient {
    /// Client used to open dedicated consumer connections.
    client: Client,
    /// Redis connection manager (shared, reconnecting).
    conn: ConnectionManager,
    /// Key builder for the configured prefix.
    keys: StoreKeys,
    /// Caps the number of dedicated consumer connections.
    consumer_permits: Arc<Semaphore>,
}

impl RedisClient {
    /// Create a new Redis client from configuration.
    pub async fn connect(config: &BrokerConfig) -> AppResult<Self> {
        let url = config.redis_url();
        info!(url = %mask_redis_url(&url), "Connecting to Redis");

        let client = Client::open(url.as_str()).map_err(|e| {
            AppError::with_source(ErrorKind::Connection, "Failed to create Redis client", e)
        })?;

        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(Some(config.socket_timeout()))
            .set_response_timeout(Some(config.socket_timeout()));

        let conn = ConnectionManager::new_with_config(client.clone(), manager_config)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Connection, "Failed to connect to Redis", e)
            })?;

        info!("Successfully connected to Redis");
        Ok(Self {
            client,
            conn,
            keys: StoreKeys::new(config.key_prefix.clone()),
            consumer_permits: Arc::new(Semaphore::new(config.max_connections.max(1))),
        })
    }

    /// Get a mutable clone of the connection manager.
    pub fn conn_mut(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Key builder for this client.
    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    /// Open a dedicated connection for blocking commands.
    ///
    /// Blocking pops would stall every other caller on the shared
    /// multiplexed connection, so each consumer gets its own socket with no
    /// response timeout. Waits for a free slot when `max_connections`
    /// consumers are already open.
    pub async fn blocking_connection(
        &self,
    ) -> AppResult<(MultiplexedConnection, OwnedSemaphorePermit)> {
        let permit = Arc::clone(&self.consumer_permits)
            .acquire_owned()
            .await
            .map_err(|_| AppError::internal("Consumer connection pool closed"))?;

        let config = AsyncConnectionConfig::new().set_response_timeout(None);
        let conn = self
            .client
            .get_multiplexed_async_connection_with_config(&config)
            .await
            .map_err(|e| {
                AppError::with_source(
                    ErrorKind::Connection,
                    "Failed to open consumer connection",
                    e,
                )
            })?;

        Ok((conn, permit))
    }

    /// Stop handing out consumer connections.
    pub fn close(&self) {
        self.consumer_permits.close();
    }
}

/// Mask password in Redis URL for safe logging.
pub fn mask_redis_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
            if colon_pos >= scheme_end {
                return format!("{}:****@{}", &url[..colon_pos], &url[at_pos + 1..]);
            }
        }
    }
    url.to_string()
}
