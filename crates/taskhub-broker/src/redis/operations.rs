//! Redis queue store implementation.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tokio::sync::{OwnedSemaphorePermit, RwLock};
use tracing::{debug, info};

use taskhub_core::config::BrokerConfig;
use taskhub_core::error::{AppError, ErrorKind};
use taskhub_core::result::AppResult;
use taskhub_core::traits::queue_store::{QueueConsumer, QueueStore};

use crate::keys::StoreKeys;

use super::client::RedisClient;

/// Lua script for conditional unacked tracking.
///
/// KEYS[1] = unacked hash
/// KEYS[2] = unacked index
/// ARGV[1] = job id
/// ARGV[2] = entry
/// ARGV[3] = score
///
/// Returns 1 when a record was written, 0 when one already existed.
const TRACK_SCRIPT: &str = r#"
    if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 1 then
        redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
        return 1
    end
    return 0
"#;

/// Lua script for atomic redelivery.
///
/// KEYS[1] = unacked hash
/// KEYS[2] = unacked index
/// KEYS[3] = queue list
/// ARGV[1] = job id
/// ARGV[2] = job payload
/// ARGV[3] = entry
/// ARGV[4] = score
///
/// Returns 1 when the job was pushed back, 0 when an ack got there first.
const REDELIVER_SCRIPT: &str = r#"
    local removed = redis.call('HDEL', KEYS[1], ARGV[1])
    redis.call('ZREM', KEYS[2], ARGV[1])
    if removed == 0 then
        return 0
    end
    redis.call('RPUSH', KEYS[3], ARGV[2])
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
    redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
    return 1
"#;

/// Lua script for dropping index entries whose hash field is gone.
///
/// KEYS[1] = unacked hash
/// KEYS[2] = unacked index
/// ARGV    = candidate job ids
///
/// An id re-published since the caller read the hash has a live record
/// again and keeps its index entry. Returns the number of entries removed.
const PRUNE_SCRIPT: &str = r#"
    local removed = 0
    for _, id in ipairs(ARGV) do
        if redis.call('HEXISTS', KEYS[1], id) == 0 then
            removed = removed + redis.call('ZREM', KEYS[2], id)
        end
    end
    return removed
"#;

/// Lua script for releasing a lock only while we still own it.
///
/// KEYS[1] = lock key
/// ARGV[1] = owner token
const UNLOCK_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

/// Redis-backed queue store.
#[derive(Debug)]
pub struct RedisQueueStore {
    /// Connection settings.
    config: BrokerConfig,
    /// Connected client, present between `connect` and `disconnect`.
    client: RwLock<Option<RedisClient>>,
    track_script: Script,
    redeliver_script: Script,
    prune_script: Script,
    unlock_script: Script,
}

impl RedisQueueStore {
    /// Create a store; no connection is made until [`QueueStore::connect`].
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
            track_script: Script::new(TRACK_SCRIPT),
            redeliver_script: Script::new(REDELIVER_SCRIPT),
            prune_script: Script::new(PRUNE_SCRIPT),
            unlock_script: Script::new(UNLOCK_SCRIPT),
        }
    }

    /// Clone of the connected client.
    async fn client(&self) -> AppResult<RedisClient> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| AppError::not_connected("Redis store is not connected"))
    }

    /// Map a Redis error to an AppError.
    fn map_err(e: redis::RedisError) -> AppError {
        AppError::with_source(ErrorKind::Connection, format!("Redis error: {e}"), e)
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn connect(&self) -> AppResult<()> {
        let mut guard = self.client.write().await;
        if guard.is_some() {
            return Ok(());
        }
        let client = RedisClient::connect(&self.config).await?;
        let mut conn = client.conn_mut();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        *guard = Some(client);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(client) = self.client.write().await.take() {
            client.close();
            info!("Redis queue store disconnected");
        }
    }

    async fn health_check(&self) -> AppResult<bool> {
        let mut conn = self.client().await?.conn_mut();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(pong == "PONG")
    }

    async fn enqueue(
        &self,
        queue: &str,
        job_id: &str,
        payload: &str,
        entry: &str,
        now: f64,
    ) -> AppResult<()> {
        let client = self.client().await?;
        let keys = client.keys();
        let mut conn = client.conn_mut();

        // MULTI/EXEC keeps the push and the unacked record together.
        let _: () = redis::pipe()
            .atomic()
            .rpush(keys.queue(queue), payload)
            .ignore()
            .hset(keys.unacked(), job_id, entry)
            .ignore()
            .zadd(keys.unacked_index(), job_id, now)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn track_if_absent(&self, job_id: &str, entry: &str, now: f64) -> AppResult<bool> {
        let client = self.client().await?;
        let keys = client.keys();
        let mut conn = client.conn_mut();

        let written: i64 = self
            .track_script
            .key(keys.unacked())
            .key(keys.unacked_index())
            .arg(job_id)
            .arg(entry)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(written == 1)
    }

    async fn remove_unacked(&self, job_id: &str) -> AppResult<bool> {
        let client = self.client().await?;
        let keys = client.keys();
        let mut conn = client.conn_mut();

        let (from_hash, from_index): (i64, i64) = redis::pipe()
            .atomic()
            .hdel(keys.unacked(), job_id)
            .zrem(keys.unacked_index(), job_id)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(from_hash > 0 || from_index > 0)
    }

    async fn stale_unacked(&self, older_than: f64) -> AppResult<Vec<(String, String)>> {
        let client = self.client().await?;
        let keys = client.keys();
        let mut conn = client.conn_mut();

        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(keys.unacked_index())
            .arg("-inf")
            .arg(older_than)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let entries: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(keys.unacked())
            .arg(&ids)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;

        let mut stale = Vec::with_capacity(ids.len());
        let mut orphaned = Vec::new();
        for (id, entry) in ids.into_iter().zip(entries) {
            match entry {
                Some(entry) => stale.push((id, entry)),
                None => orphaned.push(id),
            }
        }

        // Index entries whose hash field was acked in between.
        if !orphaned.is_empty() {
            let mut prune = self.prune_script.prepare_invoke();
            prune.key(keys.unacked()).key(keys.unacked_index());
            for id in &orphaned {
                prune.arg(id);
            }
            let removed: i64 = prune
                .invoke_async(&mut conn)
                .await
                .map_err(Self::map_err)?;
            debug!(
                candidates = orphaned.len(),
                removed, "Dropped orphaned unacked index entries"
            );
        }

        Ok(stale)
    }

    async fn redeliver(
        &self,
        job_id: &str,
        queue: &str,
        payload: &str,
        entry: &str,
        now: f64,
    ) -> AppResult<bool> {
        let client = self.client().await?;
        let keys = client.keys();
        let mut conn = client.conn_mut();

        let pushed: i64 = self
            .redeliver_script
            .key(keys.unacked())
            .key(keys.unacked_index())
            .key(keys.queue(queue))
            .arg(job_id)
            .arg(payload)
            .arg(entry)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(pushed == 1)
    }

    async fn try_lock(&self, name: &str, token: &str, lease: Duration) -> AppResult<bool> {
        let client = self.client().await?;
        let mut conn = client.conn_mut();

        // SET key token PX lease NX
        let result: Option<String> = redis::cmd("SET")
            .arg(client.keys().lock(name))
            .arg(token)
            .arg("PX")
            .arg(lease.as_millis().max(1) as u64)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(result.is_some())
    }

    async fn unlock(&self, name: &str, token: &str) -> AppResult<bool> {
        let client = self.client().await?;
        let mut conn = client.conn_mut();

        let released: i64 = self
            .unlock_script
            .key(client.keys().lock(name))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(released == 1)
    }

    async fn open_consumer(&self) -> AppResult<Box<dyn QueueConsumer>> {
        let client = self.client().await?;
        let (conn, permit) = client.blocking_connection().await?;
        Ok(Box::new(RedisConsumer {
            conn,
            keys: client.keys().clone(),
            _permit: permit,
        }))
    }

    async fn queue_len(&self, queue: &str) -> AppResult<u64> {
        let client = self.client().await?;
        let mut conn = client.conn_mut();
        let len: u64 = conn
            .llen(client.keys().queue(queue))
            .await
            .map_err(Self::map_err)?;
        Ok(len)
    }

    async fn unacked_len(&self) -> AppResult<u64> {
        let client = self.client().await?;
        let mut conn = client.conn_mut();
        let len: u64 = conn
            .hlen(client.keys().unacked())
            .await
            .map_err(Self::map_err)?;
        Ok(len)
    }
}

/// Consumer holding a dedicated connection for `BLPOP`.
///
/// Dropping the consumer closes its socket, which releases a pending
/// blocking pop on the server side.
#[derive(Debug)]
pub struct RedisConsumer {
    conn: MultiplexedConnection,
    keys: StoreKeys,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl QueueConsumer for RedisConsumer {
    async fn pop(&mut self, queues: &[String]) -> AppResult<(String, String)> {
        let list_keys: Vec<String> = queues.iter().map(|q| self.keys.queue(q)).collect();

        loop {
            // BLPOP k1 k2 ... 0 blocks until one of the lists has an item.
            let popped: Option<(String, String)> = redis::cmd("BLPOP")
                .arg(&list_keys)
                .arg(0)
                .query_async(&mut self.conn)
                .await
                .map_err(RedisQueueStore::map_err)?;

            if let Some((key, payload)) = popped {
                let queue = self
                    .keys
                    .queue_name(&key)
                    .map(str::to_string)
                    .unwrap_or(key);
                return Ok((queue, payload));
            }
        }
    }
}
