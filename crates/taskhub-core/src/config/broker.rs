//! Broker and backing store configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Store provider type: `"redis"` or `"memory"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Redis host name.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Redis port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Optional ACL user name.
    #[serde(default)]
    pub username: Option<String>,
    /// Optional password.
    #[serde(default)]
    pub password: Option<String>,
    /// Logical database index.
    #[serde(default)]
    pub db: i64,
    /// Maximum number of dedicated consumer connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Response timeout for non-blocking commands, in seconds.
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout_seconds: u64,
    /// Age in seconds after which an unacked job is redelivered.
    #[serde(default = "default_unacked_ttl")]
    pub unacked_ttl_seconds: u64,
    /// Seconds between sweep and health-check cycles.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Lease of the distributed sweep lock, in seconds.
    #[serde(default = "default_lock_lease")]
    pub lock_lease_seconds: u64,
    /// Prefix applied to every store key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Queue used by tasks registered without an explicit queue.
    #[serde(default = "default_queue")]
    pub default_queue: String,
}

impl BrokerConfig {
    /// Build a Redis connection URL from the individual settings.
    pub fn redis_url(&self) -> String {
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{user}:{pass}@"),
            (None, Some(pass)) => format!(":{pass}@"),
            (Some(user), None) => format!("{user}@"),
            (None, None) => String::new(),
        };
        format!(
            "redis://{auth}{}:{}/{}",
            self.hostname, self.port, self.db
        )
    }

    /// Response timeout for regular commands.
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_seconds)
    }

    /// Visibility timeout for unacked jobs.
    pub fn unacked_ttl(&self) -> Duration {
        Duration::from_secs(self.unacked_ttl_seconds)
    }

    /// Interval between sweep cycles.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    /// Sweep lock lease.
    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_seconds)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            hostname: default_hostname(),
            port: default_port(),
            username: None,
            password: None,
            db: 0,
            max_connections: default_max_connections(),
            socket_timeout_seconds: default_socket_timeout(),
            unacked_ttl_seconds: default_unacked_ttl(),
            sweep_interval_seconds: default_sweep_interval(),
            lock_lease_seconds: default_lock_lease(),
            key_prefix: default_key_prefix(),
            default_queue: default_queue(),
        }
    }
}

fn default_provider() -> String {
    "redis".to_string()
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_max_connections() -> usize {
    16
}

fn default_socket_timeout() -> u64 {
    5
}

fn default_unacked_ttl() -> u64 {
    1800
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_lock_lease() -> u64 {
    60
}

fn default_key_prefix() -> String {
    "taskhub:".to_string()
}

fn default_queue() -> String {
    "default".to_string()
}
