//! Store key builders for every TaskHub key.
//!
//! Centralising key construction prevents typos and makes it easy
//! to find every key the broker uses.

/// Builds prefixed keys for one broker namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    /// Create a key builder for `prefix` (for example `"taskhub:"`).
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    // ── Queue keys ─────────────────────────────────────────────

    /// List holding jobs waiting in `queue`.
    pub fn queue(&self, queue: &str) -> String {
        format!("{}queue:{queue}", self.prefix)
    }

    /// Recover the queue name from a list key returned by a blocking pop.
    pub fn queue_name<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix("queue:"))
    }

    // ── Unacked keys ───────────────────────────────────────────

    /// Hash mapping job id to its unacked entry.
    pub fn unacked(&self) -> String {
        format!("{}unacked", self.prefix)
    }

    /// Sorted set mapping job id to its enqueue timestamp.
    pub fn unacked_index(&self) -> String {
        format!("{}unacked:index", self.prefix)
    }

    // ── Lock keys ──────────────────────────────────────────────

    /// String key backing the named advisory lock.
    pub fn lock(&self, name: &str) -> String {
        format!("{}lock:{name}", self.prefix)
    }
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new("taskhub:")
    }
}
