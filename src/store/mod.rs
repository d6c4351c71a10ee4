// =============================================================================
// Key-value store abstraction for the warm cache and counters
// =============================================================================
//
// One trait, two implementations: `RedisKv` in production and `InMemoryKv`
// for tests and degraded operation. Callers that can tolerate store loss
// (warm cache, edge-failure reads) treat every error as best-effort; callers
// that must not trade blind (daily limits) fail closed.
// =============================================================================

mod memory;
mod redis;

pub use memory::InMemoryKv;
pub use redis::RedisKv;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Typed store failure. Callers decide fail-open vs fail-closed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store read failed: {0}")]
    Read(String),
    #[error("store write failed: {0}")]
    Write(String),
}

/// Minimal key-value surface the engine needs: scalars with TTL, float
/// counters, hashes with TTL, capped lists, and prefix scans.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically add `delta` to a float counter, returning the new value.
    /// The TTL, when given, is refreshed on every write.
    async fn incr_by_float(
        &self,
        key: &str,
        delta: f64,
        ttl: Option<Duration>,
    ) -> Result<f64, StoreError>;

    /// Write all fields of a hash and refresh its TTL.
    async fn hset_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Read all fields of a hash. Missing key yields an empty map.
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Append to a list, trimming it to the newest `cap` entries.
    async fn rpush_capped(&self, key: &str, value: &str, cap: usize) -> Result<(), StoreError>;

    /// Read a whole list, oldest first. Missing key yields an empty vec.
    async fn lrange_all(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// List keys starting with `prefix`. Used only by the tick pruner.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
