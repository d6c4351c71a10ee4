// =============================================================================
// Redis-backed KvStore — production warm cache and counters
// =============================================================================
//
// Uses a multiplexed connection manager so every call clones a cheap handle;
// reconnection is handled inside the manager. All TTLs are set with EXPIRE
// after the write, which refreshes them on every touch (counter keys embed
// the calendar date, so refreshing never extends a key across days).
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use super::{KvStore, StoreError};

/// Redis implementation of [`KvStore`].
#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        debug!(url, "redis connection manager ready");
        Ok(Self { manager })
    }

    async fn apply_ttl(
        conn: &mut ConnectionManager,
        key: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        if let Some(ttl) = ttl {
            let _: () = conn
                .expire(key, ttl.as_secs() as i64)
                .await
                .map_err(|e| StoreError::Write(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        conn.get(key)
            .await
            .map_err(|e| StoreError::Read(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn
                    .set_ex(key, value, ttl.as_secs())
                    .await
                    .map_err(|e| StoreError::Write(e.to_string()))?;
            }
            None => {
                let _: () = conn
                    .set(key, value)
                    .await
                    .map_err(|e| StoreError::Write(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .del(key)
            .await
            .map_err(|e| StoreError::Write(e.to_string()))?;
        Ok(())
    }

    async fn incr_by_float(
        &self,
        key: &str,
        delta: f64,
        ttl: Option<Duration>,
    ) -> Result<f64, StoreError> {
        let mut conn = self.manager.clone();
        let next: f64 = redis::cmd("INCRBYFLOAT")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Write(e.to_string()))?;
        Self::apply_ttl(&mut conn, key, ttl).await?;
        Ok(next)
    }

    async fn hset_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let _: () = conn
            .hset_multiple(key, fields)
            .await
            .map_err(|e| StoreError::Write(e.to_string()))?;
        Self::apply_ttl(&mut conn, key, ttl).await?;
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.manager.clone();
        conn.hgetall(key)
            .await
            .map_err(|e| StoreError::Read(e.to_string()))
    }

    async fn rpush_capped(&self, key: &str, value: &str, cap: usize) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(key)
            .arg(value)
            .ignore()
            .cmd("LTRIM")
            .arg(key)
            .arg(-(cap as isize))
            .arg(-1)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Write(e.to_string()))?;
        Ok(())
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.manager.clone();
        conn.lrange(key, 0, -1)
            .await
            .map_err(|e| StoreError::Read(e.to_string()))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.manager.clone();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Read(e.to_string()))?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

impl std::fmt::Debug for RedisKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKv").finish_non_exhaustive()
    }
}
