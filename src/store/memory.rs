// =============================================================================
// In-memory KvStore — used by tests and as a degraded fallback
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{KvStore, StoreError};

#[derive(Debug, Clone)]
enum Value {
    Scalar(String),
    Hash(HashMap<String, String>),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}

/// Process-local store with the same observable semantics as the Redis
/// implementation, including TTL expiry. `set_failing(true)` makes every
/// operation return `StoreError::Unavailable`, which tests use to exercise
/// fail-open and fail-closed paths.
#[derive(Default)]
pub struct InMemoryKv {
    entries: RwLock<HashMap<String, Entry>>,
    failing: AtomicBool,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a store outage.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }

    /// Read a live (non-expired) entry, removing it lazily when expired.
    fn live<'a>(
        &self,
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|e| e.expired()) {
            entries.remove(key);
            return None;
        }
        entries.get_mut(key)
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        match self.live(&mut entries, key) {
            Some(Entry { value: Value::Scalar(s), .. }) => Ok(Some(s.clone())),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check_available()?;
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value: Value::Scalar(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.entries.write().remove(key);
        Ok(())
    }

    async fn incr_by_float(
        &self,
        key: &str,
        delta: f64,
        ttl: Option<Duration>,
    ) -> Result<f64, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        let current = match self.live(&mut entries, key) {
            Some(Entry { value: Value::Scalar(s), .. }) => s.parse::<f64>().unwrap_or(0.0),
            _ => 0.0,
        };
        let next = current + delta;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Scalar(format!("{next}")),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(next)
    }

    async fn hset_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        let mut hash = match self.live(&mut entries, key) {
            Some(Entry { value: Value::Hash(h), .. }) => h.clone(),
            _ => HashMap::new(),
        };
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Hash(hash),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        match self.live(&mut entries, key) {
            Some(Entry { value: Value::Hash(h), .. }) => Ok(h.clone()),
            _ => Ok(HashMap::new()),
        }
    }

    async fn rpush_capped(&self, key: &str, value: &str, cap: usize) -> Result<(), StoreError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        let mut list = match self.live(&mut entries, key) {
            Some(Entry { value: Value::List(l), .. }) => l.clone(),
            _ => Vec::new(),
        };
        list.push(value.to_string());
        if list.len() > cap {
            let drop = list.len() - cap;
            list.drain(..drop);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::List(list),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        match self.live(&mut entries, key) {
            Some(Entry { value: Value::List(l), .. }) => Ok(l.clone()),
            _ => Ok(Vec::new()),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let entries = self.entries.read();
        Ok(entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.expired())
            .map(|(k, _)| k.clone())
            .collect())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scalar_roundtrip() {
        let kv = InMemoryKv::new();
        kv.set("a", "1", None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some("1".to_string()));
        kv.del("a").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn float_counter_accumulates() {
        let kv = InMemoryKv::new();
        assert!((kv.incr_by_float("c", 10.5, None).await.unwrap() - 10.5).abs() < 1e-9);
        assert!((kv.incr_by_float("c", 4.5, None).await.unwrap() - 15.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let kv = InMemoryKv::new();
        kv.set("t", "x", Some(Duration::from_millis(10))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(kv.get("t").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_is_capped_fifo() {
        let kv = InMemoryKv::new();
        for i in 0..5 {
            kv.rpush_capped("l", &i.to_string(), 3).await.unwrap();
        }
        let items = kv.lrange_all("l").await.unwrap();
        assert_eq!(items, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn failing_mode_returns_unavailable() {
        let kv = InMemoryKv::new();
        kv.set_failing(true);
        assert!(matches!(
            kv.get("a").await,
            Err(StoreError::Unavailable(_))
        ));
        kv.set_failing(false);
        assert!(kv.get("a").await.is_ok());
    }

    #[tokio::test]
    async fn scan_prefix_filters() {
        let kv = InMemoryKv::new();
        kv.set("tick:NSE_FNO:1", "a", None).await.unwrap();
        kv.set("tick:IDX_I:2", "b", None).await.unwrap();
        kv.set("pnl:tracker:3", "c", None).await.unwrap();
        let mut keys = kv.scan_prefix("tick:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["tick:IDX_I:2", "tick:NSE_FNO:1"]);
    }
}
