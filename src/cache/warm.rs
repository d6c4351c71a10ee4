// =============================================================================
// Warm cache — durable last-tick and per-position PnL snapshots in Redis
// =============================================================================
//
// Key families:
//   tick:{segment}:{sid}  -> hash {ltp, ts, updated_at}, TTL 6 h
//   pnl:tracker:{id}      -> hash {pnl, pnl_pct, ltp, hwm_pnl, ts, updated_at}
//
// Writes are best-effort: a failed warm write never propagates to the hot
// path. Corrupt hashes (schema drift, bad floats) read as None and bump the
// error counter instead of raising.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::store::{KvStore, StoreError};
use crate::types::{InstrumentKey, Segment, Tick};

/// TTL for tick and pnl hashes.
const WARM_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Last tick as read back from the warm store.
#[derive(Debug, Clone, PartialEq)]
pub struct WarmTick {
    pub ltp: f64,
    pub ts: i64,
    pub updated_at: i64,
}

/// Per-position PnL snapshot as read back from the warm store.
#[derive(Debug, Clone, PartialEq)]
pub struct WarmPnl {
    pub pnl: f64,
    pub pnl_pct: f64,
    pub ltp: f64,
    pub hwm_pnl: f64,
    pub ts: i64,
    pub updated_at: i64,
}

/// PnL values written on every refresh.
#[derive(Debug, Clone, Copy)]
pub struct PnlSnapshot {
    pub pnl: f64,
    pub pnl_pct: f64,
    pub ltp: f64,
    pub hwm_pnl: f64,
    pub ts: i64,
}

/// Outcome of one prune sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub scanned: usize,
    pub evicted: usize,
    pub errors: usize,
}

/// Warm-cache facade over a [`KvStore`].
pub struct WarmCache {
    store: Arc<dyn KvStore>,
    /// Corrupt-hash observations, surfaced in the engine snapshot.
    decode_errors: AtomicU64,
}

impl WarmCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            decode_errors: AtomicU64::new(0),
        }
    }

    pub fn tick_key(segment: Segment, security_id: &str) -> String {
        format!("tick:{segment}:{security_id}")
    }

    pub fn pnl_key(tracker_id: &str) -> String {
        format!("pnl:tracker:{tracker_id}")
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Ticks
    // -------------------------------------------------------------------------

    /// Persist the latest tick. Best-effort: failures are logged at debug
    /// level and swallowed so the feed path never stalls on Redis.
    pub async fn write_tick(&self, tick: &Tick) {
        let key = Self::tick_key(tick.segment, &tick.security_id);
        let fields = vec![
            ("ltp".to_string(), format!("{}", tick.ltp)),
            ("ts".to_string(), tick.ts.to_string()),
            ("updated_at".to_string(), Utc::now().timestamp().to_string()),
        ];
        if let Err(e) = self.store.hset_all(&key, &fields, Some(WARM_TTL)).await {
            debug!(key = %key, error = %e, "warm tick write failed (ignored)");
        }
    }

    pub async fn read_tick(&self, segment: Segment, security_id: &str) -> Option<WarmTick> {
        let key = Self::tick_key(segment, security_id);
        let hash = match self.store.hget_all(&key).await {
            Ok(h) if !h.is_empty() => h,
            Ok(_) => return None,
            Err(e) => {
                debug!(key = %key, error = %e, "warm tick read failed");
                return None;
            }
        };
        self.decode_tick(&key, &hash)
    }

    fn decode_tick(&self, key: &str, hash: &HashMap<String, String>) -> Option<WarmTick> {
        let decoded = (|| {
            Some(WarmTick {
                ltp: hash.get("ltp")?.parse().ok()?,
                ts: hash.get("ts")?.parse().ok()?,
                updated_at: hash.get("updated_at")?.parse().ok()?,
            })
        })();
        if decoded.is_none() {
            self.decode_errors.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, "corrupt warm tick hash ignored");
        }
        decoded
    }

    // -------------------------------------------------------------------------
    // PnL snapshots
    // -------------------------------------------------------------------------

    /// Persist a PnL snapshot for a tracker. Best-effort.
    pub async fn write_pnl(&self, tracker_id: &str, snap: PnlSnapshot) {
        let key = Self::pnl_key(tracker_id);
        let fields = vec![
            ("pnl".to_string(), format!("{}", snap.pnl)),
            ("pnl_pct".to_string(), format!("{}", snap.pnl_pct)),
            ("ltp".to_string(), format!("{}", snap.ltp)),
            ("hwm_pnl".to_string(), format!("{}", snap.hwm_pnl)),
            ("ts".to_string(), snap.ts.to_string()),
            ("updated_at".to_string(), Utc::now().timestamp().to_string()),
        ];
        if let Err(e) = self.store.hset_all(&key, &fields, Some(WARM_TTL)).await {
            debug!(key = %key, error = %e, "warm pnl write failed (ignored)");
        }
    }

    pub async fn read_pnl(&self, tracker_id: &str) -> Option<WarmPnl> {
        let key = Self::pnl_key(tracker_id);
        let hash = match self.store.hget_all(&key).await {
            Ok(h) if !h.is_empty() => h,
            Ok(_) => return None,
            Err(e) => {
                debug!(key = %key, error = %e, "warm pnl read failed");
                return None;
            }
        };
        let decoded = (|| {
            Some(WarmPnl {
                pnl: hash.get("pnl")?.parse().ok()?,
                pnl_pct: hash.get("pnl_pct")?.parse().ok()?,
                ltp: hash.get("ltp")?.parse().ok()?,
                hwm_pnl: hash.get("hwm_pnl")?.parse().ok()?,
                ts: hash.get("ts")?.parse().ok()?,
                updated_at: hash.get("updated_at")?.parse().ok()?,
            })
        })();
        if decoded.is_none() {
            self.decode_errors.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, "corrupt warm pnl hash ignored");
        }
        decoded
    }

    /// Whether a pnl entry exists for the tracker (used by maintenance).
    pub async fn has_pnl(&self, tracker_id: &str) -> bool {
        matches!(
            self.store.hget_all(&Self::pnl_key(tracker_id)).await,
            Ok(h) if !h.is_empty()
        )
    }

    // -------------------------------------------------------------------------
    // Pruning
    // -------------------------------------------------------------------------

    /// Evict tick keys whose `updated_at` is older than `max_age_secs`.
    /// Index-feed segments and the protected set are never touched, and the
    /// sweep only ever scans the `tick:` family — pnl keys are untouchable
    /// by construction.
    pub async fn prune_stale(
        &self,
        protected: &HashSet<InstrumentKey>,
        max_age_secs: i64,
    ) -> Result<PruneStats, StoreError> {
        let now = Utc::now().timestamp();
        let keys = self.store.scan_prefix("tick:").await?;
        let mut stats = PruneStats {
            scanned: keys.len(),
            ..Default::default()
        };

        for key in keys {
            let Some(instrument) = parse_tick_key(&key) else {
                stats.errors += 1;
                continue;
            };
            if instrument.segment.is_index_feed() || protected.contains(&instrument) {
                continue;
            }

            let hash = match self.store.hget_all(&key).await {
                Ok(h) => h,
                Err(_) => {
                    stats.errors += 1;
                    continue;
                }
            };
            let updated_at: i64 = match hash.get("updated_at").and_then(|v| v.parse().ok()) {
                Some(ts) => ts,
                None => {
                    stats.errors += 1;
                    continue;
                }
            };

            if now - updated_at >= max_age_secs {
                if self.store.del(&key).await.is_ok() {
                    stats.evicted += 1;
                } else {
                    stats.errors += 1;
                }
            }
        }

        if stats.evicted > 0 {
            debug!(
                scanned = stats.scanned,
                evicted = stats.evicted,
                errors = stats.errors,
                "warm tick prune sweep"
            );
        }
        Ok(stats)
    }
}

/// Parse `tick:{segment}:{sid}` back into an instrument key.
fn parse_tick_key(key: &str) -> Option<InstrumentKey> {
    let mut parts = key.splitn(3, ':');
    if parts.next() != Some("tick") {
        return None;
    }
    let segment: Segment = parts.next()?.parse().ok()?;
    let sid = parts.next()?;
    if sid.is_empty() {
        return None;
    }
    Some(InstrumentKey::new(segment, sid))
}

impl std::fmt::Debug for WarmCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmCache")
            .field("decode_errors", &self.decode_errors())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryKv;
    use crate::types::TickKind;

    fn warm() -> (Arc<InMemoryKv>, WarmCache) {
        let kv = Arc::new(InMemoryKv::new());
        (kv.clone(), WarmCache::new(kv))
    }

    fn tick(sid: &str, ltp: f64) -> Tick {
        Tick {
            segment: Segment::NseFno,
            security_id: sid.to_string(),
            ltp,
            kind: TickKind::Ticker,
            ts: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn tick_roundtrip() {
        let (_, warm) = warm();
        warm.write_tick(&tick("49081", 123.45)).await;
        let read = warm.read_tick(Segment::NseFno, "49081").await.unwrap();
        assert!((read.ltp - 123.45).abs() < 1e-9);
        assert_eq!(read.ts, 1_700_000_000);
    }

    #[tokio::test]
    async fn pnl_roundtrip() {
        let (_, warm) = warm();
        warm.write_pnl(
            "trk-1",
            PnlSnapshot {
                pnl: 350.0,
                pnl_pct: 3.5,
                ltp: 103.5,
                hwm_pnl: 500.0,
                ts: 1_700_000_100,
            },
        )
        .await;
        let read = warm.read_pnl("trk-1").await.unwrap();
        assert!((read.pnl - 350.0).abs() < 1e-9);
        assert!((read.hwm_pnl - 500.0).abs() < 1e-9);
        assert!(warm.has_pnl("trk-1").await);
        assert!(!warm.has_pnl("trk-2").await);
    }

    #[tokio::test]
    async fn corrupt_hash_counts_error_and_reads_none() {
        let (kv, warm) = warm();
        kv.hset_all(
            "pnl:tracker:bad",
            &[("pnl".to_string(), "not-a-float".to_string())],
            None,
        )
        .await
        .unwrap();

        assert!(warm.read_pnl("bad").await.is_none());
        assert_eq!(warm.decode_errors(), 1);
    }

    #[tokio::test]
    async fn prune_spares_index_protected_and_pnl() {
        let (kv, warm) = warm();

        // Stale option tick, stale index tick, stale protected tick, pnl key.
        let stale = "0".to_string();
        for key in ["tick:NSE_FNO:1", "tick:IDX_I:13", "tick:NSE_FNO:2"] {
            kv.hset_all(
                key,
                &[
                    ("ltp".to_string(), "1".to_string()),
                    ("ts".to_string(), "0".to_string()),
                    ("updated_at".to_string(), stale.clone()),
                ],
                None,
            )
            .await
            .unwrap();
        }
        kv.hset_all(
            "pnl:tracker:t1",
            &[("pnl".to_string(), "0".to_string())],
            None,
        )
        .await
        .unwrap();

        let protected: HashSet<InstrumentKey> =
            [InstrumentKey::new(Segment::NseFno, "2")].into_iter().collect();

        let stats = warm.prune_stale(&protected, 30).await.unwrap();
        assert_eq!(stats.evicted, 1);

        assert!(warm.read_tick(Segment::NseFno, "1").await.is_none());
        assert!(warm.read_tick(Segment::IdxI, "13").await.is_some());
        assert!(warm.read_tick(Segment::NseFno, "2").await.is_some());
        assert!(warm.has_pnl("t1").await);
    }

    #[test]
    fn tick_key_parsing() {
        assert_eq!(
            parse_tick_key("tick:NSE_FNO:49081"),
            Some(InstrumentKey::new(Segment::NseFno, "49081"))
        );
        assert_eq!(parse_tick_key("pnl:tracker:x"), None);
        assert_eq!(parse_tick_key("tick:BOGUS:1"), None);
        assert_eq!(parse_tick_key("tick:NSE_FNO:"), None);
    }
}
