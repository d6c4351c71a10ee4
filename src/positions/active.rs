// =============================================================================
// Active cache — live PositionData snapshots with a security-id index
// =============================================================================
//
// The authoritative store for in-flight position state: the risk loop and
// trailing engine mutate PositionData here and nowhere else. Positions hold
// only a tracker_id back-reference, never a Tracker.
//
// `positions.added` / `positions.removed` events are published over a
// broadcast channel for demand-driven wake-ups.
// =============================================================================

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::types::{InstrumentKey, PositionDirection, Segment};

/// Live snapshot of one position, derived from its tracker and the freshest
/// tick. PnL invariants:
///   pnl      = (current_ltp - entry_price) * quantity
///   pnl_pct  = (current_ltp / entry_price - 1) * 100
/// `peak_profit_pct` and `high_water_mark` never decrease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionData {
    pub tracker_id: String,
    pub security_id: String,
    pub segment: Segment,
    pub entry_price: f64,
    pub quantity: i64,
    #[serde(default)]
    pub current_ltp: f64,
    #[serde(default)]
    pub pnl: f64,
    #[serde(default)]
    pub pnl_pct: f64,
    #[serde(default)]
    pub peak_profit_pct: f64,
    #[serde(default)]
    pub high_water_mark: f64,
    /// Protective stop level in rupees; 0.0 until the trailing engine sets one.
    #[serde(default)]
    pub sl_price: f64,
    /// Stop offset above entry as a percentage of entry price.
    #[serde(default)]
    pub sl_offset_pct: f64,
    pub position_direction: PositionDirection,
    /// Epoch seconds of the last refresh.
    #[serde(default)]
    pub last_updated_at: i64,
    /// Epoch seconds since which pnl has been continuously positive.
    #[serde(default)]
    pub profitable_since: Option<i64>,
}

impl PositionData {
    pub fn new(
        tracker_id: impl Into<String>,
        security_id: impl Into<String>,
        segment: Segment,
        entry_price: f64,
        quantity: i64,
        direction: PositionDirection,
    ) -> Self {
        Self {
            tracker_id: tracker_id.into(),
            security_id: security_id.into(),
            segment,
            entry_price,
            quantity,
            current_ltp: entry_price,
            pnl: 0.0,
            pnl_pct: 0.0,
            peak_profit_pct: 0.0,
            high_water_mark: 0.0,
            sl_price: 0.0,
            sl_offset_pct: 0.0,
            position_direction: direction,
            last_updated_at: Utc::now().timestamp(),
            profitable_since: None,
        }
    }

    pub fn instrument_key(&self) -> InstrumentKey {
        InstrumentKey::new(self.segment, self.security_id.clone())
    }

    /// Recompute pnl, pnl_pct, peak and HWM from `(current_ltp, entry_price,
    /// quantity)` in one step. Zero entry price or quantity leaves the PnL
    /// fields untouched (the caller's rule layer skips such positions).
    pub fn recalculate_pnl(&mut self) {
        if self.entry_price <= 0.0 || self.quantity <= 0 {
            return;
        }
        let now = Utc::now().timestamp();

        self.pnl = (self.current_ltp - self.entry_price) * self.quantity as f64;
        self.pnl_pct = (self.current_ltp / self.entry_price - 1.0) * 100.0;

        if self.pnl_pct > self.peak_profit_pct {
            self.peak_profit_pct = self.pnl_pct;
        }
        if self.pnl > self.high_water_mark {
            self.high_water_mark = self.pnl;
        }

        if self.pnl > 0.0 {
            self.profitable_since.get_or_insert(now);
        } else {
            self.profitable_since = None;
        }
        self.last_updated_at = now;
    }

    /// Apply a fresh LTP and recompute.
    pub fn apply_ltp(&mut self, ltp: f64) {
        if ltp > 0.0 {
            self.current_ltp = ltp;
            self.recalculate_pnl();
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// Published on every cache mutation for demand-driven services.
#[derive(Debug, Clone)]
pub enum PositionEvent {
    Added { tracker_id: String, key: InstrumentKey },
    Removed { tracker_id: String, key: InstrumentKey },
}

// =============================================================================
// ActiveCache
// =============================================================================

/// Thread-safe map `tracker_id -> PositionData` with a secondary index
/// `instrument -> tracker_ids`. All mutations go through the write lock, so
/// updates to a single tracker are serialised.
pub struct ActiveCache {
    positions: RwLock<HashMap<String, PositionData>>,
    by_instrument: RwLock<HashMap<InstrumentKey, HashSet<String>>>,
    events: broadcast::Sender<PositionEvent>,
}

impl ActiveCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            positions: RwLock::new(HashMap::new()),
            by_instrument: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Insert (or replace) a position and index it.
    pub fn add(&self, position: PositionData) {
        let tracker_id = position.tracker_id.clone();
        let key = position.instrument_key();

        self.positions.write().insert(tracker_id.clone(), position);
        self.by_instrument
            .write()
            .entry(key.clone())
            .or_default()
            .insert(tracker_id.clone());

        info!(tracker_id = %tracker_id, instrument = %key, "position added to active cache");
        let _ = self.events.send(PositionEvent::Added { tracker_id, key });
    }

    /// Remove a position, unindex it, and return it.
    pub fn remove(&self, tracker_id: &str) -> Option<PositionData> {
        let removed = self.positions.write().remove(tracker_id)?;
        let key = removed.instrument_key();

        let mut index = self.by_instrument.write();
        if let Some(set) = index.get_mut(&key) {
            set.remove(tracker_id);
            if set.is_empty() {
                index.remove(&key);
            }
        }
        drop(index);

        debug!(tracker_id, instrument = %key, "position removed from active cache");
        let _ = self.events.send(PositionEvent::Removed {
            tracker_id: tracker_id.to_string(),
            key,
        });
        Some(removed)
    }

    /// Mutate one position under the write lock. Returns `false` when the
    /// tracker has no live position.
    pub fn update<F>(&self, tracker_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut PositionData),
    {
        let mut positions = self.positions.write();
        match positions.get_mut(tracker_id) {
            Some(position) => {
                f(position);
                true
            }
            None => false,
        }
    }

    pub fn get_by_tracker_id(&self, tracker_id: &str) -> Option<PositionData> {
        self.positions.read().get(tracker_id).cloned()
    }

    pub fn contains(&self, tracker_id: &str) -> bool {
        self.positions.read().contains_key(tracker_id)
    }

    /// Snapshot of every live position.
    pub fn all_positions(&self) -> Vec<PositionData> {
        self.positions.read().values().cloned().collect()
    }

    /// Tracker ids holding the given instrument.
    pub fn tracker_ids_for(&self, key: &InstrumentKey) -> Vec<String> {
        self.by_instrument
            .read()
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Instruments with at least one live position (the pruner's protected
    /// set, together with the watchlist).
    pub fn instrument_keys(&self) -> HashSet<InstrumentKey> {
        self.by_instrument.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.positions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.read().is_empty()
    }

    /// New subscription to add/remove events.
    pub fn events(&self) -> broadcast::Receiver<PositionEvent> {
        self.events.subscribe()
    }
}

impl Default for ActiveCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActiveCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveCache")
            .field("positions", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn position(tracker_id: &str, sid: &str, entry: f64, qty: i64) -> PositionData {
        PositionData::new(
            tracker_id,
            sid,
            Segment::NseFno,
            entry,
            qty,
            PositionDirection::Bullish,
        )
    }

    #[test]
    fn pnl_identities_hold() {
        let mut p = position("t1", "49081", 100.0, 10);
        p.apply_ltp(107.0);
        assert!((p.pnl - 70.0).abs() < 1e-9);
        assert!((p.pnl_pct - 7.0).abs() < 1e-9);
        assert!((p.peak_profit_pct - 7.0).abs() < 1e-9);
        assert!((p.high_water_mark - 70.0).abs() < 1e-9);
    }

    #[test]
    fn peak_and_hwm_are_monotone() {
        let mut p = position("t1", "49081", 100.0, 10);
        p.apply_ltp(110.0);
        p.apply_ltp(104.0);
        assert!((p.pnl_pct - 4.0).abs() < 1e-9);
        assert!((p.peak_profit_pct - 10.0).abs() < 1e-9);
        assert!((p.high_water_mark - 100.0).abs() < 1e-9);
        assert!(p.high_water_mark >= p.pnl);
    }

    #[test]
    fn zero_entry_price_is_guarded() {
        let mut p = position("t1", "49081", 0.0, 10);
        p.apply_ltp(50.0);
        assert_eq!(p.pnl, 0.0);
        assert_eq!(p.pnl_pct, 0.0);
    }

    #[test]
    fn profitable_since_resets_on_loss() {
        let mut p = position("t1", "49081", 100.0, 10);
        p.apply_ltp(105.0);
        assert!(p.profitable_since.is_some());
        p.apply_ltp(99.0);
        assert!(p.profitable_since.is_none());
    }

    #[test]
    fn add_update_remove_with_index() {
        let cache = ActiveCache::new();
        cache.add(position("t1", "49081", 100.0, 10));
        cache.add(position("t2", "49081", 101.0, 20));
        cache.add(position("t3", "50001", 200.0, 5));

        let key = InstrumentKey::new(Segment::NseFno, "49081");
        let mut ids = cache.tracker_ids_for(&key);
        ids.sort();
        assert_eq!(ids, vec!["t1", "t2"]);
        assert_eq!(cache.len(), 3);

        assert!(cache.update("t1", |p| p.apply_ltp(108.0)));
        assert!((cache.get_by_tracker_id("t1").unwrap().pnl - 80.0).abs() < 1e-9);
        assert!(!cache.update("missing", |_| {}));

        cache.remove("t1");
        cache.remove("t2");
        assert!(cache.tracker_ids_for(&key).is_empty());
        assert_eq!(cache.instrument_keys().len(), 1);
    }

    #[tokio::test]
    async fn events_fire_on_add_and_remove() {
        let cache = ActiveCache::new();
        let mut events = cache.events();

        cache.add(position("t1", "49081", 100.0, 10));
        match events.recv().await.unwrap() {
            PositionEvent::Added { tracker_id, key } => {
                assert_eq!(tracker_id, "t1");
                assert_eq!(key.security_id, "49081");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        cache.remove("t1");
        assert!(matches!(
            events.recv().await.unwrap(),
            PositionEvent::Removed { .. }
        ));
    }
}
