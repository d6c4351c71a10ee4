// =============================================================================
// Hot tick cache — latest tick per (segment, security_id)
// =============================================================================
//
// Last-write-wins. Reads are lock-free via DashMap so the feed writer is
// never blocked by loop-side readers.
// =============================================================================

use std::collections::HashSet;

use dashmap::DashMap;

use crate::types::{InstrumentKey, Tick};

/// Concurrent map of the freshest tick per instrument.
#[derive(Debug, Default)]
pub struct TickCache {
    ticks: DashMap<InstrumentKey, Tick>,
}

impl TickCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the latest tick for its instrument.
    pub fn put(&self, tick: Tick) {
        self.ticks.insert(tick.key(), tick);
    }

    /// Latest tick for an instrument, if any.
    pub fn get(&self, key: &InstrumentKey) -> Option<Tick> {
        self.ticks.get(key).map(|t| t.clone())
    }

    /// Latest LTP for an instrument, if a positive one is known.
    pub fn ltp(&self, key: &InstrumentKey) -> Option<f64> {
        self.ticks
            .get(key)
            .map(|t| t.ltp)
            .filter(|ltp| *ltp > 0.0)
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    /// Drop entries whose broker timestamp is older than `max_age_secs`,
    /// sparing index feeds and the protected set. Returns the evicted count.
    pub fn prune_stale(
        &self,
        protected: &HashSet<InstrumentKey>,
        max_age_secs: i64,
        now_epoch: i64,
    ) -> usize {
        let before = self.ticks.len();
        self.ticks.retain(|key, tick| {
            key.segment.is_index_feed()
                || protected.contains(key)
                || now_epoch - tick.ts < max_age_secs
        });
        before - self.ticks.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Segment, TickKind};

    fn tick(segment: Segment, sid: &str, ltp: f64, ts: i64) -> Tick {
        Tick {
            segment,
            security_id: sid.to_string(),
            ltp,
            kind: TickKind::Ticker,
            ts,
        }
    }

    #[test]
    fn last_write_wins() {
        let cache = TickCache::new();
        cache.put(tick(Segment::NseFno, "49081", 100.0, 1));
        cache.put(tick(Segment::NseFno, "49081", 101.5, 2));

        let key = InstrumentKey::new(Segment::NseFno, "49081");
        assert_eq!(cache.get(&key).unwrap().ltp, 101.5);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn ltp_filters_non_positive() {
        let cache = TickCache::new();
        cache.put(tick(Segment::NseFno, "1", 0.0, 1));
        assert_eq!(cache.ltp(&InstrumentKey::new(Segment::NseFno, "1")), None);
    }

    #[test]
    fn prune_spares_index_and_protected() {
        let cache = TickCache::new();
        cache.put(tick(Segment::IdxI, "13", 22_000.0, 0));
        cache.put(tick(Segment::NseFno, "1", 100.0, 0));
        cache.put(tick(Segment::NseFno, "2", 100.0, 0));
        cache.put(tick(Segment::NseFno, "3", 100.0, 95));

        let protected: HashSet<InstrumentKey> =
            [InstrumentKey::new(Segment::NseFno, "2")].into_iter().collect();

        let evicted = cache.prune_stale(&protected, 30, 100);
        assert_eq!(evicted, 1);
        assert!(cache.get(&InstrumentKey::new(Segment::IdxI, "13")).is_some());
        assert!(cache.get(&InstrumentKey::new(Segment::NseFno, "1")).is_none());
        assert!(cache.get(&InstrumentKey::new(Segment::NseFno, "2")).is_some());
        assert!(cache.get(&InstrumentKey::new(Segment::NseFno, "3")).is_some());
    }
}
