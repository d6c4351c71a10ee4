// =============================================================================
// Reconciliation — periodic cross-store consistency repair
// =============================================================================
//
// Every 30 s, for every active tracker: feed subscription present, live
// position present, and warm-cache PnL coherent with the tracker row (synced
// when they diverge by more than one rupee). Live positions whose tracker is
// no longer active are evicted.
//
// SAFETY POLICY: this sweep repairs local state only. It never places or
// cancels orders, and it never fabricates trackers for broker-side
// positions it cannot explain — those are logged for the operator.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::WarmCache;
use crate::feed::MarketFeedHub;
use crate::positions::{ActiveCache, PositionData, TrackerStore};

/// Sweep cadence.
const RECONCILE_EVERY: Duration = Duration::from_secs(30);

/// Warm pnl and tracker row are considered coherent within this margin.
const PNL_COHERENCE_RUPEES: f64 = 1.0;

/// Per-fix counters from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub subscriptions_fixed: u32,
    pub cache_seeded: u32,
    pub cache_evicted: u32,
    pub pnl_synced: u32,
}

impl ReconcileStats {
    pub fn total(&self) -> u32 {
        self.subscriptions_fixed + self.cache_seeded + self.cache_evicted + self.pnl_synced
    }
}

/// The consistency sweeper.
pub struct Reconciler {
    trackers: Arc<dyn TrackerStore>,
    active_cache: Arc<ActiveCache>,
    warm: Arc<WarmCache>,
    hub: Option<Arc<MarketFeedHub>>,
}

impl Reconciler {
    pub fn new(
        trackers: Arc<dyn TrackerStore>,
        active_cache: Arc<ActiveCache>,
        warm: Arc<WarmCache>,
        hub: Option<Arc<MarketFeedHub>>,
    ) -> Self {
        Self { trackers, active_cache, warm, hub }
    }

    /// Run sweeps until the stop signal flips.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        info!(every_secs = RECONCILE_EVERY.as_secs(), "reconciler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(RECONCILE_EVERY) => {}
                _ = stop.changed() => break,
            }
            if *stop.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(stats) if stats.total() > 0 => {
                    info!(
                        subscriptions_fixed = stats.subscriptions_fixed,
                        cache_seeded = stats.cache_seeded,
                        cache_evicted = stats.cache_evicted,
                        pnl_synced = stats.pnl_synced,
                        "reconciliation repaired state"
                    );
                }
                Ok(_) => debug!("reconciliation clean"),
                Err(e) => warn!(error = %e, "reconciliation sweep failed"),
            }
        }
        info!("reconciler stopped");
    }

    /// One sweep. Public so tests can drive it directly.
    pub async fn run_once(&self) -> anyhow::Result<ReconcileStats> {
        let mut stats = ReconcileStats::default();
        let active = self.trackers.active().await?;

        for tracker in &active {
            // Feed subscription.
            if let Some(hub) = &self.hub {
                let key = tracker.instrument_key();
                if !hub.is_subscribed(&key) {
                    hub.subscribe(key.clone());
                    stats.subscriptions_fixed += 1;
                    warn!(tracker_id = %tracker.id, instrument = %key, "reconcile: resubscribed");
                }
            }

            // Live snapshot.
            if !self.active_cache.contains(&tracker.id) {
                let mut position = PositionData::new(
                    tracker.id.clone(),
                    tracker.security_id.clone(),
                    tracker.segment,
                    tracker.entry_price,
                    tracker.quantity,
                    tracker.side.direction(),
                );
                position.high_water_mark = tracker.high_water_mark_pnl;
                self.active_cache.add(position);
                stats.cache_seeded += 1;
                warn!(tracker_id = %tracker.id, "reconcile: seeded missing live position");
            }

            // Warm pnl vs tracker row coherence.
            if let Some(warm) = self.warm.read_pnl(&tracker.id).await {
                if (warm.pnl - tracker.last_pnl_rupees).abs() > PNL_COHERENCE_RUPEES {
                    let mut row = tracker.clone();
                    row.record_pnl(warm.pnl, warm.pnl_pct);
                    if self.trackers.save(&row).await.is_ok() {
                        stats.pnl_synced += 1;
                        debug!(
                            tracker_id = %tracker.id,
                            warm_pnl = warm.pnl,
                            row_pnl = tracker.last_pnl_rupees,
                            "reconcile: tracker pnl synced from warm cache"
                        );
                    }
                }
            }
        }

        // Evict live positions whose tracker is no longer active.
        let active_ids: std::collections::HashSet<&str> =
            active.iter().map(|t| t.id.as_str()).collect();
        for position in self.active_cache.all_positions() {
            if !active_ids.contains(position.tracker_id.as_str()) {
                self.active_cache.remove(&position.tracker_id);
                stats.cache_evicted += 1;
                warn!(
                    tracker_id = %position.tracker_id,
                    "reconcile: evicted live position without an active tracker"
                );
            }
        }

        Ok(stats)
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}
