// =============================================================================
// Trailing engine — peak tracking and protective-stop maintenance
// =============================================================================
//
// Per position, each pass:
//   1. Peak-drawdown check first; a breach delegates the market exit to the
//      exit engine (the only market exit this engine ever causes).
//   2. Peak profit refresh (monotone).
//   3. New stop computation — direct (fixed distance below price) or tiered
//      (offset table keyed by current profit). A stop only ever moves up;
//      the broker leg is amended before the cache records the new level.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::broker::BrokerGateway;
use crate::config::{RiskConfig, RuntimeConfig, TrailingMode};
use crate::engine::{ExitEngine, ExitOutcome};
use crate::positions::{ActiveCache, PositionData, Tracker};
use crate::rules::{PeakDrawdown, Rule, RuleContext, RuleResult};
use crate::session::{classify_regime, ist_now, RegimeSlot, TradingSession};

/// What one trailing pass did.
#[derive(Debug)]
pub enum TrailingAction {
    /// Peak drawdown breached; the exit engine handled the exit.
    Exited(ExitOutcome),
    /// Protective stop moved up to this price.
    StopRaised(f64),
    /// Nothing to change this pass.
    Held,
}

/// Stop-loss maintainer for live positions.
pub struct TrailingEngine {
    gateway: Arc<dyn BrokerGateway>,
    active_cache: Arc<ActiveCache>,
    config: Arc<RwLock<RuntimeConfig>>,
}

impl TrailingEngine {
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        active_cache: Arc<ActiveCache>,
        config: Arc<RwLock<RuntimeConfig>>,
    ) -> Self {
        Self { gateway, active_cache, config }
    }

    /// One trailing pass for one position.
    pub async fn process_position(
        &self,
        tracker: &Tracker,
        exit_engine: &ExitEngine,
    ) -> TrailingAction {
        let Some(position) = self.active_cache.get_by_tracker_id(&tracker.id) else {
            return TrailingAction::Held;
        };
        if position.entry_price <= 0.0 || position.quantity <= 0 {
            return TrailingAction::Held;
        }

        let now = ist_now();
        let (risk, flags, session, slot) = {
            let config = self.config.read();
            let session = TradingSession::from_config(&config);
            let slot = classify_regime(now, &session, &config.time_regimes);
            (config.risk.clone(), config.feature_flags.clone(), session, slot)
        };

        // 1. Peak drawdown first; it is the only market exit we may cause.
        let ctx = RuleContext {
            position: &position,
            tracker,
            risk: &risk,
            flags: &flags,
            now,
            session: &session,
            regime: &slot,
        };
        if PeakDrawdown.enabled(&ctx) {
            if let RuleResult::Exit { kind, reason } = PeakDrawdown.evaluate(&ctx) {
                let outcome = exit_engine.execute_exit(&tracker.id, kind, &reason).await;
                return TrailingAction::Exited(outcome);
            }
        }

        // 2. Peak refresh (recalculate keeps it monotone).
        self.active_cache.update(&tracker.id, |p| p.recalculate_pnl());

        // 3. Stop computation, gated by the regime.
        if !slot.allow_trailing() {
            return TrailingAction::Held;
        }
        self.maybe_raise_stop(tracker, &risk, &slot).await
    }

    async fn maybe_raise_stop(
        &self,
        tracker: &Tracker,
        risk: &RiskConfig,
        _slot: &RegimeSlot,
    ) -> TrailingAction {
        // Re-read after the peak refresh.
        let Some(position) = self.active_cache.get_by_tracker_id(&tracker.id) else {
            return TrailingAction::Held;
        };

        let Some(target) = compute_target_sl(&position, risk) else {
            return TrailingAction::Held;
        };

        // A stop only tightens. Equal or lower targets are rejected here so
        // a chop regime cannot walk the stop back down.
        if target <= position.sl_price {
            return TrailingAction::Held;
        }

        if let Err(e) = self
            .gateway
            .amend_protective_stop(
                position.segment,
                &position.security_id,
                &tracker.order_no,
                target,
            )
            .await
        {
            warn!(
                tracker_id = %tracker.id,
                target,
                error = %e,
                "stop amendment failed — keeping previous level"
            );
            return TrailingAction::Held;
        }

        let entry = position.entry_price;
        self.active_cache.update(&tracker.id, |p| {
            p.sl_price = target;
            p.sl_offset_pct = (target / entry - 1.0) * 100.0;
        });

        info!(
            tracker_id = %tracker.id,
            sl_price = target,
            pnl_pct = format!("{:.2}", position.pnl_pct),
            "protective stop raised"
        );
        TrailingAction::StopRaised(target)
    }
}

impl std::fmt::Debug for TrailingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrailingEngine").finish_non_exhaustive()
    }
}

/// New stop target for the position under the configured mode, or None when
/// the mode yields nothing for the current state.
fn compute_target_sl(position: &PositionData, risk: &RiskConfig) -> Option<f64> {
    match risk.trailing_mode {
        TrailingMode::Direct => {
            if risk.trail_distance_pct <= 0.0 || position.current_ltp <= 0.0 {
                return None;
            }
            Some(position.current_ltp * (1.0 - risk.trail_distance_pct / 100.0))
        }
        TrailingMode::Tiered => {
            let offset = risk
                .trail_tiers
                .iter()
                .filter(|t| position.pnl_pct >= t.min_profit_pct)
                .map(|t| t.sl_offset_pct)
                .last()?;
            Some(position.entry_price * (1.0 + offset / 100.0))
        }
    }
}
