// =============================================================================
// Exit engine — sole authority for placing exit orders and finalising
// =============================================================================
//
// Per-tracker keyed async mutexes give the same at-most-once guarantee a
// database row lock would: concurrent exit attempts for one tracker
// serialise, the loser observes the terminal state and returns success
// idempotently, and exactly one broker call is ever issued.
//
// Gateway failure leaves the tracker untouched — the position is kept and
// the next cycle retries. A save failure AFTER a successful broker call is
// flagged as an inconsistency for reconciliation instead of being swallowed.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::broker::BrokerGateway;
use crate::cache::TickCache;
use crate::config::RuntimeConfig;
use crate::engine::ReentryBook;
use crate::limits::{DailyLimits, EdgeFailureDetector};
use crate::positions::{ActiveCache, TrackerStore};
use crate::session::{classify_regime, ist_now, TimeRegime, TradingSession};
use crate::types::{index_of_symbol, ExitKind, InstrumentKey};

/// Result of one exit attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ExitOutcome {
    pub success: bool,
    pub exit_price: Option<f64>,
    pub reason: String,
    pub kind: ExitKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Broker order went out but the tracker row could not be persisted;
    /// reconciliation must repair this.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub inconsistent: bool,
}

impl ExitOutcome {
    fn failure(kind: ExitKind, reason: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_price: None,
            reason: reason.to_string(),
            kind,
            error: Some(error.into()),
            inconsistent: false,
        }
    }
}

/// Locked, idempotent exit dispatcher.
pub struct ExitEngine {
    trackers: Arc<dyn TrackerStore>,
    gateway: Arc<dyn BrokerGateway>,
    active_cache: Arc<ActiveCache>,
    tick_cache: Arc<TickCache>,
    daily_limits: Arc<DailyLimits>,
    edge_failure: Arc<EdgeFailureDetector>,
    reentry_book: Arc<ReentryBook>,
    config: Arc<parking_lot::RwLock<RuntimeConfig>>,
    /// Per-tracker exit locks, created on first use.
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ExitEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trackers: Arc<dyn TrackerStore>,
        gateway: Arc<dyn BrokerGateway>,
        active_cache: Arc<ActiveCache>,
        tick_cache: Arc<TickCache>,
        daily_limits: Arc<DailyLimits>,
        edge_failure: Arc<EdgeFailureDetector>,
        reentry_book: Arc<ReentryBook>,
        config: Arc<parking_lot::RwLock<RuntimeConfig>>,
    ) -> Self {
        Self {
            trackers,
            gateway,
            active_cache,
            tick_cache,
            daily_limits,
            edge_failure,
            reentry_book,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, tracker_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(tracker_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Execute an exit for the tracker. At most one broker call per tracker,
    /// ever; repeat calls after success return success with the recorded
    /// exit price.
    pub async fn execute_exit(
        &self,
        tracker_id: &str,
        kind: ExitKind,
        reason: &str,
    ) -> ExitOutcome {
        if reason.trim().is_empty() {
            return ExitOutcome::failure(kind, reason, "blank exit reason");
        }

        // Serialise with any concurrent exit attempt for this tracker.
        let lock = self.lock_for(tracker_id);
        let _guard = lock.lock().await;

        // Re-read under the lock: a concurrent attempt may have finished.
        let mut tracker = match self.trackers.get(tracker_id).await {
            Ok(Some(tracker)) => tracker,
            Ok(None) => return ExitOutcome::failure(kind, reason, "tracker not found"),
            Err(e) => return ExitOutcome::failure(kind, reason, e.to_string()),
        };

        if tracker.is_terminal() {
            return ExitOutcome {
                success: true,
                exit_price: tracker.exit_price,
                reason: tracker.exit_reason.clone().unwrap_or_else(|| reason.to_string()),
                kind: tracker.exit_kind.unwrap_or(kind),
                error: None,
                inconsistent: false,
            };
        }

        // Best-effort LTP for the fallback exit price; never fatal.
        let ltp = self
            .tick_cache
            .ltp(&InstrumentKey::new(tracker.segment, tracker.security_id.clone()));

        // One broker call. Failure keeps the position.
        let ack = match self
            .gateway
            .flat_position(tracker.segment, &tracker.security_id)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                warn!(
                    tracker_id,
                    error = %e,
                    reason,
                    "exit order failed — position retained"
                );
                return ExitOutcome::failure(kind, reason, e.to_string());
            }
        };

        // An asynchronous order-update may have finalised the tracker while
        // the broker call was in flight; that still counts as success.
        match self.trackers.get(tracker_id).await {
            Ok(Some(current)) if current.is_terminal() => {
                return ExitOutcome {
                    success: true,
                    exit_price: current.exit_price,
                    reason: current.exit_reason.clone().unwrap_or_else(|| reason.to_string()),
                    kind: current.exit_kind.unwrap_or(kind),
                    error: None,
                    inconsistent: false,
                };
            }
            Ok(Some(current)) => tracker = current,
            _ => {}
        }

        let exit_price = ack
            .exit_price
            .or(ltp)
            .unwrap_or(tracker.entry_price)
            .max(0.0);

        // Final net PnL with the flat round-trip fee deducted once.
        let flat_fee = self.config.read().risk.flat_fee_rupees;
        let gross = (exit_price - tracker.entry_price) * tracker.quantity as f64;
        let net = gross - flat_fee;
        let notional = tracker.entry_price * tracker.quantity as f64;
        let net_pct = if notional > 0.0 { net / notional * 100.0 } else { 0.0 };

        let final_reason = rewrite_reason(reason, net_pct);
        tracker.mark_exited(exit_price, final_reason.clone(), kind);
        tracker.record_pnl(net, net_pct);

        if let Err(e) = self.trackers.save(&tracker).await {
            // Broker order is out but the row did not persist. Surface the
            // inconsistency for reconciliation; do not pretend it succeeded
            // cleanly and do not retry the broker call.
            error!(
                tracker_id,
                order_id = %ack.order_id,
                error = %e,
                "exit placed but tracker persist failed — flagged for reconciliation"
            );
            return ExitOutcome {
                success: true,
                exit_price: Some(exit_price),
                reason: final_reason,
                kind,
                error: Some(e.to_string()),
                inconsistent: true,
            };
        }

        self.active_cache.remove(tracker_id);
        self.reentry_book.record_exit(&tracker.symbol);

        info!(
            tracker_id,
            order_id = %ack.order_id,
            exit_price,
            net_pnl = net,
            reason = %final_reason,
            "position exited"
        );

        self.record_post_exit(&tracker.symbol, net, kind).await;

        ExitOutcome {
            success: true,
            exit_price: Some(exit_price),
            reason: final_reason,
            kind,
            error: None,
            inconsistent: false,
        }
    }

    /// Daily-limit and edge-failure bookkeeping after a finalised exit.
    async fn record_post_exit(&self, symbol: &str, net_pnl: f64, kind: ExitKind) {
        let index = index_of_symbol(symbol);

        if net_pnl < 0.0 {
            self.daily_limits.record_loss(index, net_pnl.abs()).await;
        } else if net_pnl > 0.0 {
            self.daily_limits.record_profit(index, net_pnl).await;
        }

        let now = ist_now();
        let (edge_config, in_chop) = {
            let config = self.config.read();
            let session = TradingSession::from_config(&config);
            let slot = classify_regime(now, &session, &config.time_regimes);
            (
                config.risk.edge_failure_detector.clone(),
                slot.regime == TimeRegime::ChopDecay,
            )
        };
        self.edge_failure
            .record_exit(index, net_pnl, kind, now, &edge_config, in_chop)
            .await;
    }
}

impl std::fmt::Debug for ExitEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitEngine")
            .field("locks", &self.locks.lock().len())
            .finish()
    }
}

/// Reduce a rule-time reason to its base token and append the final net
/// PnL, so every persisted reason reads `"{BASE_REASON} {net_pct:.2}%"`.
/// Parenthesised diagnostic detail (the peak-drawdown rule carries one) and
/// the rule-time percentage are both dropped; they stay visible in the rule
/// engine's "exit rule fired" log line.
fn rewrite_reason(reason: &str, net_pct: f64) -> String {
    let head = reason.split(" (").next().unwrap_or(reason).trim_end();
    let base = match head.rsplit_once(' ') {
        Some((front, last))
            if last.ends_with('%') && last[..last.len() - 1].parse::<f64>().is_ok() =>
        {
            front
        }
        _ => head,
    };
    format!("{base} {net_pct:.2}%")
}
