// =============================================================================
// Daily limits — store-backed counters gating new entries
// =============================================================================
//
// Counter keys: daily_limits:{kind}:{YYYY-MM-DD}:{index|global}, kind in
// {loss, profit, trades}, 25 h TTL, date in the exchange time zone.
//
// Policy:
//   - Reaching the daily profit target hard-blocks new entries.
//   - Loss limits are enforced ONLY once global profit has reached the
//     profit threshold; below it, losses never block (profit-hunting mode).
//   - Trade counters are observability only.
//   - A store failure fails CLOSED: no counters, no trading.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::RiskConfig;
use crate::session::ist_date_string;
use crate::store::KvStore;

/// Counter TTL: a calendar day plus an hour of slack.
const COUNTER_TTL: Duration = Duration::from_secs(25 * 60 * 60);

/// Scope name for the account-wide counters.
const GLOBAL_SCOPE: &str = "global";

/// Admission decision with its reason when blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TradeGate {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TradeGate {
    fn allowed() -> Self {
        Self { allowed: true, reason: None }
    }

    fn blocked(reason: impl Into<String>) -> Self {
        Self { allowed: false, reason: Some(reason.into()) }
    }
}

/// Store-backed daily counters and the entry gate built on them.
pub struct DailyLimits {
    store: Arc<dyn KvStore>,
    /// Account capital used to convert percentage loss limits into rupees.
    capital: f64,
}

impl DailyLimits {
    pub fn new(store: Arc<dyn KvStore>, capital: f64) -> Self {
        Self { store, capital }
    }

    fn key(kind: &str, scope: &str) -> String {
        format!("daily_limits:{kind}:{}:{scope}", ist_date_string())
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    /// Record a realised loss (absolute rupees) against the index and the
    /// global scope, and bump the trade counters.
    pub async fn record_loss(&self, index: &str, amount: f64) {
        let amount = amount.abs();
        for scope in [index, GLOBAL_SCOPE] {
            if let Err(e) = self
                .store
                .incr_by_float(&Self::key("loss", scope), amount, Some(COUNTER_TTL))
                .await
            {
                warn!(scope, error = %e, "daily loss counter write failed");
            }
        }
        self.record_trade(index).await;
        info!(index, amount, "daily loss recorded");
    }

    /// Record a realised profit against the index and global scopes.
    pub async fn record_profit(&self, index: &str, amount: f64) {
        for scope in [index, GLOBAL_SCOPE] {
            if let Err(e) = self
                .store
                .incr_by_float(&Self::key("profit", scope), amount, Some(COUNTER_TTL))
                .await
            {
                warn!(scope, error = %e, "daily profit counter write failed");
            }
        }
        self.record_trade(index).await;
        info!(index, amount, "daily profit recorded");
    }

    /// Bump the trade-count counters (observability only, never gating).
    pub async fn record_trade(&self, index: &str) {
        for scope in [index, GLOBAL_SCOPE] {
            if let Err(e) = self
                .store
                .incr_by_float(&Self::key("trades", scope), 1.0, Some(COUNTER_TTL))
                .await
            {
                warn!(scope, error = %e, "daily trade counter write failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Readers
    // -------------------------------------------------------------------------

    async fn read_counter(&self, kind: &str, scope: &str) -> Result<f64, ()> {
        match self.store.get(&Self::key(kind, scope)).await {
            Ok(value) => Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0.0)),
            Err(e) => {
                warn!(kind, scope, error = %e, "daily counter read failed");
                Err(())
            }
        }
    }

    pub async fn daily_loss(&self, index: &str) -> f64 {
        self.read_counter("loss", index).await.unwrap_or(0.0)
    }

    pub async fn daily_profit(&self, index: &str) -> f64 {
        self.read_counter("profit", index).await.unwrap_or(0.0)
    }

    pub async fn daily_trades(&self, index: &str) -> f64 {
        self.read_counter("trades", index).await.unwrap_or(0.0)
    }

    pub async fn global_loss(&self) -> f64 {
        self.read_counter("loss", GLOBAL_SCOPE).await.unwrap_or(0.0)
    }

    pub async fn global_profit(&self) -> f64 {
        self.read_counter("profit", GLOBAL_SCOPE).await.unwrap_or(0.0)
    }

    // -------------------------------------------------------------------------
    // Gate
    // -------------------------------------------------------------------------

    /// Entry admission decision for one index.
    pub async fn can_trade(&self, index: &str, risk: &RiskConfig) -> TradeGate {
        // Every read that feeds a decision must succeed; otherwise we would
        // be trading blind. Fail closed.
        let Ok(global_profit) = self.read_counter("profit", GLOBAL_SCOPE).await else {
            return TradeGate::blocked("store_unavailable");
        };

        if risk.max_daily_profit > 0.0 && global_profit >= risk.max_daily_profit {
            return TradeGate::blocked("daily_profit_target_reached");
        }

        // Below the profit threshold, losses do not block: the account is
        // still hunting for its daily target.
        if global_profit < risk.profit_threshold {
            return TradeGate::allowed();
        }

        let Ok(index_loss) = self.read_counter("loss", index).await else {
            return TradeGate::blocked("store_unavailable");
        };
        let Ok(global_loss) = self.read_counter("loss", GLOBAL_SCOPE).await else {
            return TradeGate::blocked("store_unavailable");
        };

        let index_limit = self.capital * risk.max_daily_loss_pct / 100.0;
        if index_limit > 0.0 && index_loss >= index_limit {
            return TradeGate::blocked("index_loss_limit_reached");
        }

        let global_limit = self.capital * risk.max_global_daily_loss_pct / 100.0;
        if global_limit > 0.0 && global_loss >= global_limit {
            return TradeGate::blocked("global_loss_limit_reached");
        }

        TradeGate::allowed()
    }

    /// Delete today's counters (admin reset).
    pub async fn reset_daily_counters(&self) {
        match self.store.scan_prefix("daily_limits:").await {
            Ok(keys) => {
                for key in keys {
                    let _ = self.store.del(&key).await;
                }
                info!("daily counters reset");
            }
            Err(e) => warn!(error = %e, "daily counter reset failed"),
        }
    }
}

impl std::fmt::Debug for DailyLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DailyLimits")
            .field("capital", &self.capital)
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

    fn limits() -> (Arc<InMemoryKv>, DailyLimits, RiskConfig) {
        let kv = Arc::new(InMemoryKv::new());
        let limits = DailyLimits::new(kv.clone(), 100_000.0);
        let risk = RiskConfig::default(); // target 20k, loss 3% / 5%
        (kv, limits, risk)
    }

    #[tokio::test]
    async fn loss_read_back_is_monotone_sum() {
        let (_, limits, _) = limits();
        limits.record_loss("NIFTY", 500.0).await;
        limits.record_loss("NIFTY", 250.0).await;
        assert!((limits.daily_loss("NIFTY").await - 750.0).abs() < 1e-9);
        assert!((limits.global_loss().await - 750.0).abs() < 1e-9);
        assert!((limits.daily_trades("NIFTY").await - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn clean_slate_allows_trading() {
        let (_, limits, risk) = limits();
        let gate = limits.can_trade("NIFTY", &risk).await;
        assert!(gate.allowed);
        assert_eq!(gate.reason, None);
    }

    #[tokio::test]
    async fn profit_target_hard_blocks() {
        // Scenario: target 20000, profit 19999 -> allowed; +1 -> blocked.
        let (_, limits, risk) = limits();
        limits.record_profit("NIFTY", 19_999.0).await;
        assert!(limits.can_trade("NIFTY", &risk).await.allowed);

        limits.record_profit("NIFTY", 1.0).await;
        let gate = limits.can_trade("NIFTY", &risk).await;
        assert!(!gate.allowed);
        assert_eq!(gate.reason.as_deref(), Some("daily_profit_target_reached"));
    }

    #[tokio::test]
    async fn losses_do_not_block_below_profit_threshold() {
        let (_, limits, risk) = limits();
        // Way past any loss limit, but profit is below the threshold.
        limits.record_loss("NIFTY", 50_000.0).await;
        assert!(limits.can_trade("NIFTY", &risk).await.allowed);
    }

    #[tokio::test]
    async fn losses_block_once_profit_threshold_reached() {
        let (_, limits, mut risk) = limits();
        risk.profit_threshold = 1_000.0;

        limits.record_profit("NIFTY", 1_500.0).await;
        limits.record_loss("NIFTY", 4_000.0).await; // > 3% of 100k
        let gate = limits.can_trade("NIFTY", &risk).await;
        assert!(!gate.allowed);
        assert_eq!(gate.reason.as_deref(), Some("index_loss_limit_reached"));

        // A different index trips only the global check.
        let gate = limits.can_trade("BANKNIFTY", &risk).await;
        assert!(gate.allowed);
    }

    #[tokio::test]
    async fn global_loss_limit() {
        let (_, limits, mut risk) = limits();
        risk.profit_threshold = 0.0;
        limits.record_loss("NIFTY", 3_000.0).await;
        limits.record_loss("BANKNIFTY", 2_500.0).await; // global 5500 > 5%
        let gate = limits.can_trade("SENSEX", &risk).await;
        assert!(!gate.allowed);
        assert_eq!(gate.reason.as_deref(), Some("global_loss_limit_reached"));
    }

    #[tokio::test]
    async fn store_outage_fails_closed() {
        let (kv, limits, risk) = limits();
        kv.set_failing(true);
        let gate = limits.can_trade("NIFTY", &risk).await;
        assert!(!gate.allowed);
        assert_eq!(gate.reason.as_deref(), Some("store_unavailable"));
    }

    #[tokio::test]
    async fn reset_clears_counters() {
        let (_, limits, _) = limits();
        limits.record_profit("NIFTY", 100.0).await;
        limits.reset_daily_counters().await;
        assert_eq!(limits.global_profit().await, 0.0);
    }
}
