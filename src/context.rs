// =============================================================================
// Engine context — injected replacement for process-wide singletons
// =============================================================================
//
// Every component receives the collaborators it needs through constructors;
// this struct is the wiring record main.rs builds once, plus the snapshot
// assembly for the ops API. Multiple contexts can coexist (tests build
// several per process).
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::cache::{TickCache, WarmCache};
use crate::config::RuntimeConfig;
use crate::engine::{EntryGuard, KillSwitch, LoopMetrics};
use crate::feed::{FeedHealth, MarketFeedHub};
use crate::limits::{DailyLimits, EdgeFailureDetector};
use crate::positions::{ActiveCache, PositionData, TrackerStore};
use crate::session::{classify_regime, ist_now, TradingSession};

/// Shared engine state for the ops surface.
pub struct EngineContext {
    pub state_version: AtomicU64,
    pub config: Arc<RwLock<RuntimeConfig>>,
    pub tick_cache: Arc<TickCache>,
    pub warm: Arc<WarmCache>,
    pub health: Arc<FeedHealth>,
    pub hub: Option<Arc<MarketFeedHub>>,
    pub trackers: Arc<dyn TrackerStore>,
    pub active_cache: Arc<ActiveCache>,
    pub daily_limits: Arc<DailyLimits>,
    pub edge_failure: Arc<EdgeFailureDetector>,
    pub entry_guard: Arc<EntryGuard>,
    pub kill_switch: Arc<KillSwitch>,
    pub loop_metrics: Arc<LoopMetrics>,
    pub start_time: Instant,
}

impl EngineContext {
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Full engine snapshot for `GET /api/v1/state`.
    pub async fn build_snapshot(&self) -> StateSnapshot {
        let now = ist_now();
        let (entries_paused, paper, watchlist, session) = {
            let config = self.config.read();
            (
                config.entries_paused,
                config.paper_trading.enabled,
                config.watchlist.clone(),
                TradingSession::from_config(&config),
            )
        };
        let regime = {
            let config = self.config.read();
            classify_regime(now, &session, &config.time_regimes)
        };

        let feed = FeedSnapshot {
            hub_running: self.hub.as_ref().is_some_and(|h| h.is_running()),
            hub_connected: self.hub.as_ref().is_some_and(|h| h.is_connected()),
            subscriptions: self.hub.as_ref().map(|h| h.subscription_count()).unwrap_or(0),
            feeds: self.health.snapshot(),
            warm_decode_errors: self.warm.decode_errors(),
        };

        let risk = RiskCounters {
            global_profit: self.daily_limits.global_profit().await,
            global_loss: self.daily_limits.global_loss().await,
            entries_paused_by: {
                let mut paused = Vec::new();
                for index in &watchlist {
                    if let Some(pause) = self.edge_failure.entries_paused(index, now).await {
                        paused.push(IndexPause {
                            index: index.clone(),
                            reason: pause.reason,
                            resume_at: pause.resume_at,
                        });
                    }
                }
                paused
            },
        };

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            entries_paused,
            killed: self.kill_switch.is_engaged(),
            paper_trading: paper,
            market_open: session.is_market_open(now),
            regime: regime.regime.name().to_string(),
            watchlist,
            positions: self.active_cache.all_positions(),
            feed,
            risk,
            loop_metrics: self.loop_metrics.view(),
        }
    }

    /// Risk view for `GET /api/v1/risk`: the daily counters and admission
    /// gate per watchlist index, plus the account-wide numbers.
    pub async fn build_risk_report(&self) -> RiskReport {
        let now = ist_now();
        let (risk, watchlist, entries_paused) = {
            let config = self.config.read();
            (config.risk.clone(), config.watchlist.clone(), config.entries_paused)
        };

        let mut indices = Vec::with_capacity(watchlist.len());
        for index in &watchlist {
            let pause = self
                .edge_failure
                .entries_paused(index, now)
                .await
                .map(|p| IndexPause {
                    index: index.clone(),
                    reason: p.reason,
                    resume_at: p.resume_at,
                });
            indices.push(IndexRisk {
                index: index.clone(),
                daily_profit: self.daily_limits.daily_profit(index).await,
                daily_loss: self.daily_limits.daily_loss(index).await,
                daily_trades: self.daily_limits.daily_trades(index).await,
                consecutive_sls: self.edge_failure.consecutive_sls(index).await,
                gate: self.daily_limits.can_trade(index, &risk).await,
                pause,
            });
        }

        RiskReport {
            killed: self.kill_switch.is_engaged(),
            entries_paused,
            global_profit: self.daily_limits.global_profit().await,
            global_loss: self.daily_limits.global_loss().await,
            max_daily_profit: risk.max_daily_profit,
            profit_threshold: risk.profit_threshold,
            indices,
        }
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("state_version", &self.current_state_version())
            .field("positions", &self.active_cache.len())
            .finish()
    }
}

// =============================================================================
// Snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub entries_paused: bool,
    pub killed: bool,
    pub paper_trading: bool,
    pub market_open: bool,
    pub regime: String,
    pub watchlist: Vec<String>,
    pub positions: Vec<PositionData>,
    pub feed: FeedSnapshot,
    pub risk: RiskCounters,
    pub loop_metrics: crate::engine::LoopMetricsView,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedSnapshot {
    pub hub_running: bool,
    pub hub_connected: bool,
    pub subscriptions: usize,
    pub feeds: Vec<crate::feed::FeedStatusView>,
    pub warm_decode_errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskCounters {
    pub global_profit: f64,
    pub global_loss: f64,
    pub entries_paused_by: Vec<IndexPause>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexPause {
    pub index: String,
    pub reason: String,
    pub resume_at: i64,
}

/// Full risk view returned by the dedicated risk endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RiskReport {
    pub killed: bool,
    pub entries_paused: bool,
    pub global_profit: f64,
    pub global_loss: f64,
    pub max_daily_profit: f64,
    pub profit_threshold: f64,
    pub indices: Vec<IndexRisk>,
}

/// Per-index counters and admission gate.
#[derive(Debug, Clone, Serialize)]
pub struct IndexRisk {
    pub index: String,
    pub daily_profit: f64,
    pub daily_loss: f64,
    pub daily_trades: f64,
    pub consecutive_sls: i64,
    pub gate: crate::limits::TradeGate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause: Option<IndexPause>,
}
