// =============================================================================
// Risk manager loop — the driver that refreshes, reconciles, and evaluates
// =============================================================================
//
// One task per process. Each cycle:
//   1. Throttled maintenance (every 5 s): every active tracker has a live
//      position, a feed subscription, and a warm pnl entry.
//   2. Paper LTP refresh, batched by segment behind a circuit breaker.
//   3. Per-cycle cache: one tracker fetch and at most one warm read per
//      tracker per cycle.
//   4. Per position: freshest-price sync, rule evaluation, then trailing.
//   5. Fallback pass: active trackers missing from the cache get SL/TP
//      checks from warm pnl alone.
//   6. Cycle metrics.
//
// One position's failure never halts the others; the loop lives until the
// supervisor flips the stop signal.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cache::{PnlSnapshot, TickCache, WarmCache, WarmPnl};
use crate::config::RuntimeConfig;
use crate::engine::{ExitEngine, TrailingEngine};
use crate::feed::MarketFeedHub;
use crate::positions::{ActiveCache, PositionData, Tracker, TrackerStore};
use crate::rules::{RuleContext, RuleEngine, RuleResult};
use crate::session::{classify_regime, ist_now, TradingSession};
use crate::types::{ExitKind, Segment, Tick, TickKind};

/// Warm PnL older than this is ignored during the sync step.
const WARM_SYNC_MAX_AGE_SECS: i64 = 30;

/// Maintenance cadence inside the loop.
const MAINTENANCE_EVERY: Duration = Duration::from_secs(5);

/// Tracker row is re-persisted when its cached PnL drifts this far (rupees).
const TRACKER_PNL_SYNC_RUPEES: f64 = 1.0;

/// Paper-quote breaker: failures to open, and how long it stays open.
const BREAKER_FAILURE_THRESHOLD: u32 = 5;
const BREAKER_OPEN_FOR: Duration = Duration::from_secs(60);

// =============================================================================
// Loop metrics
// =============================================================================

#[derive(Debug, Default)]
struct CycleTimes {
    count: u64,
    total_ms: u64,
    min_ms: u64,
    max_ms: u64,
}

/// Counters exposed in the ops snapshot.
#[derive(Debug, Default)]
pub struct LoopMetrics {
    pub cycles: AtomicU64,
    pub positions_evaluated: AtomicU64,
    pub db_fetches: AtomicU64,
    pub warm_reads: AtomicU64,
    pub broker_calls: AtomicU64,
    pub exits: AtomicU64,
    pub errors: AtomicU64,
    times: Mutex<CycleTimes>,
}

/// Serialisable metrics view.
#[derive(Debug, Clone, Serialize)]
pub struct LoopMetricsView {
    pub cycles: u64,
    pub positions_evaluated: u64,
    pub db_fetches: u64,
    pub warm_reads: u64,
    pub broker_calls: u64,
    pub exits: u64,
    pub errors: u64,
    pub cycle_ms_min: u64,
    pub cycle_ms_max: u64,
    pub cycle_ms_mean: u64,
}

impl LoopMetrics {
    pub fn record_cycle_time(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let mut times = self.times.lock();
        times.count += 1;
        times.total_ms += ms;
        times.max_ms = times.max_ms.max(ms);
        times.min_ms = if times.count == 1 { ms } else { times.min_ms.min(ms) };
    }

    pub fn view(&self) -> LoopMetricsView {
        let times = self.times.lock();
        LoopMetricsView {
            cycles: self.cycles.load(Ordering::Relaxed),
            positions_evaluated: self.positions_evaluated.load(Ordering::Relaxed),
            db_fetches: self.db_fetches.load(Ordering::Relaxed),
            warm_reads: self.warm_reads.load(Ordering::Relaxed),
            broker_calls: self.broker_calls.load(Ordering::Relaxed),
            exits: self.exits.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            cycle_ms_min: times.min_ms,
            cycle_ms_max: times.max_ms,
            cycle_ms_mean: if times.count > 0 { times.total_ms / times.count } else { 0 },
        }
    }
}

// =============================================================================
// Paper-quote circuit breaker
// =============================================================================

#[derive(Debug, Default)]
struct QuoteBreaker {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl QuoteBreaker {
    /// Closed, or open-but-elapsed (half-open probe).
    fn allow(&self) -> bool {
        match self.open_until {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.open_until = None;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= BREAKER_FAILURE_THRESHOLD {
            self.open_until = Some(Instant::now() + BREAKER_OPEN_FOR);
            warn!(
                failures = self.consecutive_failures,
                "paper quote breaker open for {}s",
                BREAKER_OPEN_FOR.as_secs()
            );
        }
    }
}

// =============================================================================
// RiskManager
// =============================================================================

/// The driver loop and its per-cycle machinery.
pub struct RiskManager {
    config: Arc<RwLock<RuntimeConfig>>,
    trackers: Arc<dyn TrackerStore>,
    active_cache: Arc<ActiveCache>,
    tick_cache: Arc<TickCache>,
    warm: Arc<WarmCache>,
    hub: Option<Arc<MarketFeedHub>>,
    rule_engine: Arc<RuleEngine>,
    exit_engine: Arc<ExitEngine>,
    trailing_engine: Arc<TrailingEngine>,
    quote_gateway: Arc<dyn crate::broker::BrokerGateway>,
    pub metrics: Arc<LoopMetrics>,
    last_maintenance: Mutex<Option<Instant>>,
    last_paper_refresh: Mutex<Option<Instant>>,
    quote_breaker: Mutex<QuoteBreaker>,
}

impl RiskManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<RuntimeConfig>>,
        trackers: Arc<dyn TrackerStore>,
        active_cache: Arc<ActiveCache>,
        tick_cache: Arc<TickCache>,
        warm: Arc<WarmCache>,
        hub: Option<Arc<MarketFeedHub>>,
        rule_engine: Arc<RuleEngine>,
        exit_engine: Arc<ExitEngine>,
        trailing_engine: Arc<TrailingEngine>,
        quote_gateway: Arc<dyn crate::broker::BrokerGateway>,
    ) -> Self {
        Self {
            config,
            trackers,
            active_cache,
            tick_cache,
            warm,
            hub,
            rule_engine,
            exit_engine,
            trailing_engine,
            quote_gateway,
            metrics: Arc::new(LoopMetrics::default()),
            last_maintenance: Mutex::new(None),
            last_paper_refresh: Mutex::new(None),
            quote_breaker: Mutex::new(QuoteBreaker::default()),
        }
    }

    /// Run until the stop signal flips. Spawn once from the supervisor.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        info!("risk manager loop started");
        let mut position_events = self.active_cache.events();

        loop {
            if *stop.borrow() {
                break;
            }

            let started = Instant::now();
            let sleep_for = {
                let now = ist_now();
                let (session, idle_ms, active_ms) = {
                    let config = self.config.read();
                    (
                        TradingSession::from_config(&config),
                        config.risk.loop_interval_idle,
                        config.risk.loop_interval_active,
                    )
                };
                let market_open = session.is_market_open(now);
                let has_positions = !self.active_cache.is_empty();

                if !market_open && !has_positions {
                    // Nothing to protect: sleep long, skip the cycle.
                    Duration::from_secs(60)
                } else {
                    self.run_cycle().await;
                    self.metrics.cycles.fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_cycle_time(started.elapsed());
                    if has_positions {
                        Duration::from_millis(active_ms)
                    } else {
                        Duration::from_millis(idle_ms)
                    }
                }
            };

            // Demand-driven wake-up: a position appearing or vanishing cuts
            // the sleep short so the new state is evaluated promptly.
            let demand_driven = self.config.read().feature_flags.enable_demand_driven_services;
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                event = position_events.recv(), if demand_driven => {
                    if event.is_ok() {
                        debug!("position event — waking driver early");
                    }
                }
                _ = stop.changed() => break,
            }
        }

        info!("risk manager loop stopped");
    }

    /// One full cycle. Public so tests can drive it directly.
    pub async fn run_cycle(&self) {
        let active_trackers = match self.trackers.active().await {
            Ok(trackers) => trackers,
            Err(e) => {
                error!(error = %e, "active tracker query failed — cycle skipped");
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        self.metrics.db_fetches.fetch_add(1, Ordering::Relaxed);

        self.maybe_run_maintenance(&active_trackers).await;
        self.refresh_paper_ltps(&active_trackers).await;

        // Per-cycle caches: each tracker row and each warm pnl entry is read
        // at most once below.
        let tracker_by_id: HashMap<String, Tracker> = active_trackers
            .iter()
            .map(|t| (t.id.clone(), t.clone()))
            .collect();
        let mut warm_pnl_by_id: HashMap<String, Option<WarmPnl>> = HashMap::new();

        let positions = self.active_cache.all_positions();
        for position in &positions {
            let Some(tracker) = tracker_by_id.get(&position.tracker_id) else {
                // Row disappeared (terminal elsewhere); reconciliation will
                // clean the cache entry if it persists.
                continue;
            };
            self.metrics.positions_evaluated.fetch_add(1, Ordering::Relaxed);

            self.refresh_position_price(position, &mut warm_pnl_by_id).await;

            if let Some(fresh) = self.active_cache.get_by_tracker_id(&position.tracker_id) {
                self.evaluate_position(&fresh, tracker).await;
            }
        }

        // Fallback: active trackers with no live snapshot still get SL/TP
        // protection from warm pnl.
        for tracker in &active_trackers {
            if !self.active_cache.contains(&tracker.id) {
                self.fallback_evaluate(tracker, &mut warm_pnl_by_id).await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    async fn maybe_run_maintenance(&self, active_trackers: &[Tracker]) {
        {
            let mut last = self.last_maintenance.lock();
            if last.is_some_and(|at| at.elapsed() < MAINTENANCE_EVERY) {
                return;
            }
            *last = Some(Instant::now());
        }

        for tracker in active_trackers {
            if !self.active_cache.contains(&tracker.id) {
                debug!(tracker_id = %tracker.id, "maintenance: seeding missing position");
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
            }

            if let Some(hub) = &self.hub {
                let key = tracker.instrument_key();
                if !hub.is_subscribed(&key) {
                    debug!(tracker_id = %tracker.id, instrument = %key, "maintenance: resubscribing");
                    hub.subscribe(key);
                }
            }

            if !self.warm.has_pnl(&tracker.id).await {
                if let Some(position) = self.active_cache.get_by_tracker_id(&tracker.id) {
                    self.warm
                        .write_pnl(
                            &tracker.id,
                            PnlSnapshot {
                                pnl: position.pnl,
                                pnl_pct: position.pnl_pct,
                                ltp: position.current_ltp,
                                hwm_pnl: position.high_water_mark,
                                ts: position.last_updated_at,
                            },
                        )
                        .await;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Paper LTP refresh
    // -------------------------------------------------------------------------

    /// Batch-fetch quotes for paper trackers, one request covering every
    /// segment, behind the failure breaker.
    async fn refresh_paper_ltps(&self, active_trackers: &[Tracker]) {
        let mut by_segment: HashMap<Segment, Vec<String>> = HashMap::new();
        for tracker in active_trackers.iter().filter(|t| t.paper) {
            by_segment
                .entry(tracker.segment)
                .or_default()
                .push(tracker.security_id.clone());
        }
        if by_segment.is_empty() {
            return;
        }

        // Throttled to the configured paper cadence, not the loop cadence.
        let refresh_every =
            Duration::from_secs(self.config.read().paper_trading.realtime_interval_seconds.max(1));
        {
            let mut last = self.last_paper_refresh.lock();
            if last.is_some_and(|at| at.elapsed() < refresh_every) {
                return;
            }
            *last = Some(Instant::now());
        }

        if !self.quote_breaker.lock().allow() {
            debug!("paper quote breaker open — refresh skipped");
            return;
        }

        self.metrics
            .broker_calls
            .fetch_add(by_segment.len() as u64, Ordering::Relaxed);

        match self.quote_gateway.ltp_batch(&by_segment).await {
            Ok(prices) => {
                self.quote_breaker.lock().record_success();
                let ts = ist_now().timestamp();
                for (segment, sids) in prices {
                    for (security_id, ltp) in sids {
                        if ltp > 0.0 {
                            self.tick_cache.put(Tick {
                                segment,
                                security_id,
                                ltp,
                                kind: TickKind::Quote,
                                ts,
                            });
                        }
                    }
                }
            }
            Err(e) => {
                self.quote_breaker.lock().record_failure();
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "paper LTP refresh failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Price refresh
    // -------------------------------------------------------------------------

    /// Apply the freshest known price to the position: the hot tick when one
    /// exists, otherwise warm pnl no older than 30 s. The refreshed snapshot
    /// is written back to the warm cache.
    async fn refresh_position_price(
        &self,
        position: &PositionData,
        warm_pnl_by_id: &mut HashMap<String, Option<WarmPnl>>,
    ) {
        let hot_ltp = self.tick_cache.ltp(&position.instrument_key());

        let ltp = match hot_ltp {
            Some(ltp) => Some(ltp),
            None => {
                let warm = self
                    .warm_pnl_cached(&position.tracker_id, warm_pnl_by_id)
                    .await;
                warm.filter(|w| ist_now().timestamp() - w.updated_at <= WARM_SYNC_MAX_AGE_SECS)
                    .map(|w| w.ltp)
                    .filter(|l| *l > 0.0)
            }
        };

        if let Some(ltp) = ltp {
            self.active_cache
                .update(&position.tracker_id, |p| p.apply_ltp(ltp));
        }

        if let Some(fresh) = self.active_cache.get_by_tracker_id(&position.tracker_id) {
            self.warm
                .write_pnl(
                    &fresh.tracker_id,
                    PnlSnapshot {
                        pnl: fresh.pnl,
                        pnl_pct: fresh.pnl_pct,
                        ltp: fresh.current_ltp,
                        hwm_pnl: fresh.high_water_mark,
                        ts: fresh.last_updated_at,
                    },
                )
                .await;
        }
    }

    /// Warm pnl memoised per cycle: one store read per tracker at most.
    async fn warm_pnl_cached(
        &self,
        tracker_id: &str,
        warm_pnl_by_id: &mut HashMap<String, Option<WarmPnl>>,
    ) -> Option<WarmPnl> {
        if let Some(cached) = warm_pnl_by_id.get(tracker_id) {
            return cached.clone();
        }
        self.metrics.warm_reads.fetch_add(1, Ordering::Relaxed);
        let read = self.warm.read_pnl(tracker_id).await;
        warm_pnl_by_id.insert(tracker_id.to_string(), read.clone());
        read
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    async fn evaluate_position(&self, position: &PositionData, tracker: &Tracker) {
        let now = ist_now();
        let (risk, flags, session, slot) = {
            let config = self.config.read();
            let session = TradingSession::from_config(&config);
            let slot = classify_regime(now, &session, &config.time_regimes);
            (config.risk.clone(), config.feature_flags.clone(), session, slot)
        };

        let decision = {
            let ctx = RuleContext {
                position,
                tracker,
                risk: &risk,
                flags: &flags,
                now,
                session: &session,
                regime: &slot,
            };
            self.rule_engine.evaluate(&ctx)
        };

        match decision {
            RuleResult::Exit { kind, reason } => {
                let outcome = self.exit_engine.execute_exit(&tracker.id, kind, &reason).await;
                if outcome.success {
                    self.metrics.exits.fetch_add(1, Ordering::Relaxed);
                    if outcome.inconsistent {
                        error!(
                            tracker_id = %tracker.id,
                            "exit persisted inconsistently — reconciliation required"
                        );
                        self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    }
                } else {
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            RuleResult::NoAction | RuleResult::Skip => {
                self.trailing_engine
                    .process_position(tracker, &self.exit_engine)
                    .await;
                self.sync_tracker_pnl(position, tracker).await;
            }
        }
    }

    /// Persist the tracker's cached PnL when it has drifted noticeably.
    async fn sync_tracker_pnl(&self, position: &PositionData, tracker: &Tracker) {
        if (tracker.last_pnl_rupees - position.pnl).abs() <= TRACKER_PNL_SYNC_RUPEES {
            return;
        }
        let mut row = tracker.clone();
        row.record_pnl(position.pnl, position.pnl_pct);
        if let Err(e) = self.trackers.save(&row).await {
            warn!(tracker_id = %tracker.id, error = %e, "tracker pnl sync failed");
            self.metrics.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// SL/TP-only evaluation for trackers with no live snapshot, driven by
    /// the last warm pnl.
    async fn fallback_evaluate(
        &self,
        tracker: &Tracker,
        warm_pnl_by_id: &mut HashMap<String, Option<WarmPnl>>,
    ) {
        let Some(warm) = self.warm_pnl_cached(&tracker.id, warm_pnl_by_id).await else {
            return;
        };

        let (sl_pct, tp_pct) = {
            let config = self.config.read();
            (config.risk.sl_pct, config.risk.tp_pct)
        };

        let decision = if sl_pct > 0.0 && warm.pnl_pct <= -sl_pct {
            Some((ExitKind::StopLoss, format!("SL HIT {:.2}%", warm.pnl_pct)))
        } else if tp_pct > 0.0 && warm.pnl_pct >= tp_pct {
            Some((ExitKind::TakeProfit, format!("TP HIT {:.2}%", warm.pnl_pct)))
        } else {
            None
        };

        if let Some((kind, reason)) = decision {
            warn!(
                tracker_id = %tracker.id,
                pnl_pct = warm.pnl_pct,
                "fallback exit from warm pnl (no live snapshot)"
            );
            let outcome = self.exit_engine.execute_exit(&tracker.id, kind, &reason).await;
            if outcome.success {
                self.metrics.exits.fetch_add(1, Ordering::Relaxed);
            } else {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("metrics", &self.metrics.view())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{
        BrokerError, BrokerGateway, BrokerPosition, ExitAck, MarketOrderRequest, OrderAck,
        WalletSnapshot,
    };
    use crate::engine::ReentryBook;
    use crate::limits::{DailyLimits, EdgeFailureDetector};
    use crate::positions::{InMemoryTrackerStore, TrackerStatus};
    use crate::store::InMemoryKv;
    use crate::types::{Segment, TradeSide};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;

    struct LoopGateway {
        flatten_calls: AtomicU64,
        quote: Option<f64>,
    }

    #[async_trait]
    impl BrokerGateway for LoopGateway {
        async fn place_market(
            &self,
            _request: &MarketOrderRequest,
        ) -> Result<OrderAck, BrokerError> {
            Ok(OrderAck { order_id: "L-1".to_string() })
        }

        async fn flat_position(
            &self,
            _segment: Segment,
            _security_id: &str,
        ) -> Result<ExitAck, BrokerError> {
            self.flatten_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExitAck { order_id: "L-EXIT".to_string(), exit_price: Some(96.0) })
        }

        async fn position(
            &self,
            _segment: Segment,
            _security_id: &str,
        ) -> Result<Option<BrokerPosition>, BrokerError> {
            Ok(None)
        }

        async fn wallet_snapshot(&self) -> Result<WalletSnapshot, BrokerError> {
            Ok(WalletSnapshot { cash: 0.0, equity: 0.0, mtm: 0.0, exposure: 0.0 })
        }

        async fn ltp_batch(
            &self,
            request: &HashMap<Segment, Vec<String>>,
        ) -> Result<HashMap<Segment, HashMap<String, f64>>, BrokerError> {
            let Some(quote) = self.quote else {
                return Err(BrokerError::Http("quote feed down".to_string()));
            };
            let mut out = HashMap::new();
            for (segment, sids) in request {
                let mut prices = HashMap::new();
                for sid in sids {
                    prices.insert(sid.clone(), quote);
                }
                out.insert(*segment, prices);
            }
            Ok(out)
        }

        async fn amend_protective_stop(
            &self,
            _segment: Segment,
            _security_id: &str,
            _order_no: &str,
            _trigger_price: f64,
        ) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    struct Harness {
        manager: RiskManager,
        trackers: Arc<InMemoryTrackerStore>,
        active_cache: Arc<ActiveCache>,
        tick_cache: Arc<TickCache>,
        warm: Arc<WarmCache>,
        gateway: Arc<LoopGateway>,
    }

    fn harness(quote: Option<f64>) -> Harness {
        let trackers = Arc::new(InMemoryTrackerStore::new());
        let active_cache = Arc::new(ActiveCache::new());
        let tick_cache = Arc::new(TickCache::new());
        let kv = Arc::new(InMemoryKv::new());
        let warm = Arc::new(WarmCache::new(kv.clone()));
        let gateway = Arc::new(LoopGateway { flatten_calls: AtomicU64::new(0), quote });

        // Neutralise the clock-driven rules so cycle tests are deterministic
        // at any wall-clock time; session behaviour has its own tests.
        let mut config = RuntimeConfig::default();
        config.risk.flat_fee_rupees = 0.0;
        config.market_open_hhmm = "00:00".to_string();
        config.market_close_hhmm = "23:59".to_string();
        config.square_off_hhmm = "23:59".to_string();
        config.risk.time_exit_hhmm = String::new();
        let config = Arc::new(RwLock::new(config));

        let daily_limits = Arc::new(DailyLimits::new(kv.clone(), 100_000.0));
        let edge = Arc::new(EdgeFailureDetector::new(kv));
        let reentry = Arc::new(ReentryBook::new());

        let exit_engine = Arc::new(ExitEngine::new(
            trackers.clone(),
            gateway.clone(),
            active_cache.clone(),
            tick_cache.clone(),
            daily_limits,
            edge,
            reentry,
            config.clone(),
        ));
        let trailing_engine = Arc::new(TrailingEngine::new(
            gateway.clone(),
            active_cache.clone(),
            config.clone(),
        ));
        let rule_engine = Arc::new(RuleEngine::with_default_rules(None));

        let manager = RiskManager::new(
            config,
            trackers.clone(),
            active_cache.clone(),
            tick_cache.clone(),
            warm.clone(),
            None,
            rule_engine,
            exit_engine,
            trailing_engine,
            gateway.clone(),
        );

        Harness { manager, trackers, active_cache, tick_cache, warm, gateway }
    }

    async fn seed_active(h: &Harness, entry: f64, qty: i64, paper: bool) -> String {
        let mut tracker = Tracker::new_pending(
            "ORD-1",
            "49081",
            Segment::NseFno,
            "NIFTY25JAN22000CE",
            TradeSide::LongCe,
            qty,
            0.0,
            paper,
        );
        tracker.mark_active(entry, qty);
        let id = tracker.id.clone();
        h.trackers.insert(tracker).await.unwrap();
        h.active_cache.add(PositionData::new(
            id.clone(),
            "49081",
            Segment::NseFno,
            entry,
            qty,
            TradeSide::LongCe.direction(),
        ));
        id
    }

    fn put_tick(h: &Harness, ltp: f64) {
        h.tick_cache.put(Tick {
            segment: Segment::NseFno,
            security_id: "49081".to_string(),
            ltp,
            kind: TickKind::Ticker,
            ts: ist_now().timestamp(),
        });
    }

    #[tokio::test]
    async fn cycle_exits_stop_loss_breach() {
        let h = harness(None);
        let id = seed_active(&h, 100.0, 10, false).await;
        put_tick(&h, 96.0); // -4% breaches the default 2% stop

        h.manager.run_cycle().await;

        let tracker = h.trackers.get(&id).await.unwrap().unwrap();
        assert_eq!(tracker.status, TrackerStatus::Exited);
        assert!(tracker.exit_reason.unwrap().starts_with("SL HIT"));
        assert_eq!(h.gateway.flatten_calls.load(Ordering::SeqCst), 1);
        assert!(!h.active_cache.contains(&id));
        assert_eq!(h.manager.metrics.exits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn cycle_holds_and_writes_warm_pnl() {
        let h = harness(None);
        let id = seed_active(&h, 100.0, 10, false).await;
        put_tick(&h, 101.0); // +1%: inside every band

        h.manager.run_cycle().await;

        let tracker = h.trackers.get(&id).await.unwrap().unwrap();
        assert_eq!(tracker.status, TrackerStatus::Active);

        let warm = h.warm.read_pnl(&id).await.unwrap();
        assert!((warm.pnl - 10.0).abs() < 1e-9);
        assert!((warm.ltp - 101.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn maintenance_seeds_missing_position() {
        let h = harness(None);
        let id = seed_active(&h, 100.0, 10, false).await;
        h.active_cache.remove(&id);
        put_tick(&h, 100.5);

        h.manager.run_cycle().await;
        assert!(h.active_cache.contains(&id));
    }

    #[tokio::test]
    async fn paper_refresh_feeds_tick_cache() {
        let h = harness(Some(103.0));
        let _id = seed_active(&h, 100.0, 10, true).await;

        h.manager.run_cycle().await;

        let key = crate::types::InstrumentKey::new(Segment::NseFno, "49081");
        assert_eq!(h.tick_cache.ltp(&key), Some(103.0));
    }

    #[tokio::test]
    async fn quote_breaker_opens_after_failures() {
        let h = harness(None); // quote RPC always fails
        let _id = seed_active(&h, 100.0, 10, true).await;

        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            // Clear the cadence throttle so each call reaches the gateway.
            *h.manager.last_paper_refresh.lock() = None;
            h.manager.refresh_paper_ltps(&h.trackers.active().await.unwrap()).await;
        }
        assert!(!h.manager.quote_breaker.lock().allow());

        // Further refreshes are skipped while open, so the error count
        // stays at the threshold.
        let errors_before = h.manager.metrics.errors.load(Ordering::Relaxed);
        *h.manager.last_paper_refresh.lock() = None;
        h.manager.refresh_paper_ltps(&h.trackers.active().await.unwrap()).await;
        assert_eq!(h.manager.metrics.errors.load(Ordering::Relaxed), errors_before);
    }

    #[tokio::test]
    async fn fallback_pass_exits_from_warm_pnl() {
        let h = harness(None);
        let id = seed_active(&h, 100.0, 10, false).await;
        // No live snapshot for this tracker.
        h.active_cache.remove(&id);

        // Warm pnl reports a deep stop breach. Seed tick cache so the exit
        // engine can price the exit.
        put_tick(&h, 95.0);
        h.warm
            .write_pnl(
                &id,
                PnlSnapshot { pnl: -50.0, pnl_pct: -5.0, ltp: 95.0, hwm_pnl: 0.0, ts: 0 },
            )
            .await;

        let mut memo = HashMap::new();
        let tracker = h.trackers.get(&id).await.unwrap().unwrap();
        h.manager.fallback_evaluate(&tracker, &mut memo).await;

        let tracker = h.trackers.get(&id).await.unwrap().unwrap();
        assert_eq!(tracker.status, TrackerStatus::Exited);
    }

    #[tokio::test]
    async fn warm_read_memoised_per_cycle() {
        let h = harness(None);
        let id = seed_active(&h, 100.0, 10, false).await;

        let mut memo = HashMap::new();
        h.manager.warm_pnl_cached(&id, &mut memo).await;
        h.manager.warm_pnl_cached(&id, &mut memo).await;
        assert_eq!(h.manager.metrics.warm_reads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn metrics_track_cycle_times() {
        let metrics = LoopMetrics::default();
        metrics.record_cycle_time(Duration::from_millis(10));
        metrics.record_cycle_time(Duration::from_millis(30));
        let view = metrics.view();
        assert_eq!(view.cycle_ms_min, 10);
        assert_eq!(view.cycle_ms_max, 30);
        assert_eq!(view.cycle_ms_mean, 20);
    }
}
