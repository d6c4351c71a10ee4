// =============================================================================
// Entry guard — admission control and order placement for new signal picks
// =============================================================================
//
// Every gate failure is captured as a typed rejection and reported as a
// `false` admission — nothing here raises across the public boundary. The
// order of checks is fixed: instrument, pause gates, session/regime gates,
// daily limits, exposure/pyramiding, cooldown, LTP, quantity, order.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{info, warn};

use crate::broker::{client_order_id, BrokerGateway, MarketOrderRequest};
use crate::cache::TickCache;
use crate::config::RuntimeConfig;
use crate::feed::MarketFeedHub;
use crate::limits::{DailyLimits, EdgeFailureDetector};
use crate::positions::{ActiveCache, Tracker, TrackerStore};
use crate::session::{classify_regime, ist_now, TradingSession};
use crate::types::{index_of_symbol, PositionDirection, Segment, TradeSide, TransactionType};

// ---------------------------------------------------------------------------
// External collaborator contracts
// ---------------------------------------------------------------------------

/// A tradeable instrument from the instrument master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instrument {
    pub security_id: String,
    pub segment: Segment,
    pub symbol: String,
    pub lot_size: i64,
}

/// Resolves `(segment, security_id, symbol)` against the instrument master.
pub trait InstrumentResolver: Send + Sync {
    fn resolve(&self, segment: Segment, security_id: &str) -> Option<Instrument>;
}

/// Static in-memory resolver (tests, standalone runs).
#[derive(Debug, Default)]
pub struct StaticInstrumentResolver {
    instruments: RwLock<HashMap<(Segment, String), Instrument>>,
}

impl StaticInstrumentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, instrument: Instrument) {
        self.instruments.write().insert(
            (instrument.segment, instrument.security_id.clone()),
            instrument,
        );
    }
}

impl InstrumentResolver for StaticInstrumentResolver {
    fn resolve(&self, segment: Segment, security_id: &str) -> Option<Instrument> {
        self.instruments
            .read()
            .get(&(segment, security_id.to_string()))
            .cloned()
    }
}

/// Position-sizing contract; the capital model lives outside the core.
pub trait CapitalAllocator: Send + Sync {
    fn quantity(&self, instrument: &Instrument, ltp: f64, scale_multiplier: f64) -> i64;
}

/// Allocates a fixed number of lots, scaled by the pick's multiplier.
#[derive(Debug, Clone, Copy)]
pub struct FixedLotAllocator {
    pub lots: i64,
}

impl CapitalAllocator for FixedLotAllocator {
    fn quantity(&self, instrument: &Instrument, _ltp: f64, scale_multiplier: f64) -> i64 {
        let lots = ((self.lots as f64) * scale_multiplier).floor() as i64;
        lots.max(0) * instrument.lot_size
    }
}

// ---------------------------------------------------------------------------
// Kill switch
// ---------------------------------------------------------------------------

/// Operator kill switch. Engaged, it blocks every new entry until manually
/// cleared; exits and reconciliation keep running regardless.
#[derive(Debug, Default)]
pub struct KillSwitch {
    engaged: std::sync::atomic::AtomicBool,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engage(&self) {
        self.engaged.store(true, std::sync::atomic::Ordering::SeqCst);
        warn!("kill switch engaged — all new entries blocked");
    }

    pub fn clear(&self) {
        self.engaged.store(false, std::sync::atomic::Ordering::SeqCst);
        info!("kill switch cleared");
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(std::sync::atomic::Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Re-entry bookkeeping
// ---------------------------------------------------------------------------

/// Per-symbol timestamps of the most recent exit, feeding the cooldown gate.
#[derive(Debug, Default)]
pub struct ReentryBook {
    last_exit: Mutex<HashMap<String, i64>>,
}

impl ReentryBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_exit(&self, symbol: &str) {
        self.last_exit
            .lock()
            .insert(symbol.to_string(), Utc::now().timestamp());
    }

    /// Test hook: backdate a symbol's last exit.
    pub fn record_exit_at(&self, symbol: &str, epoch: i64) {
        self.last_exit.lock().insert(symbol.to_string(), epoch);
    }

    pub fn cooldown_active(&self, symbol: &str, cooldown_secs: u64, now_epoch: i64) -> bool {
        self.last_exit
            .lock()
            .get(symbol)
            .is_some_and(|&last| now_epoch - last < cooldown_secs as i64)
    }
}

// ---------------------------------------------------------------------------
// Signal pick
// ---------------------------------------------------------------------------

/// What a strategy hands the guard.
#[derive(Debug, Clone)]
pub struct SignalPick {
    pub security_id: String,
    pub segment: Segment,
    pub symbol: String,
    /// LTP observed by the signal source, when it has one.
    pub ltp: Option<f64>,
    /// ADX of the underlying, when the signal source computed one. The core
    /// never computes indicators itself.
    pub adx: Option<f64>,
}

/// Typed admission failure; every variant maps to a `false` admission.
#[derive(Debug, Error, PartialEq)]
pub enum EntryRejected {
    #[error("instrument not found")]
    InstrumentNotFound,
    #[error("entries paused: {0}")]
    Paused(String),
    #[error("market closed")]
    MarketClosed,
    #[error("after entry cutoff")]
    AfterCutoff,
    #[error("regime blocks entries")]
    RegimeBlocked,
    #[error("trend too weak for regime (adx below minimum)")]
    WeakTrend,
    #[error("daily limit: {0}")]
    DailyLimit(String),
    #[error("exposure limit reached")]
    Exposure,
    #[error("pyramiding conditions not met")]
    Pyramiding,
    #[error("cooldown active")]
    Cooldown,
    #[error("no usable LTP")]
    NoLtp,
    #[error("allocator returned zero quantity")]
    ZeroQuantity,
    #[error("order placement failed: {0}")]
    OrderFailed(String),
}

// ---------------------------------------------------------------------------
// EntryGuard
// ---------------------------------------------------------------------------

/// Admission controller for new entries.
pub struct EntryGuard {
    trackers: Arc<dyn TrackerStore>,
    gateway: Arc<dyn BrokerGateway>,
    active_cache: Arc<ActiveCache>,
    tick_cache: Arc<TickCache>,
    daily_limits: Arc<DailyLimits>,
    edge_failure: Arc<EdgeFailureDetector>,
    resolver: Arc<dyn InstrumentResolver>,
    allocator: Arc<dyn CapitalAllocator>,
    reentry_book: Arc<ReentryBook>,
    kill_switch: Arc<KillSwitch>,
    hub: Option<Arc<MarketFeedHub>>,
    config: Arc<RwLock<RuntimeConfig>>,
    /// Broker API key; its first characters key the client order id.
    api_key: String,
}

impl EntryGuard {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trackers: Arc<dyn TrackerStore>,
        gateway: Arc<dyn BrokerGateway>,
        active_cache: Arc<ActiveCache>,
        tick_cache: Arc<TickCache>,
        daily_limits: Arc<DailyLimits>,
        edge_failure: Arc<EdgeFailureDetector>,
        resolver: Arc<dyn InstrumentResolver>,
        allocator: Arc<dyn CapitalAllocator>,
        reentry_book: Arc<ReentryBook>,
        kill_switch: Arc<KillSwitch>,
        hub: Option<Arc<MarketFeedHub>>,
        config: Arc<RwLock<RuntimeConfig>>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            trackers,
            gateway,
            active_cache,
            tick_cache,
            daily_limits,
            edge_failure,
            resolver,
            allocator,
            reentry_book,
            kill_switch,
            hub,
            config,
            api_key: api_key.into(),
        }
    }

    /// Admit a pick. All failures are logged and reported as `false`.
    pub async fn try_enter(
        &self,
        pick: &SignalPick,
        direction: PositionDirection,
        scale_multiplier: f64,
    ) -> bool {
        match self.admit(pick, direction, scale_multiplier).await {
            Ok(tracker) => {
                info!(
                    tracker_id = %tracker.id,
                    symbol = %tracker.symbol,
                    side = %tracker.side,
                    qty = tracker.quantity,
                    order_no = %tracker.order_no,
                    "entry admitted — tracker pending"
                );
                true
            }
            Err(rejection) => {
                warn!(
                    symbol = %pick.symbol,
                    direction = %direction,
                    reason = %rejection,
                    "entry rejected"
                );
                false
            }
        }
    }

    async fn admit(
        &self,
        pick: &SignalPick,
        direction: PositionDirection,
        scale_multiplier: f64,
    ) -> Result<Tracker, EntryRejected> {
        // 1. Instrument must exist.
        let instrument = self
            .resolver
            .resolve(pick.segment, &pick.security_id)
            .ok_or(EntryRejected::InstrumentNotFound)?;

        let now = ist_now();
        let (risk, session, slot, paused) = {
            let config = self.config.read();
            let session = TradingSession::from_config(&config);
            let slot = classify_regime(now, &session, &config.time_regimes);
            (config.risk.clone(), session, slot, config.entries_paused)
        };

        // 2. Kill switch, operator pause, and session gates.
        if self.kill_switch.is_engaged() {
            return Err(EntryRejected::Paused("kill_switch".to_string()));
        }
        if paused {
            return Err(EntryRejected::Paused("operator".to_string()));
        }
        if !session.is_market_open(now) {
            return Err(EntryRejected::MarketClosed);
        }
        if session.after_entry_cutoff(now) {
            return Err(EntryRejected::AfterCutoff);
        }
        if !slot.allow_entries() {
            return Err(EntryRejected::RegimeBlocked);
        }
        let min_adx = slot.min_adx();
        if min_adx > 0.0 && pick.adx.is_some_and(|adx| adx < min_adx) {
            return Err(EntryRejected::WeakTrend);
        }

        // 3. Daily limits and edge-failure pauses.
        let index = index_of_symbol(&pick.symbol);
        let gate = self.daily_limits.can_trade(index, &risk).await;
        if !gate.allowed {
            return Err(EntryRejected::DailyLimit(
                gate.reason.unwrap_or_else(|| "blocked".to_string()),
            ));
        }
        if let Some(pause) = self.edge_failure.entries_paused(index, now).await {
            return Err(EntryRejected::Paused(pause.reason));
        }

        // 4. Exposure and pyramiding.
        let side = match direction {
            PositionDirection::Bullish => TradeSide::LongCe,
            PositionDirection::Bearish => TradeSide::LongPe,
        };
        self.check_exposure(&instrument, side, &risk, slot.allow_runners(), now.timestamp())
            .await?;

        // 5. Cooldown.
        if self
            .reentry_book
            .cooldown_active(&pick.symbol, risk.cooldown_sec, now.timestamp())
        {
            return Err(EntryRejected::Cooldown);
        }

        // 6. LTP: prefer the pick's, fall back to the broker quote when the
        // feed is disconnected or the pick carries none.
        let ltp = self.resolve_ltp(pick).await?;

        // 7. Quantity.
        let quantity = self.allocator.quantity(&instrument, ltp, scale_multiplier);
        if quantity <= 0 {
            return Err(EntryRejected::ZeroQuantity);
        }

        // 8. Market buy with the compact client order id.
        let request = MarketOrderRequest {
            segment: instrument.segment,
            security_id: instrument.security_id.clone(),
            transaction_type: TransactionType::Buy,
            quantity,
            client_order_id: client_order_id(&self.api_key, &instrument.security_id, now.timestamp()),
        };
        let ack = self
            .gateway
            .place_market(&request)
            .await
            .map_err(|e| EntryRejected::OrderFailed(e.to_string()))?;

        let paper = self.config.read().paper_trading.enabled;
        let tracker = Tracker::new_pending(
            ack.order_id,
            instrument.security_id.clone(),
            instrument.segment,
            instrument.symbol.clone(),
            side,
            quantity,
            ltp,
            paper,
        );
        self.trackers
            .insert(tracker.clone())
            .await
            .map_err(|e| EntryRejected::OrderFailed(e.to_string()))?;

        if let Some(hub) = &self.hub {
            hub.subscribe(tracker.instrument_key());
        }

        self.daily_limits.record_trade(index).await;
        Ok(tracker)
    }

    /// Same-(instrument, side) exposure: below `max_same_side`, and a second
    /// position only when the first has been profitable for long enough.
    async fn check_exposure(
        &self,
        instrument: &Instrument,
        side: TradeSide,
        risk: &crate::config::RiskConfig,
        allow_runners: bool,
        now_epoch: i64,
    ) -> Result<(), EntryRejected> {
        let active = self
            .trackers
            .active()
            .await
            .map_err(|e| EntryRejected::OrderFailed(e.to_string()))?;

        let same_side: Vec<_> = active
            .iter()
            .filter(|t| {
                t.security_id == instrument.security_id
                    && t.segment == instrument.segment
                    && t.side == side
            })
            .collect();

        if same_side.len() as u32 >= risk.max_same_side {
            return Err(EntryRejected::Exposure);
        }

        if same_side.len() == 1 {
            // Pyramiding: allowed only in runner-friendly regimes, and the
            // existing position must be in profit and have stayed there for
            // the configured hold.
            if !allow_runners {
                return Err(EntryRejected::Pyramiding);
            }
            let first = same_side[0];
            let position = self
                .active_cache
                .get_by_tracker_id(&first.id)
                .ok_or(EntryRejected::Pyramiding)?;
            let held_long_enough = position
                .profitable_since
                .is_some_and(|since| now_epoch - since >= risk.pyramid_min_profit_secs as i64);
            if position.pnl <= 0.0 || !held_long_enough {
                return Err(EntryRejected::Pyramiding);
            }
        }

        Ok(())
    }

    async fn resolve_ltp(&self, pick: &SignalPick) -> Result<f64, EntryRejected> {
        let feed_connected = self.hub.as_ref().is_some_and(|h| h.is_connected());

        if let Some(ltp) = pick.ltp.filter(|l| *l > 0.0) {
            if feed_connected {
                return Ok(ltp);
            }
        }

        // Hot cache next — the hub may have ticks even when the pick is bare.
        if feed_connected {
            if let Some(ltp) = self
                .tick_cache
                .ltp(&crate::types::InstrumentKey::new(pick.segment, pick.security_id.clone()))
            {
                return Ok(ltp);
            }
        }

        // Feed down or no price known: one bounded quote RPC.
        let mut request = HashMap::new();
        request.insert(pick.segment, vec![pick.security_id.clone()]);
        match self.gateway.ltp_batch(&request).await {
            Ok(response) => {
                let ltp = response
                    .get(&pick.segment)
                    .and_then(|m| m.get(&pick.security_id))
                    .copied()
                    .unwrap_or(0.0);
                if ltp > 0.0 {
                    Ok(ltp)
                } else {
                    // Last resort: the pick's own price even with a dead feed.
                    pick.ltp.filter(|l| *l > 0.0).ok_or(EntryRejected::NoLtp)
                }
            }
            Err(_) => pick.ltp.filter(|l| *l > 0.0).ok_or(EntryRejected::NoLtp),
        }
    }
}

impl std::fmt::Debug for EntryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryGuard").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, BrokerPosition, ExitAck, OrderAck, WalletSnapshot};
    use crate::positions::{InMemoryTrackerStore, PositionData, TrackerStatus};
    use crate::store::InMemoryKv;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    struct MockGateway {
        orders: AtomicU64,
        reject: AtomicBool,
        quote: Option<f64>,
    }

    impl MockGateway {
        fn new(quote: Option<f64>) -> Self {
            Self { orders: AtomicU64::new(0), reject: AtomicBool::new(false), quote }
        }
    }

    #[async_trait]
    impl BrokerGateway for MockGateway {
        async fn place_market(
            &self,
            _request: &MarketOrderRequest,
        ) -> Result<OrderAck, BrokerError> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(BrokerError::Rejected("margin".to_string()));
            }
            let n = self.orders.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(OrderAck { order_id: format!("ORD-{n}") })
        }

        async fn flat_position(
            &self,
            _segment: Segment,
            _security_id: &str,
        ) -> Result<ExitAck, BrokerError> {
            Err(BrokerError::Http("unused".to_string()))
        }

        async fn position(
            &self,
            _segment: Segment,
            _security_id: &str,
        ) -> Result<Option<BrokerPosition>, BrokerError> {
            Ok(None)
        }

        async fn wallet_snapshot(&self) -> Result<WalletSnapshot, BrokerError> {
            Ok(WalletSnapshot { cash: 100_000.0, equity: 100_000.0, mtm: 0.0, exposure: 0.0 })
        }

        async fn ltp_batch(
            &self,
            request: &HashMap<Segment, Vec<String>>,
        ) -> Result<HashMap<Segment, HashMap<String, f64>>, BrokerError> {
            let mut out = HashMap::new();
            if let Some(ltp) = self.quote {
                for (segment, sids) in request {
                    let mut prices = HashMap::new();
                    for sid in sids {
                        prices.insert(sid.clone(), ltp);
                    }
                    out.insert(*segment, prices);
                }
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
        guard: EntryGuard,
        gateway: Arc<MockGateway>,
        trackers: Arc<InMemoryTrackerStore>,
        active_cache: Arc<ActiveCache>,
        reentry: Arc<ReentryBook>,
        kill_switch: Arc<KillSwitch>,
        config: Arc<RwLock<RuntimeConfig>>,
    }

    /// Entries require an in-session IST clock. Skip time-gated assertions
    /// outside market hours rather than flaking.
    fn in_session_now() -> bool {
        let config = RuntimeConfig::default();
        let session = TradingSession::from_config(&config);
        let now = ist_now();
        session.is_market_open(now) && !session.after_entry_cutoff(now)
    }

    fn harness(quote: Option<f64>) -> Harness {
        let trackers = Arc::new(InMemoryTrackerStore::new());
        let gateway = Arc::new(MockGateway::new(quote));
        let active_cache = Arc::new(ActiveCache::new());
        let tick_cache = Arc::new(TickCache::new());
        let kv = Arc::new(InMemoryKv::new());
        let daily_limits = Arc::new(DailyLimits::new(kv.clone(), 100_000.0));
        let edge = Arc::new(EdgeFailureDetector::new(kv));
        let resolver = Arc::new(StaticInstrumentResolver::new());
        resolver.add(Instrument {
            security_id: "49081".to_string(),
            segment: Segment::NseFno,
            symbol: "NIFTY25JAN22000CE".to_string(),
            lot_size: 75,
        });
        let reentry = Arc::new(ReentryBook::new());

        // Widen every time gate so admission tests do not depend on the
        // wall clock; the dedicated session tests cover time behaviour.
        let mut cfg = RuntimeConfig::default();
        cfg.market_open_hhmm = "00:00".to_string();
        cfg.market_close_hhmm = "23:59".to_string();
        cfg.risk.entry_cutoff_hhmm = "23:59".to_string();
        for params in cfg.time_regimes.values_mut() {
            params.allow_entries = true;
            params.allow_runners = true;
            params.min_adx = 0.0;
        }
        let config = Arc::new(RwLock::new(cfg));

        let kill_switch = Arc::new(KillSwitch::new());
        let guard = EntryGuard::new(
            trackers.clone(),
            gateway.clone(),
            active_cache.clone(),
            tick_cache,
            daily_limits,
            edge,
            resolver,
            Arc::new(FixedLotAllocator { lots: 1 }),
            reentry.clone(),
            kill_switch.clone(),
            None,
            config.clone(),
            "abcd1234",
        );

        Harness { guard, gateway, trackers, active_cache, reentry, kill_switch, config }
    }

    fn pick() -> SignalPick {
        SignalPick {
            security_id: "49081".to_string(),
            segment: Segment::NseFno,
            symbol: "NIFTY25JAN22000CE".to_string(),
            ltp: Some(145.0),
            adx: None,
        }
    }

    #[tokio::test]
    async fn happy_path_creates_pending_tracker() {
        let h = harness(Some(145.0));
        assert!(h.guard.try_enter(&pick(), PositionDirection::Bullish, 1.0).await);

        let active = h.trackers.get_many(&[]).await.unwrap();
        assert!(active.is_empty()); // get_many with no ids
        assert_eq!(h.trackers.len(), 1);
        assert_eq!(h.gateway.orders.load(Ordering::SeqCst), 1);

        let stored = h.trackers.find_by_order_no("ORD-1").await.unwrap().unwrap();
        assert_eq!(stored.status, TrackerStatus::Pending);
        assert_eq!(stored.side, TradeSide::LongCe);
        assert_eq!(stored.quantity, 75);
    }

    #[tokio::test]
    async fn bearish_direction_buys_puts() {
        let h = harness(Some(145.0));
        assert!(h.guard.try_enter(&pick(), PositionDirection::Bearish, 1.0).await);
        let stored = h.trackers.find_by_order_no("ORD-1").await.unwrap().unwrap();
        assert_eq!(stored.side, TradeSide::LongPe);
    }

    #[tokio::test]
    async fn unknown_instrument_rejected() {
        let h = harness(Some(145.0));
        let mut bad = pick();
        bad.security_id = "99999".to_string();
        assert!(!h.guard.try_enter(&bad, PositionDirection::Bullish, 1.0).await);
        assert_eq!(h.gateway.orders.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cooldown_blocks_then_lifts() {
        let h = harness(Some(145.0));
        let now = Utc::now().timestamp();

        // Exit 5 s ago with a 30 s cooldown: blocked.
        h.reentry.record_exit_at("NIFTY25JAN22000CE", now - 5);
        assert!(!h.guard.try_enter(&pick(), PositionDirection::Bullish, 1.0).await);

        // 31 s ago: admitted.
        h.reentry.record_exit_at("NIFTY25JAN22000CE", now - 31);
        assert!(h.guard.try_enter(&pick(), PositionDirection::Bullish, 1.0).await);
    }

    #[tokio::test]
    async fn exposure_cap_blocks_second_without_pyramiding() {
        let h = harness(Some(145.0));
        assert!(h.guard.try_enter(&pick(), PositionDirection::Bullish, 1.0).await);

        // Activate the first tracker; its position is flat, so pyramiding
        // conditions fail and the second entry is rejected.
        let mut first = h.trackers.find_by_order_no("ORD-1").await.unwrap().unwrap();
        first.mark_active(145.0, 75);
        h.trackers.save(&first).await.unwrap();
        h.active_cache.add(PositionData::new(
            first.id.clone(),
            "49081",
            Segment::NseFno,
            145.0,
            75,
            PositionDirection::Bullish,
        ));

        assert!(!h.guard.try_enter(&pick(), PositionDirection::Bullish, 1.0).await);
    }

    #[tokio::test]
    async fn pyramiding_admits_profitable_seasoned_first_position() {
        let h = harness(Some(145.0));
        assert!(h.guard.try_enter(&pick(), PositionDirection::Bullish, 1.0).await);

        let mut first = h.trackers.find_by_order_no("ORD-1").await.unwrap().unwrap();
        first.mark_active(145.0, 75);
        h.trackers.save(&first).await.unwrap();

        let mut position = PositionData::new(
            first.id.clone(),
            "49081",
            Segment::NseFno,
            145.0,
            75,
            PositionDirection::Bullish,
        );
        position.apply_ltp(150.0);
        // Profitable for six minutes already.
        position.profitable_since = Some(Utc::now().timestamp() - 360);
        h.active_cache.add(position);

        assert!(h.guard.try_enter(&pick(), PositionDirection::Bullish, 1.0).await);

        // A third same-side position is past max_same_side.
        let mut second = h.trackers.find_by_order_no("ORD-2").await.unwrap().unwrap();
        second.mark_active(146.0, 75);
        h.trackers.save(&second).await.unwrap();
        assert!(!h.guard.try_enter(&pick(), PositionDirection::Bullish, 1.0).await);
    }

    #[tokio::test]
    async fn missing_ltp_falls_back_to_quote_rpc() {
        let h = harness(Some(151.5));
        let mut bare = pick();
        bare.ltp = None;
        assert!(h.guard.try_enter(&bare, PositionDirection::Bullish, 1.0).await);

        let stored = h.trackers.find_by_order_no("ORD-1").await.unwrap().unwrap();
        assert!((stored.entry_price - 151.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn no_ltp_anywhere_rejects() {
        let h = harness(None);
        let mut bare = pick();
        bare.ltp = None;
        assert!(!h.guard.try_enter(&bare, PositionDirection::Bullish, 1.0).await);
    }

    #[tokio::test]
    async fn zero_scale_rejects_on_quantity() {
        let h = harness(Some(145.0));
        assert!(!h.guard.try_enter(&pick(), PositionDirection::Bullish, 0.0).await);
    }

    #[tokio::test]
    async fn broker_rejection_creates_no_tracker() {
        let h = harness(Some(145.0));
        h.gateway.reject.store(true, Ordering::SeqCst);
        assert!(!h.guard.try_enter(&pick(), PositionDirection::Bullish, 1.0).await);
        assert!(h.trackers.is_empty());
    }

    #[tokio::test]
    async fn regime_min_adx_gates_weak_signals() {
        let h = harness(Some(145.0));
        {
            // Stretch one regime over the whole day so classification is
            // clock-independent, and demand a trend.
            let mut cfg = h.config.write();
            cfg.time_regimes.clear();
            let mut params = RuntimeConfig::default()
                .time_regimes
                .get("trend_continuation")
                .cloned()
                .unwrap();
            params.start = "00:00".to_string();
            params.end = "23:59".to_string();
            params.allow_entries = true;
            params.min_adx = 25.0;
            cfg.time_regimes.insert("trend_continuation".to_string(), params);
        }

        let mut weak = pick();
        weak.adx = Some(12.0);
        assert!(!h.guard.try_enter(&weak, PositionDirection::Bullish, 1.0).await);

        let mut strong = pick();
        strong.adx = Some(31.0);
        assert!(h.guard.try_enter(&strong, PositionDirection::Bullish, 1.0).await);
    }

    #[tokio::test]
    async fn operator_pause_blocks() {
        let h = harness(Some(145.0));
        h.config.write().entries_paused = true;
        assert!(!h.guard.try_enter(&pick(), PositionDirection::Bullish, 1.0).await);
    }

    #[tokio::test]
    async fn kill_switch_blocks_until_cleared() {
        let h = harness(Some(145.0));
        h.kill_switch.engage();
        assert!(!h.guard.try_enter(&pick(), PositionDirection::Bullish, 1.0).await);
        assert!(h.trackers.is_empty());

        h.kill_switch.clear();
        assert!(h.guard.try_enter(&pick(), PositionDirection::Bullish, 1.0).await);
    }

    #[tokio::test]
    async fn session_gates_apply_on_real_clock() {
        // With the real default session config, admission depends on the
        // wall clock; outside hours it must reject.
        let h = harness(Some(145.0));
        *h.config.write() = RuntimeConfig::default();
        let admitted = h.guard.try_enter(&pick(), PositionDirection::Bullish, 1.0).await;
        if !in_session_now() {
            assert!(!admitted);
        }
    }
}
