// =============================================================================
// Kavach — intraday options risk & execution controller
// =============================================================================
//
// The engine starts with entries paused unless the loaded config says
// otherwise; exits and reconciliation always run. Paper-vs-live order
// routing is chosen here at startup from `paper_trading.enabled`; the API
// toggle marks new trackers and takes full effect on restart.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod broker;
mod cache;
mod config;
mod context;
mod engine;
mod feed;
mod limits;
mod positions;
mod rules;
mod session;
mod store;
mod types;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::{BrokerGateway, DhanGateway, PaperGateway};
use crate::cache::{TickCache, WarmCache};
use crate::config::RuntimeConfig;
use crate::context::EngineContext;
use crate::engine::{
    EntryGuard, ExitEngine, FixedLotAllocator, KillSwitch, ReentryBook, Reconciler, RiskManager,
    StaticInstrumentResolver, Supervisor, TrailingEngine,
};
use crate::feed::{FeedHealth, MarketFeedHub};
use crate::limits::{DailyLimits, EdgeFailureDetector};
use crate::positions::{ActiveCache, InMemoryTrackerStore};
use crate::rules::RuleEngine;
use crate::store::{InMemoryKv, KvStore, RedisKv};

/// Config file location.
const CONFIG_PATH: &str = "kavach_config.json";

/// Fallback capital when the wallet snapshot is unavailable.
const FALLBACK_CAPITAL: f64 = 500_000.0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Kavach Risk Engine — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });
    let paper = config.paper_trading.enabled;
    info!(
        watchlist = ?config.watchlist,
        paper,
        entries_paused = config.entries_paused,
        "runtime configuration ready"
    );
    let config = Arc::new(RwLock::new(config));

    // ── 2. Warm store ────────────────────────────────────────────────────
    let redis_url =
        std::env::var("KAVACH_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".into());
    let kv: Arc<dyn KvStore> = match RedisKv::connect(&redis_url).await {
        Ok(redis) => {
            info!(url = %redis_url, "warm store connected");
            Arc::new(redis)
        }
        Err(e) => {
            // Degraded mode: counters and warm cache live in-process only.
            // Daily limits fail closed on a real outage, but a dead Redis at
            // boot should not keep exits from running.
            warn!(error = %e, "redis unavailable — running with in-memory store");
            Arc::new(InMemoryKv::new())
        }
    };

    // ── 3. Caches & feed plumbing ────────────────────────────────────────
    let tick_cache = Arc::new(TickCache::new());
    let warm = Arc::new(WarmCache::new(kv.clone()));
    let health = Arc::new(FeedHealth::new());
    let active_cache = Arc::new(ActiveCache::new());
    let trackers = Arc::new(InMemoryTrackerStore::new());

    // ── 4. Broker gateways ───────────────────────────────────────────────
    let client_id = std::env::var("DHAN_CLIENT_ID").unwrap_or_default();
    let access_token = std::env::var("DHAN_ACCESS_TOKEN").unwrap_or_default();
    let dhan = Arc::new(DhanGateway::new(client_id.clone(), &access_token));

    let trading_gateway: Arc<dyn BrokerGateway> = if paper {
        info!("paper trading enabled — orders are simulated locally");
        Arc::new(PaperGateway::new(tick_cache.clone()))
    } else {
        dhan.clone()
    };

    // ── 5. Market feed hub ───────────────────────────────────────────────
    let feed_url = std::env::var("DHAN_FEED_URL").unwrap_or_else(|_| {
        format!(
            "wss://api-feed.dhan.co?version=2&token={access_token}&clientId={client_id}&authType=2"
        )
    });
    let hub = Arc::new(MarketFeedHub::new(
        feed_url,
        tick_cache.clone(),
        warm.clone(),
        health.clone(),
    ));
    if !hub.clone().start().await {
        error!("feed hub failed to start — continuing without live ticks");
    }

    // ── 6. Capital & limits ──────────────────────────────────────────────
    let capital = match dhan.wallet_snapshot().await {
        Ok(wallet) if wallet.cash > 0.0 => wallet.cash,
        Ok(_) => FALLBACK_CAPITAL,
        Err(e) => {
            warn!(error = %e, "wallet snapshot unavailable — using fallback capital");
            FALLBACK_CAPITAL
        }
    };
    info!(capital, "loss limits sized from capital");

    let daily_limits = Arc::new(DailyLimits::new(kv.clone(), capital));
    let edge_failure = Arc::new(EdgeFailureDetector::new(kv.clone()));
    let reentry_book = Arc::new(ReentryBook::new());
    let kill_switch = Arc::new(KillSwitch::new());

    // ── 7. Engines ───────────────────────────────────────────────────────
    let exit_engine = Arc::new(ExitEngine::new(
        trackers.clone(),
        trading_gateway.clone(),
        active_cache.clone(),
        tick_cache.clone(),
        daily_limits.clone(),
        edge_failure.clone(),
        reentry_book.clone(),
        config.clone(),
    ));
    let trailing_engine = Arc::new(TrailingEngine::new(
        trading_gateway.clone(),
        active_cache.clone(),
        config.clone(),
    ));
    // The underlying monitor is an external collaborator; without one wired
    // in, the underlying-aware rule simply never joins the set.
    let rule_engine = Arc::new(RuleEngine::with_default_rules(None));

    let resolver = Arc::new(StaticInstrumentResolver::new());
    let entry_guard = Arc::new(EntryGuard::new(
        trackers.clone(),
        trading_gateway.clone(),
        active_cache.clone(),
        tick_cache.clone(),
        daily_limits.clone(),
        edge_failure.clone(),
        resolver,
        Arc::new(FixedLotAllocator { lots: 1 }),
        reentry_book.clone(),
        kill_switch.clone(),
        Some(hub.clone()),
        config.clone(),
        access_token.clone(),
    ));

    let risk_manager = Arc::new(RiskManager::new(
        config.clone(),
        trackers.clone(),
        active_cache.clone(),
        tick_cache.clone(),
        warm.clone(),
        Some(hub.clone()),
        rule_engine,
        exit_engine.clone(),
        trailing_engine,
        trading_gateway.clone(),
    ));

    // ── 8. Shared context & API server ───────────────────────────────────
    let context = Arc::new(EngineContext {
        state_version: AtomicU64::new(1),
        config: config.clone(),
        tick_cache: tick_cache.clone(),
        warm: warm.clone(),
        health: health.clone(),
        hub: Some(hub.clone()),
        trackers: trackers.clone(),
        active_cache: active_cache.clone(),
        daily_limits: daily_limits.clone(),
        edge_failure: edge_failure.clone(),
        entry_guard,
        kill_switch: kill_switch.clone(),
        loop_metrics: risk_manager.metrics.clone(),
        start_time: Instant::now(),
    });

    let supervisor = Arc::new(Supervisor::new());

    {
        let api_context = context.clone();
        let bind_addr =
            std::env::var("KAVACH_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3400".into());
        supervisor.spawn("api", async move {
            let app = api::rest::router(api_context);
            let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(addr = %bind_addr, error = %e, "API server failed to bind");
                    return;
                }
            };
            info!(addr = %bind_addr, "API server listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    // ── 9. Background loops ──────────────────────────────────────────────
    supervisor.spawn("risk_loop", {
        let risk_manager = risk_manager.clone();
        let stop = supervisor.stop_signal();
        async move { risk_manager.run(stop).await }
    });

    supervisor.spawn("reconciler", {
        let reconciler = Arc::new(Reconciler::new(
            trackers.clone(),
            active_cache.clone(),
            warm.clone(),
            Some(hub.clone()),
        ));
        let stop = supervisor.stop_signal();
        async move { reconciler.run(stop).await }
    });

    supervisor.spawn("pruner", {
        let stop = supervisor.stop_signal();
        let tick_cache = tick_cache.clone();
        let warm = warm.clone();
        let active_cache = active_cache.clone();
        async move { engine::run_prune_loop(tick_cache, warm, active_cache, stop).await }
    });

    if !paper {
        let order_ws_url = std::env::var("DHAN_ORDER_WS_URL")
            .unwrap_or_else(|_| "wss://api-order-update.dhan.co".into());
        supervisor.spawn("order_updates", {
            let trackers = trackers.clone();
            let active_cache = active_cache.clone();
            let hub = hub.clone();
            let mut stop = supervisor.stop_signal();
            async move {
                loop {
                    tokio::select! {
                        result = broker::order_updates::run_order_update_stream(
                            &order_ws_url,
                            trackers.clone(),
                            active_cache.clone(),
                            hub.clone(),
                        ) => {
                            if let Err(e) = result {
                                error!(error = %e, "order-update stream error — reconnecting in 5s");
                            }
                        }
                        _ = stop.changed() => return,
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
                        _ = stop.changed() => return,
                    }
                }
            }
        });
    }

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    supervisor.stop().await;
    hub.stop();

    if let Err(e) = config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Kavach shut down complete");
    Ok(())
}
