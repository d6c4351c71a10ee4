// =============================================================================
// Market Feed Hub — single streaming connection with fan-out
// =============================================================================
//
// Exactly one upstream WebSocket connection exists while the hub is running;
// reconnection happens inside the writer task and is invisible to callers.
// Ticks fan out over a tokio broadcast channel: a lagging consumer loses its
// oldest ticks (logged), never back-pressures the feed.
//
// Subscription requests are JSON frames capped at 100 instruments per
// message; oversize lists are split. Subscribing twice is a no-op.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::cache::{TickCache, WarmCache};
use crate::feed::FeedHealth;
use crate::types::{InstrumentKey, Segment, Tick, TickKind};

/// Feed name under which tick freshness is tracked.
pub const TICKS_FEED: &str = "ticks";

/// Max instruments per subscription frame; larger lists are split.
const SUBSCRIBE_BATCH_CAP: usize = 100;

/// Subscribe / unsubscribe request codes on the wire.
const REQUEST_CODE_SUBSCRIBE: u8 = 15;
const REQUEST_CODE_UNSUBSCRIBE: u8 = 16;

/// The hub considers itself connected if the transport is up or a tick was
/// seen within this window.
const CONNECTED_TICK_WINDOW: Duration = Duration::from_secs(30);

/// Tick freshness threshold registered with [`FeedHealth`].
const TICKS_STALE_AFTER: Duration = Duration::from_secs(30);

/// Capacity of the broadcast fan-out; a consumer further behind than this
/// starts losing ticks.
const BROADCAST_CAPACITY: usize = 2_048;

/// Capacity of the best-effort warm-write queue.
const WARM_QUEUE_CAPACITY: usize = 1_024;

enum HubCommand {
    Subscribe(Vec<InstrumentKey>),
    Unsubscribe(Vec<InstrumentKey>),
    Shutdown,
}

/// Single-writer, multi-reader streaming gateway.
pub struct MarketFeedHub {
    ws_url: String,
    tick_cache: Arc<TickCache>,
    warm: Arc<WarmCache>,
    health: Arc<FeedHealth>,

    subscriptions: RwLock<HashSet<InstrumentKey>>,
    tick_tx: broadcast::Sender<Tick>,
    cmd_tx: RwLock<Option<mpsc::Sender<HubCommand>>>,

    running: AtomicBool,
    transport_connected: AtomicBool,
    last_tick_at: RwLock<Option<Instant>>,
}

impl MarketFeedHub {
    pub fn new(
        ws_url: impl Into<String>,
        tick_cache: Arc<TickCache>,
        warm: Arc<WarmCache>,
        health: Arc<FeedHealth>,
    ) -> Self {
        let (tick_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        health.register(TICKS_FEED, TICKS_STALE_AFTER);
        Self {
            ws_url: ws_url.into(),
            tick_cache,
            warm,
            health,
            subscriptions: RwLock::new(HashSet::new()),
            tick_tx,
            cmd_tx: RwLock::new(None),
            running: AtomicBool::new(false),
            transport_connected: AtomicBool::new(false),
            last_tick_at: RwLock::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Connect and spawn the writer task. Returns `false` (after a full
    /// teardown) when the initial connection cannot be established.
    pub async fn start(self: Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("feed hub start called while already running");
            return true;
        }

        let ws_stream = match tokio_tungstenite::connect_async(&self.ws_url).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                error!(url = %self.ws_url, error = %e, "feed hub initial connect failed");
                self.health.mark_error(TICKS_FEED, e.to_string());
                self.running.store(false, Ordering::SeqCst);
                *self.cmd_tx.write() = None;
                return false;
            }
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        *self.cmd_tx.write() = Some(cmd_tx);

        // Best-effort warm writer: the feed loop enqueues and never waits.
        let (warm_tx, warm_rx) = mpsc::channel::<Tick>(WARM_QUEUE_CAPACITY);
        tokio::spawn(run_warm_writer(self.warm.clone(), warm_rx));

        let hub = Arc::clone(&self);
        tokio::spawn(async move {
            hub.run_connection_loop(Some(ws_stream), cmd_rx, warm_tx).await;
        });

        info!(url = %self.ws_url, "feed hub started");
        true
    }

    /// Signal the writer task to shut down. Cooperative; the task exits at
    /// its next select point.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.cmd_tx.write().take() {
            let _ = tx.try_send(HubCommand::Shutdown);
        }
        self.transport_connected.store(false, Ordering::SeqCst);
        info!("feed hub stop requested");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Connected iff the transport reports up or a tick arrived within the
    /// last 30 s.
    pub fn is_connected(&self) -> bool {
        if self.transport_connected.load(Ordering::SeqCst) {
            return true;
        }
        self.last_tick_at
            .read()
            .is_some_and(|at| at.elapsed() < CONNECTED_TICK_WINDOW)
    }

    pub fn health(&self) -> Arc<FeedHealth> {
        self.health.clone()
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Subscribe one instrument. Idempotent.
    pub fn subscribe(&self, key: InstrumentKey) {
        self.subscribe_many(vec![key]);
    }

    /// Subscribe many instruments; already-subscribed keys are skipped so
    /// duplicates never multiply upstream requests or deliveries.
    pub fn subscribe_many(&self, keys: Vec<InstrumentKey>) {
        let fresh: Vec<InstrumentKey> = {
            let mut subs = self.subscriptions.write();
            keys.into_iter().filter(|k| subs.insert(k.clone())).collect()
        };
        if fresh.is_empty() {
            return;
        }
        debug!(count = fresh.len(), "subscribing instruments");
        self.send_command(HubCommand::Subscribe(fresh));
    }

    pub fn unsubscribe(&self, key: &InstrumentKey) {
        self.unsubscribe_many(std::slice::from_ref(key));
    }

    pub fn unsubscribe_many(&self, keys: &[InstrumentKey]) {
        let removed: Vec<InstrumentKey> = {
            let mut subs = self.subscriptions.write();
            keys.iter().filter(|k| subs.remove(*k)).cloned().collect()
        };
        if removed.is_empty() {
            return;
        }
        self.send_command(HubCommand::Unsubscribe(removed));
    }

    pub fn is_subscribed(&self, key: &InstrumentKey) -> bool {
        self.subscriptions.read().contains(key)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// A new fan-out receiver. Dropping behind the channel capacity loses
    /// the oldest ticks for that receiver only.
    pub fn tick_stream(&self) -> broadcast::Receiver<Tick> {
        self.tick_tx.subscribe()
    }

    fn send_command(&self, cmd: HubCommand) {
        let guard = self.cmd_tx.read();
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(cmd).is_err() {
                warn!("feed hub command queue full or closed; command dropped");
            }
        }
        // Not running yet: the subscription set is replayed on connect.
    }

    // -------------------------------------------------------------------------
    // Writer task
    // -------------------------------------------------------------------------

    async fn run_connection_loop(
        self: Arc<Self>,
        mut initial: Option<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
        >,
        mut cmd_rx: mpsc::Receiver<HubCommand>,
        warm_tx: mpsc::Sender<Tick>,
    ) {
        while self.running.load(Ordering::SeqCst) {
            let ws_stream = match initial.take() {
                Some(stream) => stream,
                None => match tokio_tungstenite::connect_async(&self.ws_url).await {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        self.health.mark_error(TICKS_FEED, e.to_string());
                        warn!(error = %e, "feed reconnect failed — retrying in 5s");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                },
            };

            self.transport_connected.store(true, Ordering::SeqCst);
            info!("feed transport connected");

            let (mut write, mut read) = ws_stream.split();

            // Replay the full subscription set on every (re)connect.
            let existing: Vec<InstrumentKey> =
                self.subscriptions.read().iter().cloned().collect();
            for frame in build_request_frames(REQUEST_CODE_SUBSCRIBE, &existing) {
                if let Err(e) = write.send(Message::Text(frame)).await {
                    warn!(error = %e, "failed to replay subscriptions");
                    break;
                }
            }

            loop {
                tokio::select! {
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            match parse_tick_frame(&text) {
                                Ok(Some(tick)) => self.ingest_tick(tick, &warm_tx),
                                Ok(None) => {}
                                Err(e) => {
                                    debug!(error = %e, "unparseable feed frame ignored");
                                }
                            }
                        }
                        Some(Ok(_)) => {
                            // Ping/Pong/Binary handled by tungstenite or ignored.
                        }
                        Some(Err(e)) => {
                            self.health.mark_error(TICKS_FEED, e.to_string());
                            error!(error = %e, "feed read error — reconnecting");
                            break;
                        }
                        None => {
                            warn!("feed stream ended — reconnecting");
                            break;
                        }
                    },
                    cmd = cmd_rx.recv() => match cmd {
                        Some(HubCommand::Subscribe(keys)) => {
                            for frame in build_request_frames(REQUEST_CODE_SUBSCRIBE, &keys) {
                                if let Err(e) = write.send(Message::Text(frame)).await {
                                    warn!(error = %e, "subscribe frame send failed");
                                }
                            }
                        }
                        Some(HubCommand::Unsubscribe(keys)) => {
                            for frame in build_request_frames(REQUEST_CODE_UNSUBSCRIBE, &keys) {
                                if let Err(e) = write.send(Message::Text(frame)).await {
                                    warn!(error = %e, "unsubscribe frame send failed");
                                }
                            }
                        }
                        Some(HubCommand::Shutdown) | None => {
                            self.transport_connected.store(false, Ordering::SeqCst);
                            info!("feed writer task exiting");
                            return;
                        }
                    },
                }

                if !self.running.load(Ordering::SeqCst) {
                    self.transport_connected.store(false, Ordering::SeqCst);
                    return;
                }
            }

            self.transport_connected.store(false, Ordering::SeqCst);
            if self.running.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }

    fn ingest_tick(&self, tick: Tick, warm_tx: &mpsc::Sender<Tick>) {
        self.tick_cache.put(tick.clone());
        *self.last_tick_at.write() = Some(Instant::now());
        self.health.mark_success(TICKS_FEED);

        // Warm write only for positive prices, queued best-effort.
        if tick.ltp > 0.0 && warm_tx.try_send(tick.clone()).is_err() {
            debug!("warm write queue full — tick dropped from warm path");
        }

        // Fan out; an Err here only means no receiver is currently attached.
        let _ = self.tick_tx.send(tick);
    }
}

impl std::fmt::Debug for MarketFeedHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketFeedHub")
            .field("running", &self.is_running())
            .field("connected", &self.is_connected())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

/// Consume the warm-write queue, persisting ticks off the hot path.
async fn run_warm_writer(warm: Arc<WarmCache>, mut rx: mpsc::Receiver<Tick>) {
    while let Some(tick) = rx.recv().await {
        warm.write_tick(&tick).await;
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

/// Build subscription/unsubscription frames, splitting the instrument list
/// into chunks of at most [`SUBSCRIBE_BATCH_CAP`].
fn build_request_frames(request_code: u8, keys: &[InstrumentKey]) -> Vec<String> {
    keys.chunks(SUBSCRIBE_BATCH_CAP)
        .map(|chunk| {
            let instruments: Vec<serde_json::Value> = chunk
                .iter()
                .map(|k| {
                    json!({
                        "ExchangeSegment": k.segment.as_str(),
                        "SecurityId": k.security_id,
                    })
                })
                .collect();
            json!({
                "RequestCode": request_code,
                "InstrumentCount": chunk.len(),
                "InstrumentList": instruments,
            })
            .to_string()
        })
        .collect()
}

/// Parse an incoming feed frame. Returns `Ok(None)` for non-tick frames
/// (heartbeats, acks).
///
/// Expected tick shape:
/// ```json
/// { "type": "ticker", "exchange_segment": 2, "security_id": "49081",
///   "ltp": "123.45", "ltt": 1700000000 }
/// ```
fn parse_tick_frame(text: &str) -> Result<Option<Tick>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse feed JSON")?;

    let kind = match root["type"].as_str() {
        Some("ticker") => TickKind::Ticker,
        Some("quote") => TickKind::Quote,
        Some("full") => TickKind::Full,
        Some("prev_close") => TickKind::PrevClose,
        _ => return Ok(None),
    };

    let segment_code = root["exchange_segment"]
        .as_u64()
        .context("missing field exchange_segment")? as u8;
    let segment = Segment::from_code(segment_code)
        .with_context(|| format!("unknown segment code {segment_code}"))?;

    let security_id = root["security_id"]
        .as_str()
        .context("missing field security_id")?
        .to_string();

    let ltp = parse_str_f64(&root["ltp"]).context("failed to parse ltp")?;
    if ltp < 0.0 {
        anyhow::bail!("negative ltp {ltp}");
    }

    let ts = root["ltt"].as_i64().unwrap_or(0);

    Ok(Some(Tick {
        segment,
        security_id,
        ltp,
        kind,
        ts,
    }))
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}
