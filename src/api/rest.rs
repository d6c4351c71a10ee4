// =============================================================================
// REST endpoints — Axum 0.7
// =============================================================================
//
// Everything lives under /api/v1/. Health is public; state and controls
// require a Bearer token via the AuthBearer extractor. CORS is permissive
// for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::AuthBearer;
use crate::context::EngineContext;

/// Build the router with CORS and shared state.
pub fn router(context: Arc<EngineContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/risk", get(risk))
        .route("/api/v1/feed", get(feed))
        .route("/api/v1/signal", post(signal))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/kill", post(control_kill))
        .route("/api/v1/control/paper-mode", post(control_paper_mode))
        .route("/api/v1/control/reset-limits", post(control_reset_limits))
        .layer(cors)
        .with_state(context)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(context): State<Arc<EngineContext>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: context.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// State & positions (authenticated)
// =============================================================================

async fn full_state(
    _auth: AuthBearer,
    State(context): State<Arc<EngineContext>>,
) -> impl IntoResponse {
    Json(context.build_snapshot().await)
}

async fn positions(
    _auth: AuthBearer,
    State(context): State<Arc<EngineContext>>,
) -> impl IntoResponse {
    Json(context.active_cache.all_positions())
}

async fn risk(
    _auth: AuthBearer,
    State(context): State<Arc<EngineContext>>,
) -> impl IntoResponse {
    Json(context.build_risk_report().await)
}

async fn feed(
    _auth: AuthBearer,
    State(context): State<Arc<EngineContext>>,
) -> impl IntoResponse {
    Json(context.health.snapshot())
}

// =============================================================================
// Signal ingestion (authenticated)
// =============================================================================

/// Inbound pick from an external signal generator.
#[derive(Debug, Deserialize)]
struct SignalRequest {
    security_id: String,
    segment: crate::types::Segment,
    symbol: String,
    #[serde(default)]
    ltp: Option<f64>,
    #[serde(default)]
    adx: Option<f64>,
    direction: crate::types::PositionDirection,
    #[serde(default = "default_scale")]
    scale_multiplier: f64,
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Serialize)]
struct SignalResponse {
    admitted: bool,
}

async fn signal(
    _auth: AuthBearer,
    State(context): State<Arc<EngineContext>>,
    Json(request): Json<SignalRequest>,
) -> impl IntoResponse {
    let pick = crate::engine::SignalPick {
        security_id: request.security_id,
        segment: request.segment,
        symbol: request.symbol,
        ltp: request.ltp,
        adx: request.adx,
    };
    let admitted = context
        .entry_guard
        .try_enter(&pick, request.direction, request.scale_multiplier)
        .await;
    if admitted {
        context.increment_version();
    }
    Json(SignalResponse { admitted })
}

// =============================================================================
// Controls (authenticated)
// =============================================================================

#[derive(Serialize)]
struct ControlResponse {
    ok: bool,
    entries_paused: bool,
    killed: bool,
    paper_trading: bool,
}

fn control_response(context: &EngineContext) -> ControlResponse {
    let config = context.config.read();
    ControlResponse {
        ok: true,
        entries_paused: config.entries_paused,
        killed: context.kill_switch.is_engaged(),
        paper_trading: config.paper_trading.enabled,
    }
}

async fn control_pause(
    _auth: AuthBearer,
    State(context): State<Arc<EngineContext>>,
) -> impl IntoResponse {
    context.config.write().entries_paused = true;
    context.increment_version();
    info!("entries paused via API");
    Json(control_response(&context))
}

async fn control_resume(
    _auth: AuthBearer,
    State(context): State<Arc<EngineContext>>,
) -> impl IntoResponse {
    context.config.write().entries_paused = false;
    context.kill_switch.clear();
    context.increment_version();
    info!("entries resumed via API (pause and kill switch cleared)");
    Json(control_response(&context))
}

async fn control_kill(
    _auth: AuthBearer,
    State(context): State<Arc<EngineContext>>,
) -> impl IntoResponse {
    context.kill_switch.engage();
    context.config.write().entries_paused = true;
    context.increment_version();
    Json(control_response(&context))
}

#[derive(Deserialize)]
struct PaperModeRequest {
    enabled: bool,
}

async fn control_paper_mode(
    _auth: AuthBearer,
    State(context): State<Arc<EngineContext>>,
    Json(request): Json<PaperModeRequest>,
) -> impl IntoResponse {
    context.config.write().paper_trading.enabled = request.enabled;
    context.increment_version();
    info!(enabled = request.enabled, "paper mode toggled via API");
    Json(control_response(&context))
}

async fn control_reset_limits(
    _auth: AuthBearer,
    State(context): State<Arc<EngineContext>>,
) -> impl IntoResponse {
    context.daily_limits.reset_daily_counters().await;
    let watchlist = context.config.read().watchlist.clone();
    for index in watchlist {
        context.edge_failure.clear_pause(&index).await;
    }
    context.increment_version();
    info!("daily limits and pauses reset via API");
    Json(control_response(&context))
}
