// =============================================================================
// Edge-failure detector — rolling PnL, consecutive stops, chop-session pause
// =============================================================================
//
// Three independent breakers that pause NEW ENTRIES only (exits always run):
//   1. Rolling window — sum of the last N trade PnLs at or below a negative
//      threshold.
//   2. Consecutive stop-losses — counter driven by ExitKind, reset by any
//      non-stop exit.
//   3. Session breaker — a lower stop tolerance inside the chop session,
//      pausing until the next session boundary.
//
// State keys (per index scope and GLOBAL):
//   edge_failure:rolling_window:{scope}   capped FIFO of {pnl, exit_time}
//   edge_failure:consecutive_sl:{scope}   integer
//   edge_failure:pause:{scope}            {reason, resume_at, paused_at, details}
//
// Because this detector only restricts entries, a store failure fails OPEN.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::EdgeFailureConfig;
use crate::session::parse_hhmm;
use crate::store::KvStore;
use crate::types::ExitKind;

/// Scope for the account-wide breakers.
const GLOBAL_SCOPE: &str = "GLOBAL";

/// One rolling-window sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WindowEntry {
    pnl: f64,
    exit_time: i64,
}

/// An active entry pause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseState {
    pub reason: String,
    /// Epoch seconds at which entries resume.
    pub resume_at: i64,
    pub paused_at: i64,
    #[serde(default)]
    pub details: String,
}

/// Store-backed breaker state.
pub struct EdgeFailureDetector {
    store: Arc<dyn KvStore>,
}

impl EdgeFailureDetector {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn rolling_key(scope: &str) -> String {
        format!("edge_failure:rolling_window:{scope}")
    }

    fn consecutive_key(scope: &str) -> String {
        format!("edge_failure:consecutive_sl:{scope}")
    }

    fn pause_key(scope: &str) -> String {
        format!("edge_failure:pause:{scope}")
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    /// Record one completed trade and trip any breaker whose condition now
    /// holds. `in_chop_session` comes from the caller's regime classification.
    pub async fn record_exit(
        &self,
        index: &str,
        pnl: f64,
        kind: ExitKind,
        now: DateTime<FixedOffset>,
        config: &EdgeFailureConfig,
        in_chop_session: bool,
    ) {
        if !config.enabled {
            return;
        }

        for scope in [index, GLOBAL_SCOPE] {
            self.push_window(scope, pnl, now, config).await;
            let consecutive = self.bump_consecutive(scope, kind).await;

            // 1. Rolling-PnL breaker.
            if let Some(sum) = self.window_sum(scope, config).await {
                if config.rolling_window_threshold_rupees < 0.0
                    && sum <= config.rolling_window_threshold_rupees
                {
                    self.pause(
                        scope,
                        "rolling_window_loss",
                        now,
                        now.timestamp() + (config.pause_duration_minutes * 60) as i64,
                        format!("rolling sum {:.2} over last {}", sum, config.rolling_window_size),
                    )
                    .await;
                }
            }

            // 2. Consecutive stop-loss breaker.
            if consecutive >= config.max_consecutive_sls as i64 {
                self.pause(
                    scope,
                    "consecutive_sl",
                    now,
                    now.timestamp() + (config.pause_duration_minutes * 60) as i64,
                    format!("{consecutive} consecutive stop-loss exits"),
                )
                .await;
            }

            // 3. Chop-session breaker: lower tolerance, pause to the next
            // session boundary instead of a fixed duration.
            if config.session_based_pause
                && in_chop_session
                && consecutive >= config.s3_max_consecutive_sls as i64
            {
                let boundary = parse_hhmm(
                    &config.s4_start_time,
                    chrono::NaiveTime::from_hms_opt(14, 15, 0).expect("valid time"),
                );
                let resume_at = now
                    .date_naive()
                    .and_time(boundary)
                    .and_local_timezone(*now.offset())
                    .single()
                    .map(|dt| dt.timestamp())
                    .unwrap_or(now.timestamp());
                if resume_at > now.timestamp() {
                    self.pause(
                        scope,
                        "chop_session_sls",
                        now,
                        resume_at,
                        format!("{consecutive} stop-loss exits inside chop session"),
                    )
                    .await;
                }
            }
        }
    }

    async fn push_window(
        &self,
        scope: &str,
        pnl: f64,
        now: DateTime<FixedOffset>,
        config: &EdgeFailureConfig,
    ) {
        let entry = WindowEntry { pnl, exit_time: now.timestamp() };
        let json = serde_json::to_string(&entry).expect("window entry serialises");
        if let Err(e) = self
            .store
            .rpush_capped(&Self::rolling_key(scope), &json, config.rolling_window_size)
            .await
        {
            warn!(scope, error = %e, "rolling window write failed");
        }
    }

    /// Increment or reset the consecutive-SL counter, returning its value.
    async fn bump_consecutive(&self, scope: &str, kind: ExitKind) -> i64 {
        let key = Self::consecutive_key(scope);
        if kind.is_stop_loss() {
            match self.store.incr_by_float(&key, 1.0, None).await {
                Ok(n) => n as i64,
                Err(e) => {
                    warn!(scope, error = %e, "consecutive counter write failed");
                    0
                }
            }
        } else {
            if let Err(e) = self.store.set(&key, "0", None).await {
                warn!(scope, error = %e, "consecutive counter reset failed");
            }
            0
        }
    }

    /// Sum of the rolling window, or None when the store is unreadable.
    async fn window_sum(&self, scope: &str, config: &EdgeFailureConfig) -> Option<f64> {
        let raw = match self.store.lrange_all(&Self::rolling_key(scope)).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(scope, error = %e, "rolling window read failed");
                return None;
            }
        };
        let sum = raw
            .iter()
            .rev()
            .take(config.rolling_window_size)
            .filter_map(|s| serde_json::from_str::<WindowEntry>(s).ok())
            .map(|e| e.pnl)
            .sum();
        Some(sum)
    }

    async fn pause(
        &self,
        scope: &str,
        reason: &str,
        now: DateTime<FixedOffset>,
        resume_at: i64,
        details: String,
    ) {
        let state = PauseState {
            reason: reason.to_string(),
            resume_at,
            paused_at: now.timestamp(),
            details,
        };
        let json = serde_json::to_string(&state).expect("pause state serialises");
        let ttl = Duration::from_secs((resume_at - now.timestamp()).max(1) as u64);
        if let Err(e) = self.store.set(&Self::pause_key(scope), &json, Some(ttl)).await {
            warn!(scope, reason, error = %e, "pause write failed");
            return;
        }
        info!(
            scope,
            reason,
            resume_at,
            details = %state.details,
            "edge-failure breaker tripped — entries paused"
        );
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// The tightest active pause for the index (its own scope or GLOBAL).
    /// Store failures read as "not paused": this detector only restricts
    /// entries, never exits, so failing open is the safe direction.
    pub async fn entries_paused(
        &self,
        index: &str,
        now: DateTime<FixedOffset>,
    ) -> Option<PauseState> {
        let mut tightest: Option<PauseState> = None;
        for scope in [index, GLOBAL_SCOPE] {
            let raw = match self.store.get(&Self::pause_key(scope)).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(scope, error = %e, "pause read failed — treating as not paused");
                    continue;
                }
            };
            let Some(raw) = raw else { continue };
            let Ok(state) = serde_json::from_str::<PauseState>(&raw) else {
                warn!(scope, "corrupt pause state ignored");
                continue;
            };
            if state.resume_at <= now.timestamp() {
                continue;
            }
            match &tightest {
                Some(current) if current.resume_at >= state.resume_at => {}
                _ => tightest = Some(state),
            }
        }
        tightest
    }

    /// Current consecutive stop-loss count for a scope (diagnostics).
    pub async fn consecutive_sls(&self, index: &str) -> i64 {
        match self.store.get(&Self::consecutive_key(index)).await {
            Ok(value) => value
                .and_then(|v| v.parse::<f64>().ok())
                .map(|v| v as i64)
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Clear a pause (admin action).
    pub async fn clear_pause(&self, index: &str) {
        for scope in [index, GLOBAL_SCOPE] {
            let _ = self.store.del(&Self::pause_key(scope)).await;
        }
    }
}

impl std::fmt::Debug for EdgeFailureDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeFailureDetector").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ist_offset;
    use crate::store::InMemoryKv;
    use chrono::TimeZone;

    fn detector() -> (Arc<InMemoryKv>, EdgeFailureDetector, EdgeFailureConfig) {
        let kv = Arc::new(InMemoryKv::new());
        let det = EdgeFailureDetector::new(kv.clone());
        (kv, det, EdgeFailureConfig::default())
    }

    fn at(h: u32, m: u32) -> DateTime<FixedOffset> {
        ist_offset().with_ymd_and_hms(2026, 1, 15, h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn consecutive_sls_trip_and_reset() {
        let (_, det, cfg) = detector();
        let now = at(11, 0);

        det.record_exit("NIFTY", -500.0, ExitKind::StopLoss, now, &cfg, false).await;
        det.record_exit("NIFTY", -400.0, ExitKind::StopLoss, now, &cfg, false).await;
        assert!(det.entries_paused("NIFTY", now).await.is_none());
        assert_eq!(det.consecutive_sls("NIFTY").await, 2);

        // A profitable non-stop exit resets the streak.
        det.record_exit("NIFTY", 900.0, ExitKind::TakeProfit, now, &cfg, false).await;
        assert_eq!(det.consecutive_sls("NIFTY").await, 0);

        // Three straight stops trip the breaker (default max 3).
        for _ in 0..3 {
            det.record_exit("NIFTY", -300.0, ExitKind::StopLoss, now, &cfg, false).await;
        }
        let pause = det.entries_paused("NIFTY", now).await.unwrap();
        assert_eq!(pause.reason, "consecutive_sl");
        assert_eq!(pause.resume_at, now.timestamp() + 30 * 60);
    }

    #[tokio::test]
    async fn rolling_window_trips_on_sum() {
        let (_, det, cfg) = detector();
        let now = at(11, 0);

        // Default: 5-trade window, -2500 threshold. Use take-profits so the
        // consecutive breaker stays quiet.
        for _ in 0..4 {
            det.record_exit("NIFTY", -700.0, ExitKind::TimeBased, now, &cfg, false).await;
        }
        let pause = det.entries_paused("NIFTY", now).await.unwrap();
        assert_eq!(pause.reason, "rolling_window_loss");
    }

    #[tokio::test]
    async fn rolling_window_caps_at_n() {
        let (_, det, cfg) = detector();
        let now = at(11, 0);

        // Old losses roll out of the 5-entry window before small new ones.
        det.record_exit("NIFTY", -2_400.0, ExitKind::TimeBased, now, &cfg, false).await;
        for _ in 0..5 {
            det.record_exit("NIFTY", 10.0, ExitKind::TakeProfit, now, &cfg, false).await;
        }
        assert!(det.entries_paused("NIFTY", now).await.is_none());
    }

    #[tokio::test]
    async fn chop_session_pauses_until_boundary() {
        let (_, det, cfg) = detector();
        let now = at(13, 0); // inside chop, boundary 14:15

        det.record_exit("NIFTY", -200.0, ExitKind::StopLoss, now, &cfg, true).await;
        det.record_exit("NIFTY", -200.0, ExitKind::StopLoss, now, &cfg, true).await;

        let pause = det.entries_paused("NIFTY", now).await.unwrap();
        assert_eq!(pause.reason, "chop_session_sls");
        assert_eq!(pause.resume_at, at(14, 15).timestamp());

        // Pause has lapsed by the boundary.
        assert!(det.entries_paused("NIFTY", at(14, 16)).await.is_none());
    }

    #[tokio::test]
    async fn global_scope_pauses_other_indices() {
        let (_, det, cfg) = detector();
        let now = at(11, 0);
        for _ in 0..3 {
            det.record_exit("NIFTY", -300.0, ExitKind::StopLoss, now, &cfg, false).await;
        }
        // The GLOBAL breaker also tripped, so a different index is paused.
        assert!(det.entries_paused("BANKNIFTY", now).await.is_some());
    }

    #[tokio::test]
    async fn store_outage_fails_open() {
        let (kv, det, cfg) = detector();
        let now = at(11, 0);
        for _ in 0..3 {
            det.record_exit("NIFTY", -300.0, ExitKind::StopLoss, now, &cfg, false).await;
        }
        kv.set_failing(true);
        assert!(det.entries_paused("NIFTY", now).await.is_none());
    }

    #[tokio::test]
    async fn disabled_detector_records_nothing() {
        let (_, det, mut cfg) = detector();
        cfg.enabled = false;
        let now = at(11, 0);
        for _ in 0..5 {
            det.record_exit("NIFTY", -5_000.0, ExitKind::StopLoss, now, &cfg, false).await;
        }
        assert!(det.entries_paused("NIFTY", now).await.is_none());
    }
}
