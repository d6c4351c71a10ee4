// =============================================================================
// Runtime Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Every tunable of the risk engine lives here so the controller can be
// reconfigured at runtime without a restart. Persistence uses an atomic
// tmp + rename pattern to prevent corruption on crash. All fields carry serde
// defaults so adding new fields never breaks loading an older config file.
//
// Legacy `position_sizing` keys are normalised into the canonical `risk`
// block at load time; the canonical value wins when both are present.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_sl_pct() -> f64 {
    2.0
}

fn default_tp_pct() -> f64 {
    5.0
}

fn default_exit_drop_pct() -> f64 {
    0.35
}

fn default_time_exit_hhmm() -> String {
    "14:45".to_string()
}

fn default_market_open_hhmm() -> String {
    "09:15".to_string()
}

fn default_market_close_hhmm() -> String {
    "15:30".to_string()
}

fn default_square_off_hhmm() -> String {
    "15:12".to_string()
}

fn default_entry_cutoff_hhmm() -> String {
    "15:00".to_string()
}

fn default_secure_profit_threshold() -> f64 {
    1_500.0
}

fn default_secure_profit_drawdown_pct() -> f64 {
    6.0
}

fn default_peak_drawdown_pct() -> f64 {
    5.0
}

fn default_activation_profit_pct() -> f64 {
    5.0
}

fn default_activation_sl_offset_pct() -> f64 {
    0.5
}

fn default_trend_score_threshold() -> f64 {
    0.35
}

fn default_atr_collapse_multiplier() -> f64 {
    0.55
}

fn default_loop_interval_idle() -> u64 {
    5_000
}

fn default_loop_interval_active() -> u64 {
    500
}

fn default_max_daily_profit() -> f64 {
    20_000.0
}

fn default_max_daily_loss_pct() -> f64 {
    3.0
}

fn default_max_global_daily_loss_pct() -> f64 {
    5.0
}

fn default_flat_fee_rupees() -> f64 {
    40.0
}

fn default_max_same_side() -> u32 {
    2
}

fn default_cooldown_sec() -> u64 {
    30
}

fn default_pyramid_min_profit_secs() -> u64 {
    300
}

fn default_trailing_mode() -> TrailingMode {
    TrailingMode::Tiered
}

fn default_trail_distance_pct() -> f64 {
    4.0
}

fn default_trail_tiers() -> Vec<TrailTier> {
    vec![
        TrailTier { min_profit_pct: 3.0, sl_offset_pct: 1.0 },
        TrailTier { min_profit_pct: 6.0, sl_offset_pct: 3.0 },
        TrailTier { min_profit_pct: 10.0, sl_offset_pct: 6.0 },
        TrailTier { min_profit_pct: 15.0, sl_offset_pct: 10.0 },
    ]
}

fn default_drawdown_tiers() -> Vec<DrawdownTier> {
    vec![
        DrawdownTier { min_peak_pct: 5.0, drawdown_pct: 3.0 },
        DrawdownTier { min_peak_pct: 10.0, drawdown_pct: 4.0 },
        DrawdownTier { min_peak_pct: 20.0, drawdown_pct: 5.0 },
    ]
}

fn default_rolling_window_size() -> usize {
    5
}

fn default_rolling_window_threshold() -> f64 {
    -2_500.0
}

fn default_max_consecutive_sls() -> u32 {
    3
}

fn default_pause_duration_minutes() -> u64 {
    30
}

fn default_s3_max_consecutive_sls() -> u32 {
    2
}

fn default_s4_start_time() -> String {
    "14:15".to_string()
}

fn default_paper_interval_secs() -> u64 {
    5
}

fn default_watchlist() -> Vec<String> {
    vec!["NIFTY".to_string(), "BANKNIFTY".to_string(), "SENSEX".to_string()]
}

fn default_time_regimes() -> BTreeMap<String, RegimeParams> {
    let mut regimes = BTreeMap::new();
    regimes.insert(
        "open_expansion".to_string(),
        RegimeParams {
            start: "09:15".into(),
            end: "10:30".into(),
            sl_multiplier: 1.2,
            tp_multiplier: 1.3,
            allow_entries: true,
            allow_trailing: true,
            allow_runners: true,
            min_adx: 18.0,
            max_tp_rupees: 0.0,
        },
    );
    regimes.insert(
        "trend_continuation".to_string(),
        RegimeParams {
            start: "10:30".into(),
            end: "12:30".into(),
            sl_multiplier: 1.0,
            tp_multiplier: 1.0,
            allow_entries: true,
            allow_trailing: true,
            allow_runners: true,
            min_adx: 22.0,
            max_tp_rupees: 0.0,
        },
    );
    regimes.insert(
        "chop_decay".to_string(),
        RegimeParams {
            start: "12:30".into(),
            end: "14:15".into(),
            sl_multiplier: 0.8,
            tp_multiplier: 0.7,
            allow_entries: true,
            allow_trailing: false,
            allow_runners: false,
            min_adx: 28.0,
            max_tp_rupees: 3_000.0,
        },
    );
    regimes.insert(
        "close_gamma".to_string(),
        RegimeParams {
            start: "14:15".into(),
            end: "15:30".into(),
            sl_multiplier: 0.7,
            tp_multiplier: 0.8,
            allow_entries: false,
            allow_trailing: true,
            allow_runners: false,
            min_adx: 25.0,
            max_tp_rupees: 2_000.0,
        },
    );
    regimes
}

// =============================================================================
// Sub-structs
// =============================================================================

/// Direct trailing maintains a fixed distance below price; tiered trailing
/// looks the SL offset up from a step function of current profit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingMode {
    Direct,
    Tiered,
}

/// One step of the tiered-trailing table: at `min_profit_pct` and above, the
/// stop sits `sl_offset_pct` above entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailTier {
    pub min_profit_pct: f64,
    pub sl_offset_pct: f64,
}

/// One step of the peak-drawdown table: once peak profit reaches
/// `min_peak_pct`, a pullback of `drawdown_pct` from peak exits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrawdownTier {
    pub min_peak_pct: f64,
    pub drawdown_pct: f64,
}

/// The canonical risk block. A rule is enabled when its keys are present and
/// non-zero; setting a threshold to 0.0 disables the rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Stop-loss threshold as a positive percentage (2.0 exits at -2 %).
    #[serde(default = "default_sl_pct")]
    pub sl_pct: f64,

    /// Take-profit threshold as a positive percentage.
    #[serde(default = "default_tp_pct")]
    pub tp_pct: f64,

    /// Trailing-stop threshold: exit when PnL drops this fraction from HWM.
    #[serde(default = "default_exit_drop_pct")]
    pub exit_drop_pct: f64,

    /// Wall-clock time after which the time-based exit may fire.
    #[serde(default = "default_time_exit_hhmm")]
    pub time_exit_hhmm: String,

    /// Market close; the time-based exit only fires before this.
    #[serde(default = "default_market_close_hhmm")]
    pub market_close_hhmm: String,

    /// Minimum rupee profit required for the time-based exit (0 = any).
    #[serde(default)]
    pub min_profit_rupees: f64,

    /// Rupee profit above which secure-profit drawdown protection engages.
    #[serde(default = "default_secure_profit_threshold")]
    pub secure_profit_threshold_rupees: f64,

    /// Drawdown from peak (in pct points) that triggers secure-profit exit.
    #[serde(default = "default_secure_profit_drawdown_pct")]
    pub secure_profit_drawdown_pct: f64,

    /// Base peak-drawdown threshold; the tier table refines it.
    #[serde(default = "default_peak_drawdown_pct")]
    pub peak_drawdown_pct: f64,

    /// Tiered drawdown thresholds by peak profit.
    #[serde(default = "default_drawdown_tiers")]
    pub drawdown_tiers: Vec<DrawdownTier>,

    /// Peak profit required before peak-drawdown activation gating engages.
    #[serde(default = "default_activation_profit_pct")]
    pub activation_profit_pct: f64,

    /// Fraction of peak the SL offset must have reached for activation.
    #[serde(default = "default_activation_sl_offset_pct")]
    pub activation_sl_offset_pct: f64,

    /// Underlying trend score below which the underlying exit fires.
    #[serde(default = "default_trend_score_threshold")]
    pub underlying_trend_score_threshold: f64,

    /// ATR ratio below which the underlying exit treats range as collapsed.
    #[serde(default = "default_atr_collapse_multiplier")]
    pub underlying_atr_collapse_multiplier: f64,

    /// Driver cadence when no positions are active (milliseconds).
    #[serde(default = "default_loop_interval_idle")]
    pub loop_interval_idle: u64,

    /// Driver cadence while positions are active (milliseconds).
    #[serde(default = "default_loop_interval_active")]
    pub loop_interval_active: u64,

    /// Daily profit target; reaching it hard-blocks new entries.
    #[serde(default = "default_max_daily_profit")]
    pub max_daily_profit: f64,

    /// Per-index daily loss cap as a percentage of capital.
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,

    /// Global daily loss cap as a percentage of capital.
    #[serde(default = "default_max_global_daily_loss_pct")]
    pub max_global_daily_loss_pct: f64,

    /// Profit level at which loss limits start being enforced. Defaults to
    /// the daily target: below it, losses do not block new entries.
    #[serde(default = "default_max_daily_profit")]
    pub profit_threshold: f64,

    /// Flat round-trip fee deducted once when finalising PnL.
    #[serde(default = "default_flat_fee_rupees")]
    pub flat_fee_rupees: f64,

    /// Trailing mode: direct distance or tiered offsets.
    #[serde(default = "default_trailing_mode")]
    pub trailing_mode: TrailingMode,

    /// Direct trailing distance below current price, percent of entry.
    #[serde(default = "default_trail_distance_pct")]
    pub trail_distance_pct: f64,

    /// Tiered trailing table, ascending by `min_profit_pct`.
    #[serde(default = "default_trail_tiers")]
    pub trail_tiers: Vec<TrailTier>,

    /// Max active positions with the same (instrument, side).
    #[serde(default = "default_max_same_side")]
    pub max_same_side: u32,

    /// Re-entry cooldown per symbol, seconds.
    #[serde(default = "default_cooldown_sec")]
    pub cooldown_sec: u64,

    /// How long the first position must have been profitable before a
    /// pyramiding second entry is allowed, seconds.
    #[serde(default = "default_pyramid_min_profit_secs")]
    pub pyramid_min_profit_secs: u64,

    /// Hard cutoff after which no new entries are admitted, regardless of
    /// the active time regime.
    #[serde(default = "default_entry_cutoff_hhmm")]
    pub entry_cutoff_hhmm: String,

    /// Edge-failure breaker settings.
    #[serde(default)]
    pub edge_failure_detector: EdgeFailureConfig,
}

impl Default for RiskConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty RiskConfig deserialises")
    }
}

/// Edge-failure breaker settings (rolling window, consecutive stops,
/// session-based chop pause).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeFailureConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Number of most recent trade PnLs summed by the rolling breaker.
    #[serde(default = "default_rolling_window_size")]
    pub rolling_window_size: usize,

    /// Rolling-sum threshold (negative rupees) that trips the breaker.
    #[serde(default = "default_rolling_window_threshold")]
    pub rolling_window_threshold_rupees: f64,

    /// Consecutive stop-loss exits that trip the breaker.
    #[serde(default = "default_max_consecutive_sls")]
    pub max_consecutive_sls: u32,

    /// How long a tripped breaker pauses entries, minutes.
    #[serde(default = "default_pause_duration_minutes")]
    pub pause_duration_minutes: u64,

    /// Enable the chop-session breaker.
    #[serde(default = "default_true")]
    pub session_based_pause: bool,

    /// Consecutive stops tolerated inside the chop session.
    #[serde(default = "default_s3_max_consecutive_sls")]
    pub s3_max_consecutive_sls: u32,

    /// Boundary at which a chop-session pause lifts (next session start).
    #[serde(default = "default_s4_start_time")]
    pub s4_start_time: String,
}

impl Default for EdgeFailureConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty EdgeFailureConfig deserialises")
    }
}

/// Per-regime overrides applied on top of the base risk config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeParams {
    pub start: String,
    pub end: String,
    #[serde(default = "default_one")]
    pub sl_multiplier: f64,
    #[serde(default = "default_one")]
    pub tp_multiplier: f64,
    #[serde(default = "default_true")]
    pub allow_entries: bool,
    #[serde(default = "default_true")]
    pub allow_trailing: bool,
    #[serde(default = "default_true")]
    pub allow_runners: bool,
    #[serde(default)]
    pub min_adx: f64,
    /// Cap on take-profit rupees in this regime (0 = uncapped).
    #[serde(default)]
    pub max_tp_rupees: f64,
}

fn default_one() -> f64 {
    1.0
}

/// Paper-trading toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperTradingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Cadence of the paper LTP refresh, seconds.
    #[serde(default = "default_paper_interval_secs")]
    pub realtime_interval_seconds: u64,
}

impl Default for PaperTradingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            realtime_interval_seconds: default_paper_interval_secs(),
        }
    }
}

/// Feature flags. All observable behaviour changes hide behind one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default = "default_true")]
    pub enable_demand_driven_services: bool,
    #[serde(default = "default_true")]
    pub enable_underlying_aware_exits: bool,
    #[serde(default)]
    pub enable_peak_drawdown_activation: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty FeatureFlags deserialises")
    }
}

/// Legacy sizing block kept only so older config files still load; its
/// thresholds are folded into `risk` by [`RuntimeConfig::normalize`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyPositionSizing {
    #[serde(default)]
    pub stop_loss_pct: f64,
    #[serde(default)]
    pub take_profit_pct: f64,
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Kavach engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Whether the engine admits new entries. Exits always run.
    #[serde(default)]
    pub entries_paused: bool,

    /// Index symbols the engine watches; their feeds are never pruned.
    #[serde(default = "default_watchlist")]
    pub watchlist: Vec<String>,

    /// Session boundaries in exchange-local (IST) wall clock.
    #[serde(default = "default_market_open_hhmm")]
    pub market_open_hhmm: String,
    #[serde(default = "default_market_close_hhmm")]
    pub market_close_hhmm: String,
    /// Forced square-off begins here; the session-end rule fires from this
    /// time until close.
    #[serde(default = "default_square_off_hhmm")]
    pub square_off_hhmm: String,

    /// Canonical risk block.
    #[serde(default)]
    pub risk: RiskConfig,

    /// Legacy aliases, normalised into `risk` at load.
    #[serde(default)]
    pub position_sizing: LegacyPositionSizing,

    /// Time-regime windows and their overrides.
    #[serde(default = "default_time_regimes")]
    pub time_regimes: BTreeMap<String, RegimeParams>,

    #[serde(default)]
    pub paper_trading: PaperTradingConfig,

    #[serde(default)]
    pub feature_flags: FeatureFlags,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty RuntimeConfig deserialises")
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path` and normalise legacy
    /// aliases. Returns an error if the file is absent or malformed so the
    /// caller can fall back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        config.normalize();

        info!(
            path = %path.display(),
            watchlist = ?config.watchlist,
            paper = config.paper_trading.enabled,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Fold legacy `position_sizing` values into the canonical `risk` block.
    /// A canonical non-zero value always wins over the alias.
    pub fn normalize(&mut self) {
        if self.risk.sl_pct == 0.0 && self.position_sizing.stop_loss_pct > 0.0 {
            self.risk.sl_pct = self.position_sizing.stop_loss_pct;
        }
        if self.risk.tp_pct == 0.0 && self.position_sizing.take_profit_pct > 0.0 {
            self.risk.tp_pct = self.position_sizing.take_profit_pct;
        }
    }

    /// Persist the current configuration using an atomic write (tmp then
    /// rename) so a crash mid-write cannot corrupt the file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert!(!cfg.entries_paused);
        assert_eq!(cfg.watchlist.len(), 3);
        assert_eq!(cfg.market_open_hhmm, "09:15");
        assert_eq!(cfg.square_off_hhmm, "15:12");
        assert!((cfg.risk.sl_pct - 2.0).abs() < f64::EPSILON);
        assert!((cfg.risk.tp_pct - 5.0).abs() < f64::EPSILON);
        assert_eq!(cfg.risk.trailing_mode, TrailingMode::Tiered);
        assert_eq!(cfg.risk.edge_failure_detector.rolling_window_size, 5);
        assert!(cfg.feature_flags.enable_underlying_aware_exits);
        assert!(!cfg.paper_trading.enabled);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.risk.loop_interval_idle, 5_000);
        assert_eq!(cfg.risk.loop_interval_active, 500);
        assert_eq!(cfg.risk.max_same_side, 2);
        assert_eq!(cfg.time_regimes.len(), 4);
    }

    #[test]
    fn legacy_alias_fills_missing_canonical() {
        let json = r#"{
            "risk": { "sl_pct": 0.0 },
            "position_sizing": { "stop_loss_pct": 1.5, "take_profit_pct": 4.0 }
        }"#;
        let mut cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        cfg.normalize();
        assert!((cfg.risk.sl_pct - 1.5).abs() < f64::EPSILON);
        // tp_pct had a non-zero default, so the canonical value wins.
        assert!((cfg.risk.tp_pct - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn canonical_wins_over_legacy() {
        let json = r#"{
            "risk": { "sl_pct": 2.5 },
            "position_sizing": { "stop_loss_pct": 1.0 }
        }"#;
        let mut cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        cfg.normalize();
        assert!((cfg.risk.sl_pct - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn drawdown_tiers_are_monotone() {
        let tiers = default_drawdown_tiers();
        for pair in tiers.windows(2) {
            assert!(pair[0].min_peak_pct < pair[1].min_peak_pct);
            assert!(pair[0].drawdown_pct <= pair[1].drawdown_pct);
        }
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.watchlist, cfg2.watchlist);
        assert_eq!(cfg.risk.trailing_mode, cfg2.risk.trailing_mode);
        assert_eq!(cfg.time_regimes.len(), cfg2.time_regimes.len());
    }
}
