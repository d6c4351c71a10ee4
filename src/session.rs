// =============================================================================
// Trading session & time regimes — pure functions of IST wall clock
// =============================================================================
//
// All session arithmetic runs in the exchange time zone. IST is a fixed
// +05:30 offset with no daylight saving, so a FixedOffset is exact.
// =============================================================================

use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::config::{RegimeParams, RuntimeConfig};

/// IST offset: +05:30.
pub fn ist_offset() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 30 * 60).expect("IST offset is valid")
}

/// Current wall-clock time in IST.
pub fn ist_now() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&ist_offset())
}

/// Today's date string (YYYY-MM-DD) in IST, used for daily counter keys.
pub fn ist_date_string() -> String {
    ist_now().format("%Y-%m-%d").to_string()
}

/// Parse "HH:MM" into a NaiveTime; malformed values fall back to `fallback`
/// with a warning rather than taking the engine down.
pub fn parse_hhmm(value: &str, fallback: NaiveTime) -> NaiveTime {
    match NaiveTime::parse_from_str(value, "%H:%M") {
        Ok(t) => t,
        Err(_) => {
            warn!(value, "malformed HH:MM config value — using fallback");
            fallback
        }
    }
}

/// True when `t` lies inside `[start, end)`, handling windows that wrap
/// midnight (e.g. 23:00 -> 02:00 matches both sides).
pub fn within_window(t: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        t >= start && t < end
    } else {
        t >= start || t < end
    }
}

// =============================================================================
// TradingSession
// =============================================================================

/// Session predicates derived from configured boundaries.
#[derive(Debug, Clone, Copy)]
pub struct TradingSession {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub square_off: NaiveTime,
    pub entry_cutoff: NaiveTime,
}

impl TradingSession {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let default_open = NaiveTime::from_hms_opt(9, 15, 0).expect("valid time");
        let default_close = NaiveTime::from_hms_opt(15, 30, 0).expect("valid time");
        let default_square_off = NaiveTime::from_hms_opt(15, 12, 0).expect("valid time");
        let default_cutoff = NaiveTime::from_hms_opt(15, 0, 0).expect("valid time");

        Self {
            open: parse_hhmm(&config.market_open_hhmm, default_open),
            close: parse_hhmm(&config.market_close_hhmm, default_close),
            square_off: parse_hhmm(&config.square_off_hhmm, default_square_off),
            entry_cutoff: parse_hhmm(&config.risk.entry_cutoff_hhmm, default_cutoff),
        }
    }

    pub fn is_market_open(&self, now: DateTime<FixedOffset>) -> bool {
        within_window(now.time(), self.open, self.close)
    }

    /// Forced square-off: true from the square-off time onward for the rest
    /// of the day, so stragglers still flatten after the close bell.
    pub fn should_force_exit(&self, now: DateTime<FixedOffset>) -> bool {
        now.time() >= self.square_off
    }

    /// Hard cutoff past which no new entries are admitted, regardless of the
    /// active regime.
    pub fn after_entry_cutoff(&self, now: DateTime<FixedOffset>) -> bool {
        now.time() >= self.entry_cutoff
    }
}

// =============================================================================
// Time regimes
// =============================================================================

/// Intraday phase classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRegime {
    PreMarket,
    OpenExpansion,
    TrendContinuation,
    ChopDecay,
    CloseGamma,
    PostMarket,
}

impl TimeRegime {
    pub fn name(self) -> &'static str {
        match self {
            Self::PreMarket => "pre_market",
            Self::OpenExpansion => "open_expansion",
            Self::TrendContinuation => "trend_continuation",
            Self::ChopDecay => "chop_decay",
            Self::CloseGamma => "close_gamma",
            Self::PostMarket => "post_market",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "open_expansion" => Some(Self::OpenExpansion),
            "trend_continuation" => Some(Self::TrendContinuation),
            "chop_decay" => Some(Self::ChopDecay),
            "close_gamma" => Some(Self::CloseGamma),
            _ => None,
        }
    }
}

impl std::fmt::Display for TimeRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Regime classification result with its parameter overrides, if any.
#[derive(Debug, Clone)]
pub struct RegimeSlot {
    pub regime: TimeRegime,
    pub params: Option<RegimeParams>,
}

impl RegimeSlot {
    pub fn allow_entries(&self) -> bool {
        match (&self.regime, &self.params) {
            (TimeRegime::PreMarket | TimeRegime::PostMarket, _) => false,
            (_, Some(p)) => p.allow_entries,
            (_, None) => true,
        }
    }

    pub fn allow_trailing(&self) -> bool {
        self.params.as_ref().map(|p| p.allow_trailing).unwrap_or(true)
    }

    /// Whether pyramiding (runner adds) is allowed in this regime.
    pub fn allow_runners(&self) -> bool {
        self.params.as_ref().map(|p| p.allow_runners).unwrap_or(true)
    }

    /// Minimum ADX an entry signal must carry in this regime; 0 disables.
    pub fn min_adx(&self) -> f64 {
        self.params.as_ref().map(|p| p.min_adx).unwrap_or(0.0)
    }

    pub fn sl_multiplier(&self) -> f64 {
        self.params.as_ref().map(|p| p.sl_multiplier).unwrap_or(1.0)
    }

    pub fn tp_multiplier(&self) -> f64 {
        self.params.as_ref().map(|p| p.tp_multiplier).unwrap_or(1.0)
    }

    /// Regime cap on rupee take-profit; 0 means uncapped.
    pub fn max_tp_rupees(&self) -> f64 {
        self.params.as_ref().map(|p| p.max_tp_rupees).unwrap_or(0.0)
    }
}

/// Classify `now` against the session and the configured regime windows.
/// Outside market hours the result is PreMarket/PostMarket; inside hours an
/// unmatched gap falls back to TrendContinuation with no overrides.
pub fn classify_regime(
    now: DateTime<FixedOffset>,
    session: &TradingSession,
    regimes: &std::collections::BTreeMap<String, RegimeParams>,
) -> RegimeSlot {
    let t = now.time();

    if t < session.open {
        return RegimeSlot { regime: TimeRegime::PreMarket, params: None };
    }
    if t >= session.close {
        return RegimeSlot { regime: TimeRegime::PostMarket, params: None };
    }

    for (name, params) in regimes {
        let Some(regime) = TimeRegime::from_name(name) else {
            continue;
        };
        let start = parse_hhmm(&params.start, session.open);
        let end = parse_hhmm(&params.end, session.close);
        if within_window(t, start, end) {
            return RegimeSlot { regime, params: Some(params.clone()) };
        }
    }

    RegimeSlot { regime: TimeRegime::TrendContinuation, params: None }
}
