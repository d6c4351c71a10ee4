// =============================================================================
// Underlying-aware exit — trend, structure, and range-collapse signals
// =============================================================================
//
// The engine does not compute indicators. An external monitor supplies a
// numeric snapshot of the underlying index; this rule only compares it to
// the position's direction and the configured thresholds.
// =============================================================================

use std::sync::Arc;

use crate::types::{ExitKind, PositionDirection};

use super::{Rule, RuleContext, RuleResult};

/// Numeric view of the underlying index, produced outside the core.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnderlyingSnapshot {
    /// Trend score in [-1, 1]; positive is bullish.
    pub trend_score: f64,
    /// Direction a break of structure favours, when one is flagged.
    pub structure_break: Option<PositionDirection>,
    /// Current ATR relative to its session baseline; small values mean the
    /// range has collapsed.
    pub atr_ratio: f64,
}

/// Source of underlying snapshots, keyed by the option symbol.
pub trait UnderlyingMonitor: Send + Sync {
    fn snapshot(&self, symbol: &str) -> Option<UnderlyingSnapshot>;
}

// ---------------------------------------------------------------------------
// UnderlyingExit — priority 60
// ---------------------------------------------------------------------------

/// Exit when the underlying disagrees with the position: structure breaks
/// against it, the trend score flips past the threshold, or the ATR
/// collapses below the configured multiplier.
pub struct UnderlyingExit {
    monitor: Arc<dyn UnderlyingMonitor>,
}

impl UnderlyingExit {
    pub fn new(monitor: Arc<dyn UnderlyingMonitor>) -> Self {
        Self { monitor }
    }
}

impl Rule for UnderlyingExit {
    fn name(&self) -> &'static str {
        "underlying_exit"
    }

    fn priority(&self) -> u8 {
        60
    }

    fn enabled(&self, ctx: &RuleContext<'_>) -> bool {
        ctx.flags.enable_underlying_aware_exits
            && ctx.risk.underlying_trend_score_threshold > 0.0
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> RuleResult {
        let Some(snapshot) = self.monitor.snapshot(&ctx.tracker.symbol) else {
            return RuleResult::Skip;
        };
        let direction = ctx.position.position_direction;

        if let Some(break_direction) = snapshot.structure_break {
            if break_direction != direction {
                return RuleResult::exit(
                    ExitKind::Underlying,
                    format!("underlying_structure_break {:.2}%", ctx.position.pnl_pct),
                );
            }
        }

        let threshold = ctx.risk.underlying_trend_score_threshold;
        let trend_against = match direction {
            PositionDirection::Bullish => snapshot.trend_score <= -threshold,
            PositionDirection::Bearish => snapshot.trend_score >= threshold,
        };
        if trend_against {
            return RuleResult::exit(
                ExitKind::Underlying,
                format!("underlying_trend_weak {:.2}%", ctx.position.pnl_pct),
            );
        }

        let collapse = ctx.risk.underlying_atr_collapse_multiplier;
        if collapse > 0.0 && snapshot.atr_ratio > 0.0 && snapshot.atr_ratio <= collapse {
            return RuleResult::exit(
                ExitKind::Underlying,
                format!("underlying_atr_collapse {:.2}%", ctx.position.pnl_pct),
            );
        }

        RuleResult::NoAction
    }
}
