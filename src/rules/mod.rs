// =============================================================================
// Rule engine — prioritised exit decision, first match wins
// =============================================================================
//
// Rules are sorted ascending by priority and evaluated in order. The first
// `Exit` is returned; `NoAction` and `Skip` both advance to the next rule.
// A disabled rule (missing or zeroed config) is skipped. A terminal tracker
// short-circuits the whole evaluation to `Skip`.
//
// Rules are pure functions of their context: same context, same result.
// =============================================================================

mod basic;
mod drawdown;
mod underlying;

pub use basic::{SecureProfit, SessionEnd, StopLoss, TakeProfit, TimeBasedExit};
pub use drawdown::{PeakDrawdown, TrailingStop};
pub use underlying::{UnderlyingExit, UnderlyingMonitor, UnderlyingSnapshot};

use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use tracing::{debug, info};

use crate::config::{FeatureFlags, RiskConfig};
use crate::positions::{PositionData, Tracker};
use crate::session::{RegimeSlot, TradingSession};
use crate::types::ExitKind;

/// Everything a rule may look at.
pub struct RuleContext<'a> {
    pub position: &'a PositionData,
    pub tracker: &'a Tracker,
    pub risk: &'a RiskConfig,
    pub flags: &'a FeatureFlags,
    pub now: DateTime<FixedOffset>,
    pub session: &'a TradingSession,
    pub regime: &'a RegimeSlot,
}

/// Outcome of a single rule (and of the whole engine).
#[derive(Debug, Clone, PartialEq)]
pub enum RuleResult {
    /// Exit the position. `reason` is the rule-time detail string; the exit
    /// engine rewrites it with the final net PnL before persisting.
    Exit { kind: ExitKind, reason: String },
    /// The rule looked and decided to hold.
    NoAction,
    /// The rule could not apply (disabled, guard failed, missing data).
    Skip,
}

impl RuleResult {
    pub fn exit(kind: ExitKind, reason: impl Into<String>) -> Self {
        Self::Exit { kind, reason: reason.into() }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Exit { .. })
    }
}

/// One exit rule.
pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Evaluation order: lower fires first.
    fn priority(&self) -> u8;

    /// A rule is enabled when its required config keys are present and
    /// non-zero. Disabled rules are skipped without evaluation.
    fn enabled(&self, ctx: &RuleContext<'_>) -> bool;

    fn evaluate(&self, ctx: &RuleContext<'_>) -> RuleResult;
}

/// Priority-ordered rule set.
pub struct RuleEngine {
    rules: Vec<Box<dyn Rule>>,
}

impl RuleEngine {
    /// Build an engine from a rule set; rules are sorted by priority once,
    /// here, so evaluation order is fixed for the engine's lifetime.
    pub fn new(mut rules: Vec<Box<dyn Rule>>) -> Self {
        rules.sort_by_key(|r| r.priority());
        Self { rules }
    }

    /// The full built-in rule set, priorities 10 through 60.
    pub fn with_default_rules(monitor: Option<Arc<dyn UnderlyingMonitor>>) -> Self {
        let mut rules: Vec<Box<dyn Rule>> = vec![
            Box::new(SessionEnd),
            Box::new(StopLoss),
            Box::new(TakeProfit),
            Box::new(SecureProfit),
            Box::new(TimeBasedExit),
            Box::new(PeakDrawdown),
            Box::new(TrailingStop),
        ];
        if let Some(monitor) = monitor {
            rules.push(Box::new(UnderlyingExit::new(monitor)));
        }
        Self::new(rules)
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Evaluate all rules against the context. First `Exit` wins.
    pub fn evaluate(&self, ctx: &RuleContext<'_>) -> RuleResult {
        if ctx.tracker.is_terminal() {
            debug!(tracker_id = %ctx.tracker.id, "rule engine skip — tracker terminal");
            return RuleResult::Skip;
        }

        for rule in &self.rules {
            if !rule.enabled(ctx) {
                continue;
            }
            match rule.evaluate(ctx) {
                RuleResult::Exit { kind, reason } => {
                    info!(
                        tracker_id = %ctx.tracker.id,
                        rule = rule.name(),
                        priority = rule.priority(),
                        kind = %kind,
                        reason = %reason,
                        "exit rule fired"
                    );
                    return RuleResult::Exit { kind, reason };
                }
                RuleResult::NoAction | RuleResult::Skip => continue,
            }
        }
        RuleResult::NoAction
    }
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("rules", &self.rule_names())
            .finish()
    }
}


// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::fixtures::Fixture;
    use super::*;

    #[test]
    fn rules_sorted_by_priority() {
        let engine = RuleEngine::with_default_rules(None);
        let names = engine.rule_names();
        assert_eq!(
            names,
            vec![
                "session_end",
                "stop_loss",
                "take_profit",
                "secure_profit",
                "time_based_exit",
                "peak_drawdown",
                "trailing_stop",
            ]
        );
    }

    #[test]
    fn stop_loss_scenario() {
        // Entry 100, qty 10, ltp 96, sl_pct 2 -> "SL HIT -4.00%".
        let fx = Fixture::new().with_ltp(96.0);
        let engine = RuleEngine::with_default_rules(None);
        match engine.evaluate(&fx.ctx()) {
            RuleResult::Exit { kind, reason } => {
                assert_eq!(kind, ExitKind::StopLoss);
                assert_eq!(reason, "SL HIT -4.00%");
            }
            other => panic!("expected exit, got {other:?}"),
        }
    }

    #[test]
    fn take_profit_scenario() {
        // Entry 100, qty 10, ltp 107, tp_pct 5 -> "TP HIT 7.00%".
        let fx = Fixture::new().with_ltp(107.0);
        let engine = RuleEngine::with_default_rules(None);
        match engine.evaluate(&fx.ctx()) {
            RuleResult::Exit { kind, reason } => {
                assert_eq!(kind, ExitKind::TakeProfit);
                assert_eq!(reason, "TP HIT 7.00%");
            }
            other => panic!("expected exit, got {other:?}"),
        }
    }

    #[test]
    fn session_end_overrides_take_profit() {
        // TP would fire at +10%, but square-off (priority 10) wins.
        let fx = Fixture::new().with_ltp(110.0).at_time(15, 20);
        let engine = RuleEngine::with_default_rules(None);
        match engine.evaluate(&fx.ctx()) {
            RuleResult::Exit { kind, reason } => {
                assert_eq!(kind, ExitKind::SessionEnd);
                assert!(reason.starts_with("session end"), "{reason}");
            }
            other => panic!("expected exit, got {other:?}"),
        }
    }

    #[test]
    fn terminal_tracker_skips_immediately() {
        let mut fx = Fixture::new().with_ltp(50.0);
        fx.tracker
            .mark_exited(50.0, "SL HIT -50.00%", ExitKind::StopLoss);
        let engine = RuleEngine::with_default_rules(None);
        assert_eq!(engine.evaluate(&fx.ctx()), RuleResult::Skip);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let fx = Fixture::new().with_ltp(96.0);
        let engine = RuleEngine::with_default_rules(None);
        let first = engine.evaluate(&fx.ctx());
        for _ in 0..5 {
            assert_eq!(engine.evaluate(&fx.ctx()), first);
        }
    }

    #[test]
    fn flat_position_holds() {
        let fx = Fixture::new().with_ltp(100.5);
        let engine = RuleEngine::with_default_rules(None);
        assert_eq!(engine.evaluate(&fx.ctx()), RuleResult::NoAction);
    }
}
