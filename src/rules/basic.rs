// =============================================================================
// Core exit rules — session end, stop loss, take profit, secure profit,
// time-based exit
// =============================================================================

use crate::session::parse_hhmm;
use crate::types::ExitKind;

use super::{Rule, RuleContext, RuleResult};

/// Division/zero guards shared by the percentage rules.
fn pnl_guards_ok(ctx: &RuleContext<'_>) -> bool {
    ctx.position.entry_price > 0.0 && ctx.position.quantity > 0
}

// ---------------------------------------------------------------------------
// SessionEnd — priority 10
// ---------------------------------------------------------------------------

/// Forced square-off: once the session says positions must flatten, nothing
/// else gets a say.
pub struct SessionEnd;

impl Rule for SessionEnd {
    fn name(&self) -> &'static str {
        "session_end"
    }

    fn priority(&self) -> u8 {
        10
    }

    fn enabled(&self, _ctx: &RuleContext<'_>) -> bool {
        true
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> RuleResult {
        if ctx.session.should_force_exit(ctx.now) {
            RuleResult::exit(
                ExitKind::SessionEnd,
                format!("session end {:.2}%", ctx.position.pnl_pct),
            )
        } else {
            RuleResult::NoAction
        }
    }
}

// ---------------------------------------------------------------------------
// StopLoss — priority 20
// ---------------------------------------------------------------------------

/// Exit when pnl_pct falls to -sl_pct (regime-scaled).
pub struct StopLoss;

impl Rule for StopLoss {
    fn name(&self) -> &'static str {
        "stop_loss"
    }

    fn priority(&self) -> u8 {
        20
    }

    fn enabled(&self, ctx: &RuleContext<'_>) -> bool {
        ctx.risk.sl_pct > 0.0
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> RuleResult {
        if !pnl_guards_ok(ctx) {
            return RuleResult::Skip;
        }
        let threshold = ctx.risk.sl_pct * ctx.regime.sl_multiplier();
        if ctx.position.pnl_pct <= -threshold {
            RuleResult::exit(
                ExitKind::StopLoss,
                format!("SL HIT {:.2}%", ctx.position.pnl_pct),
            )
        } else {
            RuleResult::NoAction
        }
    }
}

// ---------------------------------------------------------------------------
// TakeProfit — priority 30
// ---------------------------------------------------------------------------

/// Exit when pnl_pct reaches tp_pct (regime-scaled) or the regime's rupee
/// cap, whichever comes first.
pub struct TakeProfit;

impl Rule for TakeProfit {
    fn name(&self) -> &'static str {
        "take_profit"
    }

    fn priority(&self) -> u8 {
        30
    }

    fn enabled(&self, ctx: &RuleContext<'_>) -> bool {
        ctx.risk.tp_pct > 0.0
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> RuleResult {
        if !pnl_guards_ok(ctx) {
            return RuleResult::Skip;
        }
        let threshold = ctx.risk.tp_pct * ctx.regime.tp_multiplier();
        let rupee_cap = ctx.regime.max_tp_rupees();

        let pct_hit = ctx.position.pnl_pct >= threshold;
        let cap_hit = rupee_cap > 0.0 && ctx.position.pnl >= rupee_cap;

        if pct_hit || cap_hit {
            RuleResult::exit(
                ExitKind::TakeProfit,
                format!("TP HIT {:.2}%", ctx.position.pnl_pct),
            )
        } else {
            RuleResult::NoAction
        }
    }
}

// ---------------------------------------------------------------------------
// SecureProfit — priority 35
// ---------------------------------------------------------------------------

/// Once rupee profit has reached the secure threshold, protect it: a
/// drawdown from peak of `secure_profit_drawdown_pct` points exits.
pub struct SecureProfit;

impl Rule for SecureProfit {
    fn name(&self) -> &'static str {
        "secure_profit"
    }

    fn priority(&self) -> u8 {
        35
    }

    fn enabled(&self, ctx: &RuleContext<'_>) -> bool {
        ctx.risk.secure_profit_threshold_rupees > 0.0
            && ctx.risk.secure_profit_drawdown_pct > 0.0
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> RuleResult {
        if !pnl_guards_ok(ctx) {
            return RuleResult::Skip;
        }
        let p = ctx.position;
        let drawdown = p.peak_profit_pct - p.pnl_pct;
        if p.pnl >= ctx.risk.secure_profit_threshold_rupees
            && drawdown >= ctx.risk.secure_profit_drawdown_pct
        {
            RuleResult::exit(
                ExitKind::SecureProfit,
                format!("secure profit {:.2}%", p.pnl_pct),
            )
        } else {
            RuleResult::NoAction
        }
    }
}

// ---------------------------------------------------------------------------
// TimeBasedExit — priority 40
// ---------------------------------------------------------------------------

/// From `time_exit_hhmm` until market close, exit positions that have made
/// at least `min_profit_rupees` (0 accepts any PnL).
pub struct TimeBasedExit;

impl Rule for TimeBasedExit {
    fn name(&self) -> &'static str {
        "time_based_exit"
    }

    fn priority(&self) -> u8 {
        40
    }

    fn enabled(&self, ctx: &RuleContext<'_>) -> bool {
        !ctx.risk.time_exit_hhmm.is_empty()
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> RuleResult {
        let t = ctx.now.time();
        let exit_from = parse_hhmm(&ctx.risk.time_exit_hhmm, ctx.session.square_off);
        let close = parse_hhmm(&ctx.risk.market_close_hhmm, ctx.session.close);

        if t < exit_from || t >= close {
            return RuleResult::NoAction;
        }
        let min = ctx.risk.min_profit_rupees;
        if min > 0.0 && ctx.position.pnl < min {
            return RuleResult::NoAction;
        }
        RuleResult::exit(
            ExitKind::TimeBased,
            format!("time-based exit {:.2}%", ctx.position.pnl_pct),
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::super::fixtures::Fixture;
    use super::*;

    #[test]
    fn stop_loss_fires_at_threshold() {
        let fx = Fixture::new().with_ltp(98.0); // exactly -2%
        assert!(StopLoss.evaluate(&fx.ctx()).is_exit());

        let fx = Fixture::new().with_ltp(98.1);
        assert_eq!(StopLoss.evaluate(&fx.ctx()), RuleResult::NoAction);
    }

    #[test]
    fn stop_loss_disabled_when_zeroed() {
        let mut fx = Fixture::new().with_ltp(90.0);
        fx.risk.sl_pct = 0.0;
        assert!(!StopLoss.enabled(&fx.ctx()));
    }

    #[test]
    fn zero_entry_price_skips() {
        let mut fx = Fixture::new();
        fx.position.entry_price = 0.0;
        assert_eq!(StopLoss.evaluate(&fx.ctx()), RuleResult::Skip);
        assert_eq!(TakeProfit.evaluate(&fx.ctx()), RuleResult::Skip);
        assert_eq!(SecureProfit.evaluate(&fx.ctx()), RuleResult::Skip);
    }

    #[test]
    fn zero_quantity_skips() {
        let mut fx = Fixture::new();
        fx.position.quantity = 0;
        assert_eq!(StopLoss.evaluate(&fx.ctx()), RuleResult::Skip);
    }

    #[test]
    fn regime_multiplier_scales_stop() {
        let mut fx = Fixture::new().with_ltp(98.0); // -2%
        // Regime widens the stop to 2 * 1.2 = 2.4% -> no exit at -2%.
        let mut params = crate::config::RuntimeConfig::default()
            .time_regimes
            .get("open_expansion")
            .cloned()
            .unwrap();
        params.sl_multiplier = 1.2;
        fx.regime.params = Some(params);
        assert_eq!(StopLoss.evaluate(&fx.ctx()), RuleResult::NoAction);
    }

    #[test]
    fn take_profit_rupee_cap() {
        let mut fx = Fixture::new().with_ltp(103.0); // +3%, pnl = 30
        let mut params = crate::config::RuntimeConfig::default()
            .time_regimes
            .get("chop_decay")
            .cloned()
            .unwrap();
        params.tp_multiplier = 1.0;
        params.max_tp_rupees = 25.0;
        fx.regime.params = Some(params);
        assert!(TakeProfit.evaluate(&fx.ctx()).is_exit());
    }

    #[test]
    fn secure_profit_requires_both_conditions() {
        // Rupee threshold met, but no drawdown from peak.
        let mut fx = Fixture::new().with_ltp(110.0);
        fx.position.quantity = 200;
        fx.position.recalculate_pnl(); // pnl = 2000
        assert_eq!(SecureProfit.evaluate(&fx.ctx()), RuleResult::NoAction);

        // Now the peak runs ahead and price falls back enough.
        fx.position.apply_ltp(120.0); // peak 20%
        fx.position.apply_ltp(110.0); // pnl 2000, drawdown 10 pts >= 6
        assert!(SecureProfit.evaluate(&fx.ctx()).is_exit());
    }

    #[test]
    fn time_based_exit_needs_min_profit() {
        // Scenario: pnl 100, min_profit 200, past exit time -> NoAction.
        let mut fx = Fixture::new().with_ltp(110.0).at_time(14, 50);
        fx.risk.min_profit_rupees = 200.0;
        assert_eq!(TimeBasedExit.evaluate(&fx.ctx()), RuleResult::NoAction);

        // Met threshold exits.
        fx.risk.min_profit_rupees = 100.0;
        assert!(TimeBasedExit.evaluate(&fx.ctx()).is_exit());
    }

    #[test]
    fn time_based_exit_respects_window() {
        let mut fx = Fixture::new().with_ltp(105.0).at_time(14, 0);
        fx.risk.min_profit_rupees = 0.0;
        assert_eq!(TimeBasedExit.evaluate(&fx.ctx()), RuleResult::NoAction);

        // After market close the session-end rule owns the exit.
        let mut fx = Fixture::new().with_ltp(105.0).at_time(15, 45);
        fx.risk.min_profit_rupees = 0.0;
        assert_eq!(TimeBasedExit.evaluate(&fx.ctx()), RuleResult::NoAction);
    }

    #[test]
    fn session_end_only_after_square_off() {
        let fx = Fixture::new().with_ltp(100.0).at_time(15, 11);
        assert_eq!(SessionEnd.evaluate(&fx.ctx()), RuleResult::NoAction);

        let fx = Fixture::new().with_ltp(100.0).at_time(15, 12);
        assert!(SessionEnd.evaluate(&fx.ctx()).is_exit());
    }
}
