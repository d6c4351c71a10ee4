// =============================================================================
// Drawdown rules — tiered peak drawdown and HWM trailing stop
// =============================================================================

use crate::config::DrawdownTier;
use crate::types::ExitKind;

use super::{Rule, RuleContext, RuleResult};

// ---------------------------------------------------------------------------
// PeakDrawdown — priority 45
// ---------------------------------------------------------------------------

/// Tiered giveback protection. The drawdown threshold is a monotone step
/// function of peak profit (deeper peaks tolerate slightly deeper pullbacks
/// before exiting). Pre-profit drawdown is ignored: the rule only engages
/// once peak profit is strictly positive and has reached the first tier.
///
/// When `enable_peak_drawdown_activation` is on, the rule additionally
/// requires the trailing stop offset to have climbed to a configured
/// fraction of peak before it may fire.
pub struct PeakDrawdown;

/// Threshold for the given peak, from the highest tier the peak has reached.
/// Below the first tier there is no threshold.
fn tier_threshold(tiers: &[DrawdownTier], peak_pct: f64) -> Option<f64> {
    tiers
        .iter()
        .filter(|t| peak_pct >= t.min_peak_pct)
        .map(|t| t.drawdown_pct)
        .last()
}

impl Rule for PeakDrawdown {
    fn name(&self) -> &'static str {
        "peak_drawdown"
    }

    fn priority(&self) -> u8 {
        45
    }

    fn enabled(&self, ctx: &RuleContext<'_>) -> bool {
        ctx.risk.peak_drawdown_pct > 0.0 && !ctx.risk.drawdown_tiers.is_empty()
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> RuleResult {
        let p = ctx.position;
        if p.entry_price <= 0.0 || p.quantity <= 0 {
            return RuleResult::Skip;
        }
        if p.peak_profit_pct <= 0.0 {
            return RuleResult::NoAction;
        }

        let Some(threshold) = tier_threshold(&ctx.risk.drawdown_tiers, p.peak_profit_pct) else {
            return RuleResult::NoAction;
        };

        let drawdown = p.peak_profit_pct - p.pnl_pct;
        if drawdown < threshold {
            return RuleResult::NoAction;
        }

        if ctx.flags.enable_peak_drawdown_activation {
            let activated = p.peak_profit_pct >= ctx.risk.activation_profit_pct
                && p.sl_offset_pct >= ctx.risk.activation_sl_offset_pct * p.peak_profit_pct;
            if !activated {
                return RuleResult::NoAction;
            }
        }

        RuleResult::exit(
            ExitKind::PeakDrawdown,
            format!(
                "peak_drawdown_exit (drawdown: {:.2}%, threshold: {:.2}%, peak: {:.2}%)",
                drawdown, threshold, p.peak_profit_pct
            ),
        )
    }
}

// ---------------------------------------------------------------------------
// TrailingStop — priority 50
// ---------------------------------------------------------------------------

/// Exit when rupee PnL has given back `exit_drop_pct` of its high-water
/// mark. Only meaningful once the HWM is strictly positive.
pub struct TrailingStop;

impl Rule for TrailingStop {
    fn name(&self) -> &'static str {
        "trailing_stop"
    }

    fn priority(&self) -> u8 {
        50
    }

    fn enabled(&self, ctx: &RuleContext<'_>) -> bool {
        ctx.risk.exit_drop_pct > 0.0
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> RuleResult {
        let p = ctx.position;
        if p.high_water_mark <= 0.0 {
            return RuleResult::Skip;
        }

        let drop = (p.high_water_mark - p.pnl) / p.high_water_mark;
        if drop >= ctx.risk.exit_drop_pct {
            RuleResult::exit(
                ExitKind::TrailingStop,
                format!("TRAILING STOP {:.2}%", p.pnl_pct),
            )
        } else {
            RuleResult::NoAction
        }
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
    fn tier_lookup_is_stepwise() {
        let tiers = crate::config::RuntimeConfig::default().risk.drawdown_tiers;
        assert_eq!(tier_threshold(&tiers, 3.0), None);
        assert_eq!(tier_threshold(&tiers, 7.0), Some(3.0));
        assert_eq!(tier_threshold(&tiers, 15.0), Some(4.0));
        assert_eq!(tier_threshold(&tiers, 25.0), Some(5.0));
    }

    #[test]
    fn peak_drawdown_scenario() {
        // Entry 100, ltp 120 after a 25% peak; tier threshold 5, drawdown 5.
        let fx = Fixture::new().with_ltp(125.0).with_ltp(120.0);
        match PeakDrawdown.evaluate(&fx.ctx()) {
            RuleResult::Exit { kind, reason } => {
                assert_eq!(kind, ExitKind::PeakDrawdown);
                assert_eq!(
                    reason,
                    "peak_drawdown_exit (drawdown: 5.00%, threshold: 5.00%, peak: 25.00%)"
                );
            }
            other => panic!("expected exit, got {other:?}"),
        }
    }

    #[test]
    fn pre_profit_drawdown_ignored() {
        // Straight down from entry: peak never went positive.
        let fx = Fixture::new().with_ltp(99.0);
        assert_eq!(PeakDrawdown.evaluate(&fx.ctx()), RuleResult::NoAction);
    }

    #[test]
    fn below_first_tier_no_exit() {
        // Peak 4% then give it all back: below the 5% first tier.
        let fx = Fixture::new().with_ltp(104.0).with_ltp(100.1);
        assert_eq!(PeakDrawdown.evaluate(&fx.ctx()), RuleResult::NoAction);
    }

    #[test]
    fn activation_gating_blocks_until_offset_reached() {
        let mut fx = Fixture::new().with_ltp(125.0).with_ltp(120.0);
        fx.flags.enable_peak_drawdown_activation = true;
        fx.risk.activation_profit_pct = 5.0;
        fx.risk.activation_sl_offset_pct = 0.5;

        // SL offset has not reached 0.5 * peak -> gated.
        fx.position.sl_offset_pct = 2.0;
        assert_eq!(PeakDrawdown.evaluate(&fx.ctx()), RuleResult::NoAction);

        // Offset catches up -> fires.
        fx.position.sl_offset_pct = 13.0;
        assert!(PeakDrawdown.evaluate(&fx.ctx()).is_exit());
    }

    #[test]
    fn trailing_stop_fires_on_hwm_giveback() {
        // HWM 200 rupees, now 120 -> drop 40% >= 35%.
        let fx = Fixture::new().with_ltp(120.0).with_ltp(112.0);
        match TrailingStop.evaluate(&fx.ctx()) {
            RuleResult::Exit { kind, .. } => assert_eq!(kind, ExitKind::TrailingStop),
            other => panic!("expected exit, got {other:?}"),
        }
    }

    #[test]
    fn trailing_stop_skips_without_hwm() {
        let fx = Fixture::new().with_ltp(99.0);
        assert_eq!(TrailingStop.evaluate(&fx.ctx()), RuleResult::Skip);
    }

    #[test]
    fn trailing_stop_holds_within_tolerance() {
        // HWM 200, now 140 -> drop 30% < 35%.
        let fx = Fixture::new().with_ltp(120.0).with_ltp(114.0);
        assert_eq!(TrailingStop.evaluate(&fx.ctx()), RuleResult::NoAction);
    }
}
