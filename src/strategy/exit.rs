//! The exit state machine, as a pure function over the position's mode
//! and current gain. Rules apply in order; the first match wins.

use rust_decimal::Decimal;

use crate::config::Config;
use crate::types::{ExitReason, PositionMode};

#[derive(Debug, Clone)]
pub struct ExitParams {
    pub profit_target_pct: Decimal,
    pub moonbag_pct: Decimal,
    pub drawdown_trigger_pct: Decimal,
    pub protection_exit_pct: Decimal,
    pub hard_stop_pct: Decimal,
    /// Dollar cap on a single trade's unrealized loss. Zero disables.
    pub max_loss_per_trade_usdc: Decimal,
}

impl ExitParams {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            profit_target_pct: cfg.profit_target_pct,
            moonbag_pct: cfg.moonbag_pct,
            drawdown_trigger_pct: cfg.drawdown_trigger_pct,
            protection_exit_pct: cfg.protection_exit_pct,
            hard_stop_pct: cfg.hard_stop_pct,
            max_loss_per_trade_usdc: cfg.max_loss_per_trade_usdc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    Sell(ExitReason),
    Switch(PositionMode),
    Hold,
}

/// Evaluate the exit rules for a managed position.
///
/// `peak_gain_pct` must already include the current `gain_pct`. The
/// mode switches are restricted to Normal so that moonbag and
/// protection stay mutually exclusive even when the bid gaps.
pub fn evaluate(
    params: &ExitParams,
    mode: PositionMode,
    gain_pct: Decimal,
    peak_gain_pct: Decimal,
    loss_usd: Decimal,
) -> ExitDecision {
    let dollar_cap_hit = !params.max_loss_per_trade_usdc.is_zero()
        && loss_usd >= params.max_loss_per_trade_usdc;

    if gain_pct <= params.hard_stop_pct || dollar_cap_hit {
        return ExitDecision::Sell(ExitReason::HardStop);
    }
    if mode == PositionMode::Protection && gain_pct >= params.protection_exit_pct {
        return ExitDecision::Sell(ExitReason::Protection);
    }
    if mode == PositionMode::Normal && gain_pct <= params.drawdown_trigger_pct {
        return ExitDecision::Switch(PositionMode::Protection);
    }
    if mode == PositionMode::Moonbag && gain_pct <= params.profit_target_pct {
        return ExitDecision::Sell(ExitReason::MoonbagTrail);
    }
    if mode == PositionMode::Normal && peak_gain_pct >= params.moonbag_pct {
        return ExitDecision::Switch(PositionMode::Moonbag);
    }
    if mode != PositionMode::Moonbag && gain_pct >= params.profit_target_pct {
        return ExitDecision::Sell(ExitReason::TakeProfit);
    }
    ExitDecision::Hold
}

/// Realized P&L for a fill. The fee applies to gross profit only;
/// losses carry no fee.
pub fn realized_pnl(
    entry: Decimal,
    exit: Decimal,
    shares: Decimal,
    fee_rate: Decimal,
) -> Decimal {
    let gross = (exit - entry) * shares;
    if gross > Decimal::ZERO {
        gross * (Decimal::ONE - fee_rate)
    } else {
        gross
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn params() -> ExitParams {
        ExitParams {
            profit_target_pct: dec!(10),
            moonbag_pct: dec!(20),
            drawdown_trigger_pct: dec!(-15),
            protection_exit_pct: dec!(-10),
            hard_stop_pct: dec!(-25),
            max_loss_per_trade_usdc: Decimal::ZERO,
        }
    }

    fn eval(mode: PositionMode, gain: Decimal, peak: Decimal) -> ExitDecision {
        evaluate(&params(), mode, gain, peak, Decimal::ZERO)
    }

    #[test]
    fn test_hold_below_target() {
        // 9.80% gain: under the +10 target, no exit.
        assert_eq!(
            eval(PositionMode::Normal, dec!(9.80), dec!(9.80)),
            ExitDecision::Hold
        );
    }

    #[test]
    fn test_take_profit_at_target() {
        assert_eq!(
            eval(PositionMode::Normal, dec!(10.20), dec!(10.20)),
            ExitDecision::Sell(ExitReason::TakeProfit)
        );
        // Boundary is inclusive.
        assert_eq!(
            eval(PositionMode::Normal, dec!(10), dec!(10)),
            ExitDecision::Sell(ExitReason::TakeProfit)
        );
    }

    #[test]
    fn test_moonbag_switch_then_trail() {
        // +24% flips to moonbag instead of selling.
        assert_eq!(
            eval(PositionMode::Normal, dec!(24), dec!(24)),
            ExitDecision::Switch(PositionMode::Moonbag)
        );
        // Riding at +15 with peak +32: still holding.
        assert_eq!(eval(PositionMode::Moonbag, dec!(15), dec!(32)), ExitDecision::Hold);
        // Pullback to +10 trails out.
        assert_eq!(
            eval(PositionMode::Moonbag, dec!(10), dec!(32)),
            ExitDecision::Sell(ExitReason::MoonbagTrail)
        );
    }

    #[test]
    fn test_protection_switch_then_exit() {
        assert_eq!(
            eval(PositionMode::Normal, dec!(-17), dec!(0)),
            ExitDecision::Switch(PositionMode::Protection)
        );
        // Still under water past the exit level: hold.
        assert_eq!(eval(PositionMode::Protection, dec!(-12), dec!(0)), ExitDecision::Hold);
        // Recovered to -9.5: take the bounded loss.
        assert_eq!(
            eval(PositionMode::Protection, dec!(-9.5), dec!(0)),
            ExitDecision::Sell(ExitReason::Protection)
        );
    }

    #[test]
    fn test_hard_stop_inclusive_boundary() {
        assert_eq!(
            eval(PositionMode::Normal, dec!(-25), dec!(0)),
            ExitDecision::Sell(ExitReason::HardStop)
        );
        assert_eq!(
            eval(PositionMode::Normal, dec!(-26), dec!(0)),
            ExitDecision::Sell(ExitReason::HardStop)
        );
        assert_eq!(
            eval(PositionMode::Normal, dec!(-24.9), dec!(0)),
            ExitDecision::Switch(PositionMode::Protection)
        );
    }

    #[test]
    fn test_hard_stop_beats_protection_exit() {
        // Protection-mode position gapping to -26 hard-stops; rule order.
        assert_eq!(
            eval(PositionMode::Protection, dec!(-26), dec!(0)),
            ExitDecision::Sell(ExitReason::HardStop)
        );
    }

    #[test]
    fn test_moonbag_never_enters_protection() {
        // A moonbag position gapping deep negative trails out; it must
        // not switch to protection.
        assert_eq!(
            eval(PositionMode::Moonbag, dec!(-16), dec!(32)),
            ExitDecision::Sell(ExitReason::MoonbagTrail)
        );
    }

    #[test]
    fn test_protection_never_enters_moonbag() {
        assert_eq!(
            eval(PositionMode::Protection, dec!(-11), dec!(25)),
            ExitDecision::Hold
        );
    }

    #[test]
    fn test_dollar_cap_folds_into_hard_stop() {
        let p = ExitParams {
            max_loss_per_trade_usdc: dec!(12),
            ..params()
        };
        assert_eq!(
            evaluate(&p, PositionMode::Normal, dec!(-13), dec!(0), dec!(12.50)),
            ExitDecision::Sell(ExitReason::HardStop)
        );
        // Same gain, smaller dollar loss: normal drawdown path.
        assert_eq!(
            evaluate(&p, PositionMode::Normal, dec!(-13), dec!(0), dec!(6.50)),
            ExitDecision::Hold
        );
    }

    #[test]
    fn test_realized_pnl_fee_on_gains_only() {
        // 196 shares, 0.51 -> 0.562: gross 10.192, net 9.98816.
        let pnl = realized_pnl(dec!(0.51), dec!(0.562), dec!(196), dec!(0.02));
        assert_eq!(pnl, dec!(9.988160));

        // Loss carries no fee: 0.55 -> 0.4975 on ~181.81 shares.
        let pnl = realized_pnl(dec!(0.55), dec!(0.4975), dec!(181), dec!(0.02));
        assert_eq!(pnl, dec!(-9.5025));
    }

    #[test]
    fn test_realized_pnl_resolution() {
        // Winning resolution: shares * (1 - entry) * (1 - fee).
        let pnl = realized_pnl(dec!(0.50), Decimal::ONE, dec!(200), dec!(0.02));
        assert_eq!(pnl, dec!(98.00));

        // Losing resolution burns the full cost.
        let pnl = realized_pnl(dec!(0.50), Decimal::ZERO, dec!(200), dec!(0.02));
        assert_eq!(pnl, dec!(-100.00));
    }
}
