//! Entry gates that sit in front of every new position: the daily loss
//! limit, the loss-streak cool-off, and (via the exit machine) the
//! per-trade dollar cap.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::warn;

use crate::time_util::date_key;

#[derive(Debug)]
pub struct RiskGates {
    /// Entries stop once the Eastern-day P&L falls to this. Zero disables.
    daily_loss_limit_usdc: Decimal,
    consecutive_losses_to_pause: u32,
    pause_after_streak: Duration,

    day_key: String,
    day_pnl: Decimal,
    consecutive_losses: u32,
    paused_until: Option<DateTime<Utc>>,
}

/// Why an entry was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskBlock {
    DailyLossLimit,
    LossStreakPause,
}

impl RiskBlock {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskBlock::DailyLossLimit => "daily_loss_limit",
            RiskBlock::LossStreakPause => "loss_streak_pause",
        }
    }
}

impl RiskGates {
    pub fn new(
        daily_loss_limit_usdc: Decimal,
        consecutive_losses_to_pause: u32,
        pause_minutes_after_streak: f64,
    ) -> Self {
        Self {
            daily_loss_limit_usdc,
            consecutive_losses_to_pause,
            pause_after_streak: Duration::milliseconds(
                (pause_minutes_after_streak * 60_000.0) as i64,
            ),
            day_key: String::new(),
            day_pnl: Decimal::ZERO,
            consecutive_losses: 0,
            paused_until: None,
        }
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        let key = date_key(now);
        if self.day_key != key {
            self.day_key = key;
            self.day_pnl = Decimal::ZERO;
        }
    }

    /// Check whether new entries are currently allowed.
    pub fn check(&mut self, now: DateTime<Utc>) -> Result<(), RiskBlock> {
        self.roll_day(now);

        if let Some(until) = self.paused_until {
            if now < until {
                return Err(RiskBlock::LossStreakPause);
            }
            self.paused_until = None;
        }

        if !self.daily_loss_limit_usdc.is_zero() && self.day_pnl <= self.daily_loss_limit_usdc {
            return Err(RiskBlock::DailyLossLimit);
        }

        Ok(())
    }

    /// Feed every closed trade through here.
    pub fn record_close(&mut self, pnl: Decimal, now: DateTime<Utc>) {
        self.roll_day(now);
        self.day_pnl += pnl;

        if pnl < Decimal::ZERO {
            self.consecutive_losses += 1;
            if self.consecutive_losses_to_pause > 0
                && self.consecutive_losses >= self.consecutive_losses_to_pause
            {
                let until = now + self.pause_after_streak;
                warn!(
                    "{} consecutive losses, pausing new entries until {}",
                    self.consecutive_losses,
                    crate::time_util::format_eastern(until)
                );
                self.paused_until = Some(until);
                self.consecutive_losses = 0;
            }
        } else {
            self.consecutive_losses = 0;
        }
    }

    pub fn day_pnl(&self) -> Decimal {
        self.day_pnl
    }

    pub fn paused_until(&self) -> Option<DateTime<Utc>> {
        self.paused_until
    }
}
