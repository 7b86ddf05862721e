//! Strategy 3: late-window leader.
//!
//! By the last ninety seconds the direction of a window is mostly
//! decided. Track the highest mid each side reaches during the tracking
//! phase; at the decision mark buy the side that established itself,
//! unless both sides ran hot (choppy tape, no edge). Positions ride to
//! resolution, with a manipulation escape hatch handled by the engine.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::Config;
use crate::events::EventKind;
use crate::types::{ExitPolicy, OrderType, Side, StrategyKind};

use super::{EntryRequest, EntryStrategy, ScanCtx};

/// Sanity ceiling on the entry ask; above this the payout is not worth
/// the resolution risk.
const ENTRY_CEILING: Decimal = dec!(0.95);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LateDecision {
    Buy(Side),
    SkipChoppy,
    SkipNoLeader,
}

/// Per-window price highs observed during the tracking phase.
#[derive(Debug, Default)]
struct WindowHighs {
    up_high: Decimal,
    down_high: Decimal,
    tracking: bool,
    decided: bool,
}

pub struct LateStrategy {
    entry_threshold: Decimal,
    choppy_cutoff: Decimal,
    tracking_start: f64,
    decision_at: f64,
    highs: HashMap<String, WindowHighs>,
    pub skipped_choppy: u64,
    pub skipped_no_leader: u64,
}

impl LateStrategy {
    pub fn new(cfg: &Config) -> Self {
        Self {
            entry_threshold: cfg.late_entry_price,
            choppy_cutoff: cfg.choppy_cutoff,
            tracking_start: cfg.tracking_start_sec_before_end,
            decision_at: cfg.decision_sec_before_end,
            highs: HashMap::new(),
            skipped_choppy: 0,
            skipped_no_leader: 0,
        }
    }

    /// The decision rule over the observed highs: exactly one side must
    /// have established itself while the other stayed quiet.
    fn decide(&self, up_high: Decimal, down_high: Decimal) -> LateDecision {
        if up_high >= self.choppy_cutoff && down_high >= self.choppy_cutoff {
            return LateDecision::SkipChoppy;
        }
        if up_high >= self.entry_threshold && down_high < self.choppy_cutoff {
            return LateDecision::Buy(Side::Up);
        }
        if down_high >= self.entry_threshold && up_high < self.choppy_cutoff {
            return LateDecision::Buy(Side::Down);
        }
        LateDecision::SkipNoLeader
    }
}

#[async_trait]
impl EntryStrategy for LateStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Late
    }

    async fn scan(&mut self, ctx: &ScanCtx<'_>) -> Vec<EntryRequest> {
        let mut requests = Vec::new();

        // Forget windows that are gone from the registry.
        let live: std::collections::HashSet<&str> =
            ctx.windows.iter().map(|w| w.slug.as_str()).collect();
        self.highs.retain(|slug, _| live.contains(slug.as_str()));

        for window in ctx.windows {
            if window.fired.get(StrategyKind::Late) {
                continue;
            }
            let remaining = window.seconds_remaining(ctx.now);
            if remaining <= 0.0 || remaining > crate::windows::WINDOW_SECONDS {
                continue;
            }

            let highs = self.highs.entry(window.slug.clone()).or_default();
            if highs.decided {
                continue;
            }

            if remaining <= self.tracking_start && remaining > self.decision_at {
                if !highs.tracking {
                    highs.tracking = true;
                    info!(
                        "Late tracking {} ({:.0}s left)",
                        window.slug, remaining
                    );
                }

                // Observe both sides' mids and keep the highs.
                let up_mid = ctx
                    .venue
                    .get_book(&window.up_token_id)
                    .await
                    .ok()
                    .and_then(|b| b.mid());
                let down_mid = ctx
                    .venue
                    .get_book(&window.down_token_id)
                    .await
                    .ok()
                    .and_then(|b| b.mid());

                if let Some(mid) = up_mid {
                    highs.up_high = highs.up_high.max(mid);
                }
                if let Some(mid) = down_mid {
                    highs.down_high = highs.down_high.max(mid);
                }
            } else if remaining <= self.decision_at {
                highs.decided = true;
                let (up_high, down_high) = (highs.up_high, highs.down_high);
                debug!(
                    "Late decision {}: up_high=${} down_high=${}",
                    window.slug, up_high, down_high
                );

                match self.decide(up_high, down_high) {
                    LateDecision::Buy(side) => {
                        requests.push(EntryRequest {
                            strategy: StrategyKind::Late,
                            slug: window.slug.clone(),
                            side,
                            order_type: OrderType::Market,
                            limit_price: None,
                            price_cap: ENTRY_CEILING,
                            policy: ExitPolicy::HoldToResolution,
                            note: format!(
                                "late leader {} (high ${}, other ${})",
                                side,
                                if side == Side::Up { up_high } else { down_high },
                                if side == Side::Up { down_high } else { up_high },
                            ),
                        });
                    }
                    LateDecision::SkipChoppy => {
                        self.skipped_choppy += 1;
                        ctx.events.push(
                            EventKind::Info,
                            format!(
                                "late skip {}: choppy (up ${} down ${})",
                                window.slug, up_high, down_high
                            ),
                        );
                    }
                    LateDecision::SkipNoLeader => {
                        self.skipped_no_leader += 1;
                        ctx.events.push(
                            EventKind::Info,
                            format!(
                                "late skip {}: no leader (up ${} down ${})",
                                window.slug, up_high, down_high
                            ),
                        );
                    }
                }
            }
        }

        requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy() -> LateStrategy {
        LateStrategy::new(&Config::from_env().unwrap())
    }

    #[test]
    fn test_decide_buys_dominant_up() {
        let s = strategy();
        assert_eq!(s.decide(dec!(0.74), dec!(0.30)), LateDecision::Buy(Side::Up));
    }

    #[test]
    fn test_decide_buys_dominant_down() {
        let s = strategy();
        assert_eq!(s.decide(dec!(0.28), dec!(0.81)), LateDecision::Buy(Side::Down));
    }

    #[test]
    fn test_decide_skips_choppy_tape() {
        // Both sides touched 0.65+: the market flipped back and forth.
        let s = strategy();
        assert_eq!(s.decide(dec!(0.72), dec!(0.66)), LateDecision::SkipChoppy);
    }

    #[test]
    fn test_decide_skips_without_leader() {
        let s = strategy();
        assert_eq!(s.decide(dec!(0.55), dec!(0.52)), LateDecision::SkipNoLeader);
    }

    #[test]
    fn test_decide_leader_blocked_by_warm_other_side() {
        // Up leads at 0.71 but Down also crossed the cutoff earlier.
        let s = strategy();
        assert_eq!(s.decide(dec!(0.71), dec!(0.65)), LateDecision::SkipChoppy);
    }

    #[test]
    fn test_decide_threshold_boundaries() {
        let s = strategy();
        // Exactly at the entry threshold counts.
        assert_eq!(s.decide(dec!(0.70), dec!(0.40)), LateDecision::Buy(Side::Up));
        // Just under does not.
        assert_eq!(s.decide(dec!(0.699), dec!(0.40)), LateDecision::SkipNoLeader);
    }
}
