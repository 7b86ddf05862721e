//! Strategy 2: passive limit entry on a fixed side.
//!
//! The moment a window turns active, buy the configured side if it is
//! still quoted near the coin-flip price, then rest a sell at the
//! target. One side always drifts toward the target as the window picks
//! a direction; the edge is the spread between the two.
//!
//! The fixed-side rule is deliberately blunt. It mirrors the original
//! deployment and is cheap to re-point via PASSIVE_SIDE.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::config::Config;
use crate::types::{ExitPolicy, OrderType, Side, StrategyKind};

use super::{EntryRequest, EntryStrategy, ScanCtx};

/// Acceptable band above the configured entry price.
const ENTRY_BAND: Decimal = dec!(0.03);

pub struct PassiveStrategy {
    side: Side,
    entry_price: Decimal,
    sell_price: Decimal,
}

impl PassiveStrategy {
    pub fn new(cfg: &Config) -> Self {
        Self {
            side: cfg.passive_side,
            entry_price: cfg.passive_entry_price,
            sell_price: cfg.passive_sell_price,
        }
    }
}

#[async_trait]
impl EntryStrategy for PassiveStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Passive
    }

    async fn scan(&mut self, ctx: &ScanCtx<'_>) -> Vec<EntryRequest> {
        let mut requests = Vec::new();

        for slug in ctx.newly_active {
            let Some(window) = ctx.windows.iter().find(|w| &w.slug == slug) else {
                continue;
            };
            if window.fired.get(StrategyKind::Passive) {
                continue;
            }

            // The band check happens here rather than at the engine so
            // an off-band book is a quiet skip, not a dropped signal.
            let token = window.token_for(self.side);
            let ask = match ctx.venue.best_ask(token).await {
                Ok(Some(ask)) => ask,
                Ok(None) => {
                    debug!("No {} ask for {}, skipping passive entry", self.side, slug);
                    continue;
                }
                Err(e) => {
                    debug!("Passive book fetch failed for {}: {}", slug, e);
                    continue;
                }
            };

            let cap = self.entry_price + ENTRY_BAND;
            if ask < self.entry_price || ask > cap {
                debug!(
                    "Passive skip {}: {} ask ${} outside ${}-${}",
                    slug, self.side, ask, self.entry_price, cap
                );
                continue;
            }

            requests.push(EntryRequest {
                strategy: StrategyKind::Passive,
                slug: slug.clone(),
                side: self.side,
                order_type: OrderType::Limit,
                limit_price: Some(ask),
                price_cap: cap,
                policy: ExitPolicy::LimitTarget(self.sell_price),
                note: format!(
                    "passive {} @ ${} -> sell ${}",
                    self.side, ask, self.sell_price
                ),
            });
        }

        requests
    }
}
