//! Strategy 1: spike-following.
//!
//! When the spot price moves at least `spike_move_usd` within
//! `spike_window_sec`, the outcome of every active window is close to
//! decided while the venue books lag. Buy the winning side at market
//! before they catch up; the managed exit machine does the rest.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::config::Config;
use crate::types::{ExitPolicy, OrderType, Side, StrategyKind};
use crate::windows::Phase;

use super::{EntryRequest, EntryStrategy, ScanCtx};

pub struct SpikeStrategy {
    move_usd: Decimal,
    window_sec: f64,
    max_entry_price: Decimal,
}

impl SpikeStrategy {
    pub fn new(cfg: &Config) -> Self {
        Self {
            move_usd: cfg.spike_move_usd,
            window_sec: cfg.spike_window_sec,
            max_entry_price: cfg.max_entry_price,
        }
    }
}

#[async_trait]
impl EntryStrategy for SpikeStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Spike
    }

    async fn scan(&mut self, ctx: &ScanCtx<'_>) -> Vec<EntryRequest> {
        let Some(delta) = ctx.feed.detect_spike(self.move_usd, self.window_sec) else {
            return Vec::new();
        };
        let side = if delta > Decimal::ZERO {
            Side::Up
        } else {
            Side::Down
        };

        ctx.windows
            .iter()
            .filter(|w| w.phase(ctx.now) == Phase::Active && !w.fired.get(StrategyKind::Spike))
            .map(|w| EntryRequest {
                strategy: StrategyKind::Spike,
                slug: w.slug.clone(),
                side,
                order_type: OrderType::Market,
                limit_price: None,
                price_cap: self.max_entry_price,
                policy: ExitPolicy::Managed,
                note: format!(
                    "momentum ${:+.0} in {:.1}s -> {}",
                    delta, self.window_sec, side
                ),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use crate::feed::PriceFeed;
    use crate::venue::VenueClient;
    use crate::windows::{FiredFlags, Window};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn test_config() -> Config {
        Config::from_env().unwrap()
    }

    fn active_window(slug: &str, now: chrono::DateTime<Utc>) -> Window {
        Window {
            slug: slug.to_string(),
            question: "q".to_string(),
            up_token_id: "111".to_string(),
            down_token_id: "222".to_string(),
            reference_price: None,
            end_time: now + chrono::Duration::seconds(200),
            open_price: Some(dec!(97000)),
            fired: FiredFlags::default(),
        }
    }

    #[tokio::test]
    async fn test_spike_fires_for_active_windows() {
        let cfg = test_config();
        let events = Arc::new(EventLog::new());
        let (feed, _rx) = PriceFeed::new(&cfg, events.clone());
        let venue = VenueClient::new(cfg.clone()).unwrap();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        // 22-dollar move inside the 3s window.
        {
            let state = feed.state();
            let mut s = state.write();
            let at = crate::time_util::epoch_secs(Utc::now());
            s.push_tick(dec!(97000), at - 2.0);
            s.push_tick(dec!(97022), at);
        }

        let mut windows = vec![active_window("w1", now), active_window("w2", now)];
        // One window already consumed its spike signal.
        windows[1].fired.set(StrategyKind::Spike);

        let ctx = ScanCtx {
            now,
            windows: &windows,
            newly_active: &[],
            feed: &feed,
            venue: &venue,
            events: &events,
        };

        let mut strategy = SpikeStrategy::new(&cfg);
        let requests = strategy.scan(&ctx).await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].slug, "w1");
        assert_eq!(requests[0].side, Side::Up);
        assert_eq!(requests[0].price_cap, dec!(0.60));
        assert_eq!(requests[0].policy, ExitPolicy::Managed);
    }

    #[tokio::test]
    async fn test_no_spike_no_requests() {
        let cfg = test_config();
        let events = Arc::new(EventLog::new());
        let (feed, _rx) = PriceFeed::new(&cfg, events.clone());
        let venue = VenueClient::new(cfg.clone()).unwrap();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        {
            let state = feed.state();
            let mut s = state.write();
            let at = crate::time_util::epoch_secs(Utc::now());
            s.push_tick(dec!(97000), at - 2.0);
            s.push_tick(dec!(97005), at);
        }

        let windows = vec![active_window("w1", now)];
        let ctx = ScanCtx {
            now,
            windows: &windows,
            newly_active: &[],
            feed: &feed,
            venue: &venue,
            events: &events,
        };

        let mut strategy = SpikeStrategy::new(&cfg);
        assert!(strategy.scan(&ctx).await.is_empty());
    }

    #[tokio::test]
    async fn test_downward_spike_buys_down() {
        let cfg = test_config();
        let events = Arc::new(EventLog::new());
        let (feed, _rx) = PriceFeed::new(&cfg, events.clone());
        let venue = VenueClient::new(cfg.clone()).unwrap();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        {
            let state = feed.state();
            let mut s = state.write();
            let at = crate::time_util::epoch_secs(Utc::now());
            s.push_tick(dec!(97000), at - 2.0);
            s.push_tick(dec!(96970), at);
        }

        let windows = vec![active_window("w1", now)];
        let ctx = ScanCtx {
            now,
            windows: &windows,
            newly_active: &[],
            feed: &feed,
            venue: &venue,
            events: &events,
        };

        let mut strategy = SpikeStrategy::new(&cfg);
        let requests = strategy.scan(&ctx).await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].side, Side::Down);
    }
}
