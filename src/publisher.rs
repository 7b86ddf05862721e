//! Read-only state snapshots for observers (dashboard, status line).
//!
//! Mutators push their view in and mark the publisher dirty; a
//! dedicated task serializes a snapshot into a watch channel at no more
//! than 10 Hz. Consumers can never block a mutator, and the publisher
//! holds no authoritative state of its own.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::info;

use crate::events::{Event, EventLog};
use crate::feed::PriceFeed;
use crate::registry::MarketRegistry;
use crate::stats::{Stats, StatsSummary};
use crate::types::{ClosedTrade, PositionMode, PositionStatus, Side, StrategyKind};
use crate::windows::{FiredFlags, Phase};

/// Rolling spot price history: one point per second, two minutes deep.
const PRICE_HISTORY_CAP: usize = 120;
/// Snapshot cadence ceiling.
const MIN_PUBLISH_INTERVAL: Duration = Duration::from_millis(100);
/// Events carried in each snapshot.
const SNAPSHOT_EVENTS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowView {
    pub slug: String,
    pub question: String,
    pub phase: Phase,
    pub open_price: Option<Decimal>,
    pub reference_price: Option<Decimal>,
    pub end_time: DateTime<Utc>,
    pub seconds_remaining: f64,
    /// Spot move from the open price, percent.
    pub move_pct: Option<Decimal>,
    pub fired: FiredFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionView {
    pub strategy: StrategyKind,
    pub window_slug: String,
    pub question: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub shares: Decimal,
    pub cost: Decimal,
    pub mode: PositionMode,
    pub status: PositionStatus,
    pub peak_gain_pct: Decimal,
    pub opened_at: DateTime<Utc>,
    pub sell_stuck: bool,
    pub venue_gone: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    pub at: DateTime<Utc>,
    pub price: Decimal,
}

/// The full observer-facing snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotSnapshot {
    pub ts: DateTime<Utc>,
    pub spot_price: Option<Decimal>,
    pub feed_live: bool,
    pub dry_run: bool,
    pub windows: Vec<WindowView>,
    pub positions: Vec<PositionView>,
    pub recent_trades: Vec<ClosedTrade>,
    pub stats: StatsSummary,
    pub hourly_pnl: BTreeMap<String, Decimal>,
    pub events: Vec<Event>,
    pub price_history: Vec<PricePoint>,
}

impl BotSnapshot {
    pub fn empty(dry_run: bool) -> Self {
        Self {
            ts: Utc::now(),
            spot_price: None,
            feed_live: false,
            dry_run,
            windows: Vec::new(),
            positions: Vec::new(),
            recent_trades: Vec::new(),
            stats: StatsSummary::default(),
            hourly_pnl: BTreeMap::new(),
            events: Vec::new(),
            price_history: Vec::new(),
        }
    }
}

pub struct StatePublisher {
    tx: watch::Sender<BotSnapshot>,
    dirty: AtomicBool,
    dry_run: bool,
    positions: Mutex<Vec<PositionView>>,
    price_history: Mutex<VecDeque<PricePoint>>,
}

impl StatePublisher {
    pub fn new(dry_run: bool) -> Arc<Self> {
        let (tx, _rx) = watch::channel(BotSnapshot::empty(dry_run));
        Arc::new(Self {
            tx,
            dirty: AtomicBool::new(true),
            dry_run,
            positions: Mutex::new(Vec::new()),
            price_history: Mutex::new(VecDeque::with_capacity(PRICE_HISTORY_CAP)),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<BotSnapshot> {
        self.tx.subscribe()
    }

    /// Mutators call this after any state change; the publish task
    /// collapses bursts into at most one snapshot per interval.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// The strategy task pushes its position view here on every change.
    pub fn update_positions(&self, views: Vec<PositionView>) {
        *self.positions.lock() = views;
        self.mark_dirty();
    }

    fn record_price(&self, price: Decimal, at: DateTime<Utc>) {
        let mut history = self.price_history.lock();
        if let Some(last) = history.back() {
            if (at - last.at).num_milliseconds() < 1000 {
                return;
            }
        }
        if history.len() >= PRICE_HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(PricePoint { at, price });
    }

    fn build_snapshot(
        &self,
        feed: &PriceFeed,
        registry: &MarketRegistry,
        stats: &Mutex<Stats>,
        events: &EventLog,
    ) -> BotSnapshot {
        let now = Utc::now();
        let spot = feed.current_price();

        let windows = registry
            .snapshot()
            .into_iter()
            .map(|w| {
                let move_pct = match (w.open_price, spot) {
                    (Some(open), Some(px)) if !open.is_zero() => {
                        Some(((px - open) / open * Decimal::ONE_HUNDRED).round_dp(4))
                    }
                    _ => None,
                };
                WindowView {
                    phase: w.phase(now),
                    seconds_remaining: w.seconds_remaining(now).max(0.0),
                    move_pct,
                    slug: w.slug,
                    question: w.question,
                    open_price: w.open_price,
                    reference_price: w.reference_price,
                    end_time: w.end_time,
                    fired: w.fired,
                }
            })
            .collect();

        let (summary, hourly, recent) = {
            let stats = stats.lock();
            (stats.summary(), stats.hourly_pnl(), stats.recent_trades())
        };

        BotSnapshot {
            ts: now,
            spot_price: spot,
            feed_live: feed.is_live(),
            dry_run: self.dry_run,
            windows,
            positions: self.positions.lock().clone(),
            recent_trades: recent,
            stats: summary,
            hourly_pnl: hourly,
            events: events.recent(SNAPSHOT_EVENTS),
            price_history: self.price_history.lock().iter().cloned().collect(),
        }
    }

    /// Debounced snapshot task. A heartbeat refresh goes out once a
    /// second even with no mutations so time-derived fields stay fresh.
    pub async fn run(
        self: Arc<Self>,
        feed: Arc<PriceFeed>,
        registry: Arc<MarketRegistry>,
        stats: Arc<Mutex<Stats>>,
        events: Arc<EventLog>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(MIN_PUBLISH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_heartbeat = Instant::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            if let Some(price) = feed.current_price() {
                self.record_price(price, Utc::now());
            }

            let heartbeat_due = last_heartbeat.elapsed() >= Duration::from_secs(1);
            if self.dirty.swap(false, Ordering::AcqRel) || heartbeat_due {
                let snapshot = self.build_snapshot(&feed, &registry, &stats, &events);
                let _ = self.tx.send_replace(snapshot);
                last_heartbeat = Instant::now();
            }
        }

        // Final flush so observers see the shutdown state.
        let snapshot = self.build_snapshot(&feed, &registry, &stats, &events);
        let _ = self.tx.send_replace(snapshot);
        info!("Publisher task stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExitReason;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_snapshot_serde_round_trip() {
        let at = Utc.with_ymd_and_hms(2026, 1, 15, 19, 30, 0).unwrap();
        let mut snapshot = BotSnapshot::empty(true);
        snapshot.spot_price = Some(dec!(97001.25));
        snapshot.feed_live = true;
        snapshot.stats = StatsSummary {
            signals: 5,
            trades: 3,
            wins: 2,
            losses: 1,
            win_rate_pct: dec!(66.67),
            total_pnl: dec!(12.40),
            avg_win: dec!(8.2),
            avg_loss: dec!(-4.0),
            best: dec!(10),
            worst: dec!(-4),
        };
        snapshot.hourly_pnl.insert("14:00".to_string(), dec!(12.40));
        snapshot.recent_trades.push(ClosedTrade {
            strategy: StrategyKind::Spike,
            window_slug: "w1".to_string(),
            side: Side::Up,
            entry: dec!(0.51),
            exit: dec!(0.562),
            shares: dec!(196),
            cost: dec!(99.96),
            pnl: dec!(9.99),
            pnl_pct: dec!(10.2),
            status: ExitReason::TakeProfit,
            opened_at: at,
            closed_at: at,
        });

        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: BotSnapshot = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.spot_price, snapshot.spot_price);
        assert_eq!(parsed.stats, snapshot.stats);
        assert_eq!(parsed.hourly_pnl, snapshot.hourly_pnl);
        assert_eq!(parsed.recent_trades.len(), 1);
        assert_eq!(parsed.recent_trades[0].pnl, dec!(9.99));
        assert_eq!(parsed.recent_trades[0].status, ExitReason::TakeProfit);
    }

    #[test]
    fn test_price_history_bounded_and_throttled() {
        let publisher = StatePublisher::new(true);
        let base = Utc.with_ymd_and_hms(2026, 1, 15, 19, 0, 0).unwrap();

        // Two points inside the same second collapse into one.
        publisher.record_price(dec!(97000), base);
        publisher.record_price(dec!(97001), base + chrono::Duration::milliseconds(400));
        assert_eq!(publisher.price_history.lock().len(), 1);

        for i in 1..200 {
            publisher.record_price(dec!(97000), base + chrono::Duration::seconds(i));
        }
        assert_eq!(publisher.price_history.lock().len(), PRICE_HISTORY_CAP);
    }

    #[test]
    fn test_update_positions_marks_dirty() {
        let publisher = StatePublisher::new(true);
        publisher.dirty.store(false, Ordering::Release);
        publisher.update_positions(Vec::new());
        assert!(publisher.dirty.load(Ordering::Acquire));
    }
}
