//! Running statistics over closed trades, plus the hourly P&L buckets
//! the operator watches. Everything here is a derived projection; the
//! closed-trade list is the record, the rest is recomputed from it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::time_util::{date_key, hour_key};
use crate::types::ClosedTrade;

/// How many closed trades the snapshot carries.
const RECENT_TRADES: usize = 20;

#[derive(Debug, Default)]
pub struct Stats {
    pub signals: u64,
    closed: Vec<ClosedTrade>,
    hourly_pnl: BTreeMap<String, Decimal>,
    current_day: String,
    last_hour: String,
}

/// Serializable digest of the stats for the snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatsSummary {
    pub signals: u64,
    pub trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub win_rate_pct: Decimal,
    pub total_pnl: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub best: Decimal,
    pub worst: Decimal,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_signal(&mut self) {
        self.signals += 1;
    }

    pub fn record_trade(&mut self, trade: ClosedTrade) {
        let key = hour_key(trade.closed_at);
        self.roll_clock(trade.closed_at);
        *self.hourly_pnl.entry(key).or_insert(Decimal::ZERO) += trade.pnl;
        self.closed.push(trade);
    }

    /// Advance the Eastern-time clock: reset the hourly map on a new
    /// day, log a one-line report when an hour completes. Call this
    /// every engine cycle as well as on every recorded trade.
    pub fn roll_clock(&mut self, now: DateTime<Utc>) {
        let day = date_key(now);
        if self.current_day != day {
            if !self.current_day.is_empty() {
                info!("=== NEW DAY ({}) - resetting hourly P&L ===", day);
            }
            self.hourly_pnl.clear();
            self.current_day = day;
        }

        let hour = hour_key(now);
        if hour != self.last_hour && !self.last_hour.is_empty() {
            let prev = self
                .hourly_pnl
                .get(&self.last_hour)
                .copied()
                .unwrap_or(Decimal::ZERO);
            let summary = self.summary();
            info!(
                "=== HOURLY [{}] ===  PnL: ${:+}  |  Day total: ${:+}  |  W:{} L:{}",
                self.last_hour, prev, summary.total_pnl, summary.wins, summary.losses
            );
        }
        self.hourly_pnl.entry(hour.clone()).or_insert(Decimal::ZERO);
        self.last_hour = hour;
    }

    pub fn summary(&self) -> StatsSummary {
        let trades = self.closed.len() as u64;
        let wins = self.closed.iter().filter(|t| t.pnl >= Decimal::ZERO).count() as u64;
        let losses = trades - wins;
        let total_pnl: Decimal = self.closed.iter().map(|t| t.pnl).sum();

        let win_pnls: Vec<Decimal> = self
            .closed
            .iter()
            .filter(|t| t.pnl >= Decimal::ZERO)
            .map(|t| t.pnl)
            .collect();
        let loss_pnls: Vec<Decimal> = self
            .closed
            .iter()
            .filter(|t| t.pnl < Decimal::ZERO)
            .map(|t| t.pnl)
            .collect();

        let avg = |v: &[Decimal]| {
            if v.is_empty() {
                Decimal::ZERO
            } else {
                v.iter().sum::<Decimal>() / Decimal::from(v.len() as u64)
            }
        };

        StatsSummary {
            signals: self.signals,
            trades,
            wins,
            losses,
            win_rate_pct: if trades == 0 {
                Decimal::ZERO
            } else {
                Decimal::from(wins) / Decimal::from(trades) * Decimal::ONE_HUNDRED
            },
            total_pnl,
            avg_win: avg(&win_pnls),
            avg_loss: avg(&loss_pnls),
            best: self.closed.iter().map(|t| t.pnl).max().unwrap_or(Decimal::ZERO),
            worst: self.closed.iter().map(|t| t.pnl).min().unwrap_or(Decimal::ZERO),
        }
    }

    pub fn hourly_pnl(&self) -> BTreeMap<String, Decimal> {
        self.hourly_pnl.clone()
    }

    /// P&L recorded so far this Eastern day.
    pub fn day_pnl(&self) -> Decimal {
        self.hourly_pnl.values().copied().sum()
    }

    pub fn recent_trades(&self) -> Vec<ClosedTrade> {
        let skip = self.closed.len().saturating_sub(RECENT_TRADES);
        self.closed[skip..].to_vec()
    }

    pub fn trade_count(&self) -> usize {
        self.closed.len()
    }
}
