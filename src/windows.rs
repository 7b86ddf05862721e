//! Window model: one rolling 5-minute binary market, its lifecycle
//! phase, and the open-price latch semantics.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{Side, StrategyKind};

/// Fixed window length. Every market spans `[end_time - 300s, end_time]`.
pub const WINDOW_SECONDS: f64 = 300.0;
/// No new entries once the window is inside the closing period.
pub const CLOSING_SECONDS: f64 = 30.0;
/// Windows are kept this long past their end so resolution can be polled.
pub const RESOLUTION_GRACE_SECONDS: f64 = 900.0;
/// Discovery only keeps windows ending within this horizon.
pub const LOOKAHEAD_SECONDS: f64 = 1800.0;

/// Lifecycle phase, derived purely from `(now, end_time, open_price)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Waiting,
    Settling,
    Active,
    Closing,
    Ended,
}

/// Per-strategy signal flags for a window. At most one entry signal per
/// window per strategy, ever.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FiredFlags {
    pub spike: bool,
    pub passive: bool,
    pub late: bool,
}

impl FiredFlags {
    pub fn get(&self, kind: StrategyKind) -> bool {
        match kind {
            StrategyKind::Spike => self.spike,
            StrategyKind::Passive => self.passive,
            StrategyKind::Late => self.late,
        }
    }

    pub fn set(&mut self, kind: StrategyKind) {
        match kind {
            StrategyKind::Spike => self.spike = true,
            StrategyKind::Passive => self.passive = true,
            StrategyKind::Late => self.late = true,
        }
    }
}

/// One rolling 5-minute binary market.
#[derive(Debug, Clone)]
pub struct Window {
    pub slug: String,
    pub question: String,
    pub up_token_id: String,
    pub down_token_id: String,
    /// The strike parsed from the question text, when present.
    pub reference_price: Option<Decimal>,
    pub end_time: DateTime<Utc>,
    /// First spot tick observed >= `settle_seconds` after the window
    /// start. Latched once, never reset by re-discovery.
    pub open_price: Option<Decimal>,
    pub fired: FiredFlags,
}

impl Window {
    pub fn start_time(&self) -> DateTime<Utc> {
        self.end_time - chrono::Duration::milliseconds((WINDOW_SECONDS * 1000.0) as i64)
    }

    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> f64 {
        (self.end_time - now).num_milliseconds() as f64 / 1000.0
    }

    pub fn seconds_since_start(&self, now: DateTime<Utc>) -> f64 {
        (now - self.start_time()).num_milliseconds() as f64 / 1000.0
    }

    pub fn phase(&self, now: DateTime<Utc>) -> Phase {
        if now < self.start_time() {
            Phase::Waiting
        } else if now >= self.end_time {
            Phase::Ended
        } else if self.seconds_remaining(now) <= CLOSING_SECONDS {
            Phase::Closing
        } else if self.open_price.is_some() {
            Phase::Active
        } else {
            Phase::Settling
        }
    }

    pub fn token_for(&self, side: Side) -> &str {
        match side {
            Side::Up => &self.up_token_id,
            Side::Down => &self.down_token_id,
        }
    }

    pub fn snapshot_ref(&self) -> WindowRef {
        WindowRef {
            slug: self.slug.clone(),
            question: self.question.clone(),
            up_token_id: self.up_token_id.clone(),
            down_token_id: self.down_token_id.clone(),
            reference_price: self.reference_price,
            end_time: self.end_time,
        }
    }
}

/// A position's private copy of the window identifiers. Positions
/// reference windows by slug and outlive registry eviction, so they
/// never point back into the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowRef {
    pub slug: String,
    pub question: String,
    pub up_token_id: String,
    pub down_token_id: String,
    pub reference_price: Option<Decimal>,
    pub end_time: DateTime<Utc>,
}

impl WindowRef {
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> f64 {
        (self.end_time - now).num_milliseconds() as f64 / 1000.0
    }

    pub fn ended(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time
    }

    pub fn token_for(&self, side: Side) -> &str {
        match side {
            Side::Up => &self.up_token_id,
            Side::Down => &self.down_token_id,
        }
    }
}
