//! Strategy modules over the shared entry/exit pipeline.
//!
//! Each strategy scans the tracked windows and proposes entries; the
//! engine owns the positions and drives every exit. Strategies never
//! mutate shared state themselves, so at-most-one-position-per-window
//! is enforced in exactly one place.

pub mod engine;
pub mod exit;
pub mod late;
pub mod passive;
pub mod spike;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::events::EventLog;
use crate::feed::PriceFeed;
use crate::types::{ExitPolicy, OrderType, Side, StrategyKind};
use crate::venue::VenueClient;
use crate::windows::Window;

/// A proposed entry. The engine re-checks everything (signal flags,
/// phase, budget, book) before any order leaves the process.
#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub strategy: StrategyKind,
    pub slug: String,
    pub side: Side,
    pub order_type: OrderType,
    /// Resting price for limit orders; market orders take the ask.
    pub limit_price: Option<Decimal>,
    /// Entry is rejected as book_repriced above this ask.
    pub price_cap: Decimal,
    pub policy: ExitPolicy,
    /// Human-readable trigger description for the event log.
    pub note: String,
}

/// Read-only view handed to strategies each scan cycle.
pub struct ScanCtx<'a> {
    pub now: DateTime<Utc>,
    /// Registry snapshot ordered by end time.
    pub windows: &'a [Window],
    /// Slugs whose open price latched this cycle (settling -> active).
    pub newly_active: &'a [String],
    pub feed: &'a PriceFeed,
    pub venue: &'a VenueClient,
    pub events: &'a EventLog,
}

#[async_trait]
pub trait EntryStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Inspect the current windows and propose entries. Called every
    /// poll cycle from the single strategy task.
    async fn scan(&mut self, ctx: &ScanCtx<'_>) -> Vec<EntryRequest>;
}
