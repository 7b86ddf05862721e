use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::windows::WindowRef;

/// Outcome side of a binary window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Up,
    Down,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Up => "Up",
            Side::Down => "Down",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Up => Side::Down,
            Side::Down => Side::Up,
        }
    }

    /// Map a venue outcome label onto our side. The venue emits both
    /// "Up"/"Down" and "Yes"/"No" depending on the market series.
    pub fn from_outcome_label(label: &str) -> Option<Side> {
        match label.trim().to_lowercase().as_str() {
            "up" | "yes" => Some(Side::Up),
            "down" | "no" => Some(Side::Down),
            _ => None,
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Side::from_outcome_label(s).ok_or_else(|| format!("unknown side: {}", s))
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which strategy module owns a signal or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Spike,
    Passive,
    Late,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Spike => write!(f, "spike"),
            StrategyKind::Passive => write!(f, "passive"),
            StrategyKind::Late => write!(f, "late"),
        }
    }
}

/// Position mode drives the exit state machine. A position is exactly
/// one of these at a time; moonbag and protection are mutually
/// exclusive and each transition is one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionMode {
    Normal,
    Moonbag,
    Protection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

/// Which exit machine drives a position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitPolicy {
    /// Full take-profit / moonbag / protection / hard-stop machine.
    Managed,
    /// Sell the moment the bid reaches the target; otherwise resolution.
    LimitTarget(Decimal),
    /// Ride to resolution (late-entry strategy).
    HoldToResolution,
}

/// Terminal reason a trade closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    MoonbagTrail,
    Protection,
    HardStop,
    ResolvedWin,
    ResolvedLoss,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::MoonbagTrail => "moonbag_trail",
            ExitReason::Protection => "protection",
            ExitReason::HardStop => "hard_stop",
            ExitReason::ResolvedWin => "resolved_win",
            ExitReason::ResolvedLoss => "resolved_loss",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open trade against one window.
#[derive(Debug, Clone)]
pub struct Position {
    pub strategy: StrategyKind,
    pub window: WindowRef,
    pub side: Side,
    pub token_id: String,
    pub entry_price: Decimal,
    pub shares: Decimal,
    pub cost: Decimal,
    pub opened_at: DateTime<Utc>,
    /// Highest gain% seen so far; monotone non-decreasing.
    pub peak_gain_pct: Decimal,
    pub mode: PositionMode,
    pub status: PositionStatus,
    pub policy: ExitPolicy,
    /// Sell retries exhausted; falling through to resolution.
    pub sell_stuck: bool,
    /// Venue unresponsive past the outage budget; left for the operator.
    pub venue_gone: bool,
    /// Book favors our side while spot sits on the wrong side of the
    /// strike. Once set, hard-sell the moment our bid collapses.
    pub manipulation_flagged: bool,
}

impl Position {
    pub fn gain_pct(&self, bid: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (bid - self.entry_price) / self.entry_price * Decimal::ONE_HUNDRED
    }

    pub fn unrealized_loss_usd(&self, bid: Decimal) -> Decimal {
        ((self.entry_price - bid) * self.shares).max(Decimal::ZERO)
    }
}

/// Immutable record of a closed trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub strategy: StrategyKind,
    pub window_slug: String,
    pub side: Side,
    pub entry: Decimal,
    pub exit: Decimal,
    pub shares: Decimal,
    pub cost: Decimal,
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
    pub status: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Venue wire types
// ---------------------------------------------------------------------------

/// Market record from the Gamma API. Loose JSON: unknown fields ignored,
/// list-valued fields arrive as JSON-encoded strings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMarket {
    pub slug: Option<String>,
    pub question: Option<String>,
    pub condition_id: Option<String>,
    /// JSON string like `"[\"123...\", \"456...\"]"`.
    pub clob_token_ids: Option<String>,
    /// JSON string like `"[\"Up\", \"Down\"]"`.
    pub outcomes: Option<String>,
    /// JSON string like `"[\"0.52\", \"0.48\"]"`.
    pub outcome_prices: Option<String>,
    pub end_date: Option<String>,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub active: bool,
}

fn parse_string_array(raw: &str) -> Option<Vec<String>> {
    serde_json::from_str::<Vec<String>>(raw).ok()
}

impl RawMarket {
    pub fn token_ids(&self) -> Option<Vec<String>> {
        self.clob_token_ids.as_deref().and_then(parse_string_array)
    }

    pub fn outcome_labels(&self) -> Option<Vec<String>> {
        self.outcomes.as_deref().and_then(parse_string_array)
    }

    pub fn prices(&self) -> Option<Vec<Decimal>> {
        let raw = self.outcome_prices.as_deref()?;
        let strings = parse_string_array(raw)?;
        strings.iter().map(|s| s.parse::<Decimal>().ok()).collect()
    }
}

/// Order book snapshot from the CLOB.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Book {
    #[serde(default)]
    pub bids: Vec<PriceLevel>,
    #[serde(default)]
    pub asks: Vec<PriceLevel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceLevel {
    pub price: String,
    pub size: String,
}

impl PriceLevel {
    pub fn price_decimal(&self) -> Option<Decimal> {
        self.price.parse().ok()
    }

    pub fn size_decimal(&self) -> Option<Decimal> {
        self.size.parse().ok()
    }
}

impl Book {
    /// Highest bid. The venue does not guarantee ordering, so scan.
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.iter().filter_map(|l| l.price_decimal()).max()
    }

    /// Lowest ask.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.iter().filter_map(|l| l.price_decimal()).min()
    }

    pub fn mid(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / Decimal::TWO),
            (Some(b), None) => Some(b),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        }
    }
}

/// Order side on the CLOB wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// A single order request handed to the venue client.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub token_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub order_type: OrderType,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::windows::{FiredFlags, Window};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_label_mapping() {
        assert_eq!(Side::from_outcome_label("Up"), Some(Side::Up));
        assert_eq!(Side::from_outcome_label("YES"), Some(Side::Up));
        assert_eq!(Side::from_outcome_label("down"), Some(Side::Down));
        assert_eq!(Side::from_outcome_label("No"), Some(Side::Down));
        assert_eq!(Side::from_outcome_label("maybe"), None);
        assert_eq!(Side::Up.opposite(), Side::Down);
    }

    #[test]
    fn test_raw_market_string_arrays() {
        let raw = RawMarket {
            clob_token_ids: Some(r#"["111", "222"]"#.to_string()),
            outcomes: Some(r#"["Up", "Down"]"#.to_string()),
            outcome_prices: Some(r#"["0.52", "0.48"]"#.to_string()),
            ..Default::default()
        };
        assert_eq!(raw.token_ids().unwrap(), vec!["111", "222"]);
        assert_eq!(raw.outcome_labels().unwrap(), vec!["Up", "Down"]);
        assert_eq!(raw.prices().unwrap(), vec![dec!(0.52), dec!(0.48)]);
    }

    #[test]
    fn test_malformed_token_ids_yield_none() {
        let raw = RawMarket {
            clob_token_ids: Some("not json".to_string()),
            ..Default::default()
        };
        assert!(raw.token_ids().is_none());
    }

    #[test]
    fn test_book_best_prices_ignore_ordering() {
        let book = Book {
            bids: vec![
                PriceLevel { price: "0.40".into(), size: "100".into() },
                PriceLevel { price: "0.55".into(), size: "50".into() },
                PriceLevel { price: "0.50".into(), size: "10".into() },
            ],
            asks: vec![
                PriceLevel { price: "0.62".into(), size: "20".into() },
                PriceLevel { price: "0.57".into(), size: "80".into() },
            ],
        };
        assert_eq!(book.best_bid(), Some(dec!(0.55)));
        assert_eq!(book.best_ask(), Some(dec!(0.57)));
        assert_eq!(book.mid(), Some(dec!(0.56)));
    }

    #[test]
    fn test_gain_pct_and_loss_usd() {
        let w = Window {
            slug: "w1".to_string(),
            question: "q".to_string(),
            up_token_id: "111".to_string(),
            down_token_id: "222".to_string(),
            reference_price: None,
            end_time: Utc.timestamp_opt(1_700_000_300, 0).unwrap(),
            open_price: None,
            fired: FiredFlags::default(),
        };
        let pos = Position {
            strategy: StrategyKind::Spike,
            window: w.snapshot_ref(),
            side: Side::Up,
            token_id: "111".to_string(),
            entry_price: dec!(0.51),
            shares: dec!(196),
            cost: dec!(99.96),
            opened_at: Utc.timestamp_opt(1_700_000_100, 0).unwrap(),
            peak_gain_pct: Decimal::ZERO,
            mode: PositionMode::Normal,
            status: PositionStatus::Open,
            policy: ExitPolicy::Managed,
            sell_stuck: false,
            venue_gone: false,
            manipulation_flagged: false,
        };
        let gain = pos.gain_pct(dec!(0.56));
        assert!(gain > dec!(9.7) && gain < dec!(9.9));
        assert_eq!(pos.unrealized_loss_usd(dec!(0.56)), Decimal::ZERO);
        assert_eq!(pos.unrealized_loss_usd(dec!(0.41)), dec!(19.60));
    }
}
