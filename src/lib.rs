/// Binance → Polymarket 5-Minute Latency Arbitrage Bot
///
/// This library provides the live engine for a latency-arbitrage bot on
/// Polymarket's rolling 5-minute BTC up/down markets. Binance prints the
/// spot price in milliseconds; Polymarket's books are quoted by humans and
/// reprice with a lag. When the spot price moves sharply inside an open
/// window the outcome is essentially known, so the bot buys the winning
/// side before the book catches up and exits for a small repeatable edge.

pub mod config;
pub mod events;
pub mod feed;
pub mod publisher;
pub mod registry;
pub mod risk;
pub mod stats;
pub mod strategy;
pub mod time_util;
pub mod types;
pub mod venue;
pub mod windows;
