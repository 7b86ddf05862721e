use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::env;

use crate::types::Side;

#[derive(Debug, Clone)]
pub struct Config {
    // Polymarket CLOB credentials (unused in dry-run)
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
    pub address: String,

    // Spot feed
    pub symbol: String,
    pub asset_tag: String,
    pub duration_tag: String,

    // Spike detection: $X move within Y seconds = real momentum
    pub spike_move_usd: Decimal,
    pub spike_window_sec: f64,
    pub spike_debounce_sec: f64,

    // Exit policy
    pub profit_target_pct: Decimal,
    pub moonbag_pct: Decimal,
    pub drawdown_trigger_pct: Decimal,
    pub protection_exit_pct: Decimal,
    pub hard_stop_pct: Decimal,

    // Sizing / entry gates
    pub max_position_usdc: Decimal,
    pub max_concurrent_positions: usize,
    pub max_entry_price: Decimal,
    pub fee_rate: Decimal,
    pub min_time_to_resolution_sec: f64,

    // Risk gates
    pub daily_loss_limit_usdc: Decimal,
    pub max_loss_per_trade_usdc: Decimal,
    pub consecutive_losses_to_pause: u32,
    pub pause_minutes_after_streak: f64,

    // Window timing
    pub settle_seconds: f64,
    pub registry_refresh_sec: f64,
    pub poll_interval_sec: f64,
    pub exit_eval_interval_sec: f64,
    pub stale_after_sec: f64,

    // Strategy 2: passive limit on a fixed side
    pub passive_side: Side,
    pub passive_entry_price: Decimal,
    pub passive_sell_price: Decimal,

    // Strategy 3: late-window leader
    pub late_entry_price: Decimal,
    pub choppy_cutoff: Decimal,
    pub tracking_start_sec_before_end: f64,
    pub decision_sec_before_end: f64,

    // Mode
    pub dry_run: bool,
    pub log_level: String,

    // Endpoints
    pub binance_ws_endpoints: Vec<String>,
    pub binance_rest_url: String,
    pub clob_url: String,
    pub gamma_url: String,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var_or(key, default)
        .parse::<T>()
        .with_context(|| format!("Invalid {}", key))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let symbol: String = var_or("SYMBOL", "BTCUSDT");

        Ok(Config {
            api_key: var_or("POLY_API_KEY", ""),
            api_secret: var_or("POLY_API_SECRET", ""),
            api_passphrase: var_or("POLY_API_PASSPHRASE", ""),
            address: var_or("POLY_ADDRESS", ""),

            asset_tag: var_or("ASSET_TAG", "btc"),
            duration_tag: var_or("DURATION_TAG", "5m"),

            spike_move_usd: parse_var("SPIKE_MOVE_USD", "20.0")?,
            spike_window_sec: parse_var("SPIKE_WINDOW_SEC", "3.0")?,
            spike_debounce_sec: parse_var("SPIKE_DEBOUNCE_SEC", "10.0")?,

            profit_target_pct: parse_var("PROFIT_TARGET_PCT", "10.0")?,
            moonbag_pct: parse_var("MOONBAG_PCT", "20.0")?,
            drawdown_trigger_pct: parse_var("DRAWDOWN_TRIGGER_PCT", "-15.0")?,
            protection_exit_pct: parse_var("PROTECTION_EXIT_PCT", "-10.0")?,
            hard_stop_pct: parse_var("HARD_STOP_PCT", "-25.0")?,

            max_position_usdc: parse_var("MAX_POSITION_USDC", "50.0")?,
            max_concurrent_positions: parse_var("MAX_CONCURRENT_POSITIONS", "3")?,
            max_entry_price: parse_var("MAX_ENTRY_PRICE", "0.60")?,
            fee_rate: parse_var("FEE_RATE", "0.02")?,
            min_time_to_resolution_sec: parse_var("MIN_TIME_TO_RESOLUTION", "30.0")?,

            daily_loss_limit_usdc: parse_var("DAILY_LOSS_LIMIT_USDC", "-100.0")?,
            max_loss_per_trade_usdc: parse_var("MAX_LOSS_PER_TRADE_USDC", "12.0")?,
            consecutive_losses_to_pause: parse_var("CONSECUTIVE_LOSSES_TO_PAUSE", "2")?,
            pause_minutes_after_streak: parse_var("PAUSE_MINUTES_AFTER_STREAK", "25.0")?,

            settle_seconds: parse_var("SETTLE_SECONDS", "10.0")?,
            registry_refresh_sec: parse_var("REGISTRY_REFRESH_SEC", "30.0")?,
            poll_interval_sec: parse_var("POLL_INTERVAL_SEC", "0.5")?,
            exit_eval_interval_sec: parse_var("EXIT_EVAL_INTERVAL_SEC", "1.0")?,
            stale_after_sec: parse_var("STALE_AFTER_SEC", "5.0")?,

            passive_side: var_or("PASSIVE_SIDE", "Up")
                .parse()
                .map_err(anyhow::Error::msg)
                .context("Invalid PASSIVE_SIDE (expected Up or Down)")?,
            passive_entry_price: parse_var("PASSIVE_ENTRY_PRICE", "0.50")?,
            passive_sell_price: parse_var("PASSIVE_SELL_PRICE", "0.60")?,

            late_entry_price: parse_var("LATE_ENTRY_PRICE", "0.70")?,
            choppy_cutoff: parse_var("CHOPPY_CUTOFF", "0.65")?,
            tracking_start_sec_before_end: parse_var("TRACKING_START_SEC_BEFORE_END", "165.0")?,
            decision_sec_before_end: parse_var("DECISION_SEC_BEFORE_END", "90.0")?,

            dry_run: var_or("DRY_RUN", "true").parse().unwrap_or(true),
            log_level: var_or("LOG_LEVEL", "info"),

            binance_ws_endpoints: vec![
                format!("wss://stream.binance.com:9443/ws/{}@trade", symbol.to_lowercase()),
                format!("wss://stream.binance.com:443/ws/{}@trade", symbol.to_lowercase()),
                format!("wss://data-stream.binance.vision/ws/{}@trade", symbol.to_lowercase()),
            ],
            binance_rest_url: format!(
                "https://api.binance.com/api/v3/ticker/price?symbol={}",
                symbol
            ),
            clob_url: "https://clob.polymarket.com".to_string(),
            gamma_url: "https://gamma-api.polymarket.com".to_string(),

            symbol,
        })
    }

    /// Live trading needs the full credential set; dry-run needs none.
    pub fn validate_credentials(&self) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        for (name, value) in [
            ("POLY_API_KEY", &self.api_key),
            ("POLY_API_SECRET", &self.api_secret),
            ("POLY_API_PASSPHRASE", &self.api_passphrase),
            ("POLY_ADDRESS", &self.address),
        ] {
            if value.is_empty() {
                anyhow::bail!("{} not set (required for live trading)", name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults() {
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.spike_move_usd, dec!(20.0));
        assert_eq!(cfg.profit_target_pct, dec!(10.0));
        assert_eq!(cfg.hard_stop_pct, dec!(-25.0));
        assert_eq!(cfg.max_concurrent_positions, 3);
        assert!(cfg.dry_run);
        assert_eq!(cfg.binance_ws_endpoints.len(), 3);
        assert!(cfg.binance_ws_endpoints[0].contains("btcusdt@trade"));
    }

    #[test]
    fn test_dry_run_needs_no_credentials() {
        let cfg = Config::from_env().unwrap();
        assert!(cfg.validate_credentials().is_ok());
    }
}
