//! Thin, stateless Polymarket adapter shared by discovery and the
//! position manager. Gamma serves market metadata; the CLOB serves
//! books, orders, and (indirectly) resolution. In dry-run mode order
//! placement is stubbed and books are left untouched.

use base64::{engine::general_purpose::URL_SAFE as BASE64, Engine};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::types::{Book, OrderRequest, OrderType, RawMarket, Side};

/// Outcome prices at or past these marks mean the market has resolved.
pub const RESOLUTION_HIGH: Decimal = dec!(0.95);
pub const RESOLUTION_LOW: Decimal = dec!(0.05);
/// Resolution polling cadence.
const RESOLUTION_POLL: Duration = Duration::from_secs(12);

/// Venue failures, by kind. Callers branch on this: rejects drop the
/// signal, transport problems retry, auth is fatal at startup.
#[derive(Debug, Error)]
pub enum VenueError {
    #[error("venue rejected request: {0}")]
    Rejected(String),
    #[error("venue authentication failed: {0}")]
    Auth(String),
    #[error("venue request timed out: {0}")]
    Timeout(String),
    #[error("venue unavailable: {0}")]
    Unavailable(String),
    #[error("venue transport error: {0}")]
    Transport(reqwest::Error),
    #[error("malformed venue payload: {0}")]
    Payload(String),
}

impl VenueError {
    fn from_reqwest(context: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            VenueError::Timeout(format!("{}: {}", context, e))
        } else {
            VenueError::Transport(e)
        }
    }
}

type HmacSha256 = Hmac<Sha256>;

/// CLOB request signature: HMAC-SHA256 keyed with the base64 api
/// secret over `timestamp + METHOD + path + body`, url-safe base64
/// encoded. Callers pass the method already uppercased.
fn request_signature(
    secret: &str,
    timestamp: &str,
    method: &str,
    path: &str,
    body: &str,
) -> Result<String, VenueError> {
    let key = BASE64
        .decode(secret)
        .map_err(|e| VenueError::Auth(format!("api secret is not base64: {}", e)))?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| VenueError::Auth(format!("unusable api secret: {}", e)))?;
    mac.update(timestamp.as_bytes());
    mac.update(method.as_bytes());
    mac.update(path.as_bytes());
    mac.update(body.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

pub struct VenueClient {
    client: reqwest::Client,
    config: Config,
}

impl VenueClient {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        // Low-latency HTTP client: no Nagle, warm pool, tight timeouts.
        let client = reqwest::Client::builder()
            .tcp_nodelay(true)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(8))
            .connect_timeout(Duration::from_secs(3))
            .build()?;

        Ok(Self { client, config })
    }

    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// POLY_* header set for an authenticated CLOB call. Header names
    /// follow the venue's convention; transport normalizes the case.
    fn signed_headers(&self, method: &str, path: &str, body: &str) -> Result<HeaderMap, VenueError> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature =
            request_signature(&self.config.api_secret, &timestamp, method, path, body)?;

        let mut headers = HeaderMap::new();
        for (name, value) in [
            ("POLY_ADDRESS", self.config.address.as_str()),
            ("POLY_API_KEY", self.config.api_key.as_str()),
            ("POLY_PASSPHRASE", self.config.api_passphrase.as_str()),
            ("POLY_TIMESTAMP", timestamp.as_str()),
            ("POLY_SIGNATURE", signature.as_str()),
        ] {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| VenueError::Auth(format!("bad header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| VenueError::Auth(format!("bad credential value: {}", e)))?;
            headers.insert(name, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn check_status(
        context: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, VenueError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = format!("{} -> {}: {}", context, status, body);
        match status.as_u16() {
            401 | 403 => Err(VenueError::Auth(detail)),
            s if s >= 500 => Err(VenueError::Unavailable(detail)),
            _ => Err(VenueError::Rejected(detail)),
        }
    }

    // ------------------------------------------------------------------
    // Discovery (Gamma)
    // ------------------------------------------------------------------

    /// List currently-open markets whose slug matches the configured
    /// asset + duration series, e.g. `btc-updown-5m-*`.
    pub async fn list_windows(&self) -> Result<Vec<RawMarket>, VenueError> {
        let pattern = format!("{}-updown-{}", self.config.asset_tag, self.config.duration_tag);
        let url = format!(
            "{}/markets?slug_contains={}&closed=false&limit=50&order=endDate&ascending=true",
            self.config.gamma_url, pattern
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| VenueError::from_reqwest("list_windows", e))?;
        let response = Self::check_status("list_windows", response).await?;

        let markets: Vec<RawMarket> = response
            .json()
            .await
            .map_err(|e| VenueError::Payload(format!("list_windows: {}", e)))?;

        debug!("Discovery returned {} candidate markets", markets.len());
        Ok(markets)
    }

    /// Single-market lookup by slug, used for resolution polling.
    pub async fn get_market(&self, slug: &str) -> Result<Option<RawMarket>, VenueError> {
        let url = format!("{}/markets?slug={}", self.config.gamma_url, slug);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| VenueError::from_reqwest("get_market", e))?;
        let response = Self::check_status("get_market", response).await?;

        let mut markets: Vec<RawMarket> = response
            .json()
            .await
            .map_err(|e| VenueError::Payload(format!("get_market: {}", e)))?;

        Ok(if markets.is_empty() {
            None
        } else {
            Some(markets.remove(0))
        })
    }

    // ------------------------------------------------------------------
    // Books (CLOB)
    // ------------------------------------------------------------------

    pub async fn get_book(&self, token_id: &str) -> Result<Book, VenueError> {
        let url = format!("{}/book?token_id={}", self.config.clob_url, token_id);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| VenueError::from_reqwest("get_book", e))?;
        let response = Self::check_status("get_book", response).await?;

        let book: Book = response
            .json()
            .await
            .map_err(|e| VenueError::Payload(format!("get_book: {}", e)))?;

        trace!(
            "Book for {}: best_bid={:?} best_ask={:?}",
            &token_id[..token_id.len().min(8)],
            book.best_bid(),
            book.best_ask()
        );
        Ok(book)
    }

    pub async fn best_ask(&self, token_id: &str) -> Result<Option<Decimal>, VenueError> {
        Ok(self.get_book(token_id).await?.best_ask())
    }

    pub async fn best_bid(&self, token_id: &str) -> Result<Option<Decimal>, VenueError> {
        Ok(self.get_book(token_id).await?.best_bid())
    }

    // ------------------------------------------------------------------
    // Orders (CLOB)
    // ------------------------------------------------------------------

    /// Place an order and return its id. Dry-run returns a synthetic id
    /// without touching the venue.
    pub async fn place_order(&self, order: &OrderRequest) -> Result<String, VenueError> {
        if self.config.dry_run {
            let id = format!("DRY-{}", chrono::Utc::now().timestamp_millis());
            info!(
                "[DRY] {:?} {} {} @ ${}",
                order.side,
                order.size,
                &order.token_id[..order.token_id.len().min(8)],
                order.price
            );
            return Ok(id);
        }

        let path = "/order";
        let body = json!({
            "tokenID": order.token_id,
            "price": order.price.to_string(),
            "size": order.size.to_string(),
            "side": order.side,
            "orderType": match order.order_type {
                OrderType::Market => "FOK",
                OrderType::Limit => "GTC",
            },
        })
        .to_string();

        let headers = self.signed_headers("POST", path, &body)?;

        let url = format!("{}{}", self.config.clob_url, path);
        let response = self
            .client
            .post(&url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| VenueError::from_reqwest("place_order", e))?;
        let response = Self::check_status("place_order", response).await?;

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| VenueError::Payload(format!("place_order: {}", e)))?;

        let order_id = result
            .get("orderID")
            .or_else(|| result.get("id"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| VenueError::Payload(format!("no order id in {}", result)))?
            .to_string();

        info!("Order placed: {}", order_id);
        Ok(order_id)
    }

    /// Verify credentials with a lightweight authenticated call. A
    /// 401/403 here means the operator's keys are bad; the process
    /// exits with code 2.
    pub async fn verify_auth(&self) -> Result<(), VenueError> {
        if self.config.dry_run {
            return Ok(());
        }
        let path = "/auth/api-keys";
        let headers = self.signed_headers("GET", path, "")?;

        let url = format!("{}{}", self.config.clob_url, path);
        let response = self
            .client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| VenueError::from_reqwest("verify_auth", e))?;
        Self::check_status("verify_auth", response).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    /// Poll the market until its outcome prices pin near 0 or 1, or the
    /// timeout elapses. `up_token_id` anchors which price belongs to
    /// the Up outcome. Returns the winning side, None on timeout.
    pub async fn wait_resolution(
        &self,
        slug: &str,
        up_token_id: &str,
        timeout: Duration,
    ) -> Result<Option<Side>, VenueError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.get_market(slug).await {
                Ok(Some(market)) => {
                    if let Some(outcome) = resolution_outcome(&market, up_token_id) {
                        info!("Market {} resolved: {}", slug, outcome);
                        return Ok(Some(outcome));
                    }
                }
                Ok(None) => debug!("Market {} not found during resolution poll", slug),
                Err(VenueError::Auth(e)) => return Err(VenueError::Auth(e)),
                Err(e) => warn!("Resolution poll for {} failed: {}", slug, e),
            }

            if tokio::time::Instant::now() + RESOLUTION_POLL > deadline {
                return Ok(None);
            }
            tokio::time::sleep(RESOLUTION_POLL).await;
        }
    }
}

/// True once a binary market's outcome prices have pinned near 0 or 1.
/// The two prices sum to one, so either index answers the question.
pub fn prices_pinned(market: &RawMarket) -> bool {
    market
        .prices()
        .and_then(|prices| prices.first().copied())
        .map(|p| p >= RESOLUTION_HIGH || p <= RESOLUTION_LOW)
        .unwrap_or(false)
}

/// Read the winning side off pinned outcome prices, if pinned.
///
/// The venue emits `outcomes` / `outcomePrices` / `clobTokenIds` as
/// index-aligned arrays in either order, so the Up price is located by
/// token id first, by outcome label second, never by raw position.
pub fn resolution_outcome(market: &RawMarket, up_token_id: &str) -> Option<Side> {
    let prices = market.prices()?;
    let up_index = market
        .token_ids()
        .and_then(|tokens| tokens.iter().position(|t| t == up_token_id))
        .or_else(|| {
            market.outcome_labels().and_then(|labels| {
                labels
                    .iter()
                    .position(|label| Side::from_outcome_label(label) == Some(Side::Up))
            })
        })?;
    let up = *prices.get(up_index)?;
    if up >= RESOLUTION_HIGH {
        Some(Side::Up)
    } else if up <= RESOLUTION_LOW {
        Some(Side::Down)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UP_TOKEN: &str = "111";

    fn up_first_market(prices: &str) -> RawMarket {
        RawMarket {
            outcome_prices: Some(prices.to_string()),
            clob_token_ids: Some(r#"["111", "222"]"#.to_string()),
            outcomes: Some(r#"["Up", "Down"]"#.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolution_outcome_up() {
        let market = up_first_market(r#"["0.98", "0.02"]"#);
        assert_eq!(resolution_outcome(&market, UP_TOKEN), Some(Side::Up));
    }

    #[test]
    fn test_resolution_outcome_down() {
        let market = up_first_market(r#"["0.03", "0.97"]"#);
        assert_eq!(resolution_outcome(&market, UP_TOKEN), Some(Side::Down));
    }

    #[test]
    fn test_resolution_outcome_unresolved() {
        let market = up_first_market(r#"["0.60", "0.40"]"#);
        assert_eq!(resolution_outcome(&market, UP_TOKEN), None);
    }

    #[test]
    fn test_resolution_follows_token_order_not_index() {
        // Down-first market: the Up token sits at index 1, and index 0
        // carries the Down price. A pinned 0.97 at index 0 means Down
        // won even though a raw-index read would call it an Up win.
        let market = RawMarket {
            outcome_prices: Some(r#"["0.97", "0.03"]"#.to_string()),
            clob_token_ids: Some(r#"["222", "111"]"#.to_string()),
            outcomes: Some(r#"["Down", "Up"]"#.to_string()),
            ..Default::default()
        };
        assert_eq!(resolution_outcome(&market, UP_TOKEN), Some(Side::Down));

        let market = RawMarket {
            outcome_prices: Some(r#"["0.02", "0.98"]"#.to_string()),
            clob_token_ids: Some(r#"["222", "111"]"#.to_string()),
            outcomes: Some(r#"["No", "Yes"]"#.to_string()),
            ..Default::default()
        };
        assert_eq!(resolution_outcome(&market, UP_TOKEN), Some(Side::Up));
    }

    #[test]
    fn test_resolution_falls_back_to_labels() {
        // No token ids in the payload: the Yes/No labels still locate
        // the Up price.
        let market = RawMarket {
            outcome_prices: Some(r#"["0.04", "0.96"]"#.to_string()),
            outcomes: Some(r#"["No", "Yes"]"#.to_string()),
            ..Default::default()
        };
        assert_eq!(resolution_outcome(&market, UP_TOKEN), Some(Side::Up));
    }

    #[test]
    fn test_resolution_threshold_inclusive() {
        assert_eq!(
            resolution_outcome(&up_first_market(r#"["0.95", "0.05"]"#), UP_TOKEN),
            Some(Side::Up)
        );
        assert_eq!(
            resolution_outcome(&up_first_market(r#"["0.05", "0.95"]"#), UP_TOKEN),
            Some(Side::Down)
        );
    }

    #[test]
    fn test_resolution_outcome_needs_side_anchor() {
        // Pinned prices but neither token ids nor usable labels: the
        // winner cannot be determined safely.
        let market = RawMarket {
            outcome_prices: Some(r#"["0.98", "0.02"]"#.to_string()),
            ..Default::default()
        };
        assert_eq!(resolution_outcome(&market, UP_TOKEN), None);
        assert!(prices_pinned(&market));
    }

    #[test]
    fn test_prices_pinned() {
        assert!(prices_pinned(&up_first_market(r#"["0.98", "0.02"]"#)));
        assert!(prices_pinned(&up_first_market(r#"["0.03", "0.97"]"#)));
        assert!(!prices_pinned(&up_first_market(r#"["0.60", "0.40"]"#)));
        assert!(!prices_pinned(&RawMarket::default()));
    }

    #[test]
    fn test_request_signature_is_deterministic() {
        let secret = BASE64.encode(b"venue-secret");
        let a = request_signature(&secret, "1234567890", "POST", "/order", "{}").unwrap();
        let b = request_signature(&secret, "1234567890", "POST", "/order", "{}").unwrap();
        assert_eq!(a, b);
        assert!(!a.is_empty());

        let c = request_signature(&secret, "1234567891", "POST", "/order", "{}").unwrap();
        assert_ne!(a, c);
        let d = request_signature(&secret, "1234567890", "POST", "/order", "{...}").unwrap();
        assert_ne!(a, d);
    }

    #[test]
    fn test_request_signature_rejects_bad_secret() {
        let err = request_signature("not base64 at all!", "1", "GET", "/", "");
        assert!(matches!(err, Err(VenueError::Auth(_))));
    }
}
