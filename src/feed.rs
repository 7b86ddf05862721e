//! Real-time spot price feed from the Binance trade stream.
//!
//! The feed keeps a shared "latest price" plus a short rolling tick
//! buffer for spike detection. A supervised loop reconnects through an
//! ordered list of endpoints with exponential backoff; consumers only
//! ever see a brief liveness blip. Losing individual ticks is fine: the
//! signal depends on deltas over the buffer, not on every trade.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::events::{EventKind, EventLog};
use crate::time_util::epoch_secs;

/// Rolling buffer size; at Binance trade cadence this covers well over
/// any spike window we evaluate.
const BUFFER_CAP: usize = 500;
/// All endpoints failing continuously for longer than this surfaces a
/// feed_unavailable error event.
const UNAVAILABLE_AFTER: Duration = Duration::from_secs(60);
/// A connection that survives this long resets the backoff counter.
const HEALTHY_AFTER: Duration = Duration::from_secs(10);

/// One spot trade event.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    pub price: Decimal,
    /// Epoch seconds.
    pub at: f64,
}

/// Shared feed state behind the RwLock handle.
#[derive(Debug)]
pub struct FeedState {
    pub current_price: Option<Decimal>,
    pub last_update: Instant,
    pub connected: bool,
    buffer: VecDeque<Tick>,
}

impl Default for FeedState {
    fn default() -> Self {
        Self {
            current_price: None,
            last_update: Instant::now(),
            connected: false,
            buffer: VecDeque::with_capacity(BUFFER_CAP),
        }
    }
}

impl FeedState {
    pub fn push_tick(&mut self, price: Decimal, at: f64) {
        self.current_price = Some(price);
        self.last_update = Instant::now();
        if self.buffer.len() >= BUFFER_CAP {
            self.buffer.pop_front();
        }
        self.buffer.push_back(Tick { price, at });
    }

    /// Price of the oldest tick inside the last `window_sec` seconds.
    pub fn price_n_seconds_ago(&self, window_sec: f64, now: f64) -> Option<Decimal> {
        let cutoff = now - window_sec;
        self.buffer
            .iter()
            .find(|t| t.at >= cutoff)
            .map(|t| t.price)
    }

    /// Signed dollar move over the last `window_sec` seconds when it
    /// reaches `move_usd`, else None.
    pub fn detect_spike(&self, move_usd: Decimal, window_sec: f64, now: f64) -> Option<Decimal> {
        let then = self.price_n_seconds_ago(window_sec, now)?;
        let current = self.current_price?;
        let delta = current - then;
        if delta.abs() >= move_usd {
            Some(delta)
        } else {
            None
        }
    }
}

/// Binance trade stream message. Only the fields we read.
#[derive(Debug, Deserialize)]
struct TradeMessage {
    #[serde(rename = "e")]
    event_type: Option<String>,
    #[serde(rename = "p")]
    price: Option<String>,
    #[serde(rename = "T")]
    trade_time_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

/// Spot price feed with a supervised reconnect loop.
pub struct PriceFeed {
    state: Arc<RwLock<FeedState>>,
    endpoints: Vec<String>,
    rest_url: String,
    stale_after: Duration,
    events: Arc<EventLog>,
    tick_tx: mpsc::Sender<Tick>,
}

impl PriceFeed {
    pub fn new(cfg: &Config, events: Arc<EventLog>) -> (Self, mpsc::Receiver<Tick>) {
        let (tick_tx, tick_rx) = mpsc::channel(1024);
        (
            Self {
                state: Arc::new(RwLock::new(FeedState::default())),
                endpoints: cfg.binance_ws_endpoints.clone(),
                rest_url: cfg.binance_rest_url.clone(),
                stale_after: Duration::from_secs_f64(cfg.stale_after_sec),
                events,
                tick_tx,
            },
            tick_rx,
        )
    }

    pub fn state(&self) -> Arc<RwLock<FeedState>> {
        self.state.clone()
    }

    pub fn current_price(&self) -> Option<Decimal> {
        self.state.read().current_price
    }

    /// The feed is live when a price exists and is not stale. Staleness
    /// flips this off while the reconnect loop keeps trying.
    pub fn is_live(&self) -> bool {
        let state = self.state.read();
        state.current_price.is_some() && state.last_update.elapsed() < self.stale_after
    }

    pub fn detect_spike(&self, move_usd: Decimal, window_sec: f64) -> Option<Decimal> {
        let now = epoch_secs(chrono::Utc::now());
        self.state.read().detect_spike(move_usd, window_sec, now)
    }

    /// Grab a REST snapshot so we have a price before the stream fires.
    async fn seed_price(&self) {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                warn!("REST seed client failed ({}), will wait for WS", e);
                return;
            }
        };
        match client.get(&self.rest_url).send().await {
            Ok(resp) => match resp.json::<TickerPrice>().await {
                Ok(ticker) => {
                    if let Ok(price) = ticker.price.parse::<Decimal>() {
                        let now = epoch_secs(chrono::Utc::now());
                        self.state.write().push_tick(price, now);
                        info!("Seeded spot price from REST: ${}", price.round_dp(2));
                    }
                }
                Err(e) => warn!("REST seed parse failed ({}), will wait for WS", e),
            },
            Err(e) => warn!("REST seed failed ({}), will wait for WS", e),
        }
    }

    /// Long-running supervision loop. Rotates through endpoints with
    /// `min(2^attempt, 30s) + jitter` backoff; the attempt counter
    /// resets after a sustained healthy connection.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.seed_price().await;

        let mut attempt: u32 = 0;
        let mut endpoint_idx: usize = 0;
        let mut down_since: Option<Instant> = None;
        let mut unavailable_reported = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let url = &self.endpoints[endpoint_idx % self.endpoints.len()];
            endpoint_idx += 1;

            let connected_at = Instant::now();
            match self.connect_and_stream(url, &mut shutdown).await {
                Ok(()) => info!("Spot feed connection closed"),
                Err(e) => warn!("Spot feed error on {}: {}", url, e),
            }
            self.state.write().connected = false;

            if *shutdown.borrow() {
                break;
            }

            if connected_at.elapsed() >= HEALTHY_AFTER {
                attempt = 0;
                down_since = None;
                unavailable_reported = false;
            } else {
                attempt = attempt.saturating_add(1);
                let down = down_since.get_or_insert(connected_at);
                if down.elapsed() > UNAVAILABLE_AFTER && !unavailable_reported {
                    unavailable_reported = true;
                    error!("Spot feed unavailable: all endpoints failing for over 60s");
                    self.events.push(
                        EventKind::Error,
                        "feed_unavailable: all endpoints failing for over 60s",
                    );
                }
            }

            let backoff_secs = 2u64.saturating_pow(attempt.min(5)).min(30);
            let jitter = rand::thread_rng().gen_range(0..500);
            let delay = Duration::from_secs(backoff_secs) + Duration::from_millis(jitter);
            debug!("Spot feed reconnecting in {:?}", delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Spot feed task stopped");
    }

    async fn connect_and_stream(
        &self,
        url: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        info!("Connecting to spot feed: {}", url);

        let (ws_stream, _) = tokio::time::timeout(Duration::from_secs(10), connect_async(url))
            .await
            .context("spot feed connection timeout")?
            .context("failed to connect to spot feed")?;

        info!("Spot feed connected");
        self.state.write().connected = true;

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        Ok(Message::Text(text)) => self.handle_trade_message(&text),
                        Ok(Message::Ping(data)) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Ok(Message::Close(_)) => {
                            info!("Spot feed closed by server");
                            break;
                        }
                        Err(e) => {
                            return Err(e).context("spot feed read error");
                        }
                        _ => {}
                    }
                }
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        Ok(())
    }

    fn handle_trade_message(&self, text: &str) {
        let Ok(msg) = serde_json::from_str::<TradeMessage>(text) else {
            return;
        };
        if msg.event_type.as_deref() != Some("trade") {
            return;
        }
        let Some(price) = msg.price.and_then(|p| p.parse::<Decimal>().ok()) else {
            return;
        };
        // Prefer the server trade time; fall back to the local clock.
        let at = msg
            .trade_time_ms
            .map(|ms| ms as f64 / 1000.0)
            .unwrap_or_else(|| epoch_secs(chrono::Utc::now()));

        self.state.write().push_tick(price, at);

        // Drop on a full channel: spike detection reads the buffer, so a
        // lost notification only delays the next poll by one cycle.
        let _ = self.tick_tx.try_send(Tick { price, at });
    }
}
