//! Market registry: discovers the rolling binary windows on the venue,
//! keeps them keyed by slug, and retires them once they are old enough
//! that resolution polling no longer needs them.
//!
//! Re-discovery only refreshes derived fields. `open_price` and the
//! per-strategy signal flags belong to the window and are never reset.

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use regex::Regex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::events::{EventKind, EventLog};
use crate::types::{RawMarket, Side};
use crate::venue::{prices_pinned, VenueClient};
use crate::windows::{FiredFlags, Window, LOOKAHEAD_SECONDS, RESOLUTION_GRACE_SECONDS};

/// Discovery failures tolerated before surfacing registry_stale.
const STALE_AFTER_FAILURES: u32 = 3;

pub struct MarketRegistry {
    windows: RwLock<HashMap<String, Window>>,
    consecutive_failures: AtomicU32,
    stale_reported: AtomicBool,
    reference_re: Regex,
}

impl Default for MarketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketRegistry {
    pub fn new() -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            consecutive_failures: AtomicU32::new(0),
            stale_reported: AtomicBool::new(false),
            // Dollar amount embedded in the question text, e.g.
            // "Bitcoin above $98,765.43 at 12:35?"
            reference_re: Regex::new(r"\$([0-9][0-9,]*(?:\.[0-9]+)?)").expect("static regex"),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Window>> {
        self.windows.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Window>> {
        self.windows.write()
    }

    /// All tracked windows ordered by end time ascending.
    pub fn snapshot(&self) -> Vec<Window> {
        let mut windows: Vec<Window> = self.windows.read().values().cloned().collect();
        windows.sort_by_key(|w| w.end_time);
        windows
    }

    pub fn len(&self) -> usize {
        self.windows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.read().is_empty()
    }

    /// Latch the open price for any window past its settle period that
    /// has not latched yet. Returns the slugs that latched this tick,
    /// i.e. the windows that just went settling -> active.
    pub fn latch_open_prices(
        &self,
        now: DateTime<Utc>,
        price: Decimal,
        settle_seconds: f64,
    ) -> Vec<String> {
        let mut latched = Vec::new();
        let mut windows = self.windows.write();
        for window in windows.values_mut() {
            if window.open_price.is_some() || now >= window.end_time {
                continue;
            }
            let since_start = window.seconds_since_start(now);
            if since_start >= settle_seconds {
                window.open_price = Some(price);
                info!(
                    "Window baseline set ({}s in): ${} for {}",
                    since_start.round(),
                    price.round_dp(2),
                    window.slug
                );
                latched.push(window.slug.clone());
            }
        }
        latched
    }

    /// Parse a discovery record into a window. Anything missing or
    /// already resolved degrades to None (not tradable), never an error.
    fn parse_window(&self, raw: &RawMarket, now: DateTime<Utc>) -> Option<Window> {
        let slug = raw.slug.clone()?;
        let question = raw.question.clone().unwrap_or_else(|| slug.clone());

        let tokens = raw.token_ids()?;
        if tokens.len() != 2 {
            debug!("Skipping {}: expected 2 outcome tokens, got {}", slug, tokens.len());
            return None;
        }

        // Outcome index 0 is Up by series convention; trust the labels
        // when they disagree (the venue mixes Up/Down and Yes/No).
        let (up_token_id, down_token_id) = match raw
            .outcome_labels()
            .and_then(|labels| Side::from_outcome_label(labels.first()?))
        {
            Some(Side::Down) => (tokens[1].clone(), tokens[0].clone()),
            _ => (tokens[0].clone(), tokens[1].clone()),
        };

        let end_time = raw
            .end_date
            .as_deref()
            .and_then(parse_end_time)?;

        // Freshness: prices pinned near 0/1 mean the market already
        // resolved even if discovery still returns it.
        if prices_pinned(raw) {
            debug!("Skipping {}: outcome prices already pinned", slug);
            return None;
        }

        let age = (now - end_time).num_milliseconds() as f64 / 1000.0;
        if age > RESOLUTION_GRACE_SECONDS || -age > LOOKAHEAD_SECONDS {
            return None;
        }

        let reference_price = self
            .reference_re
            .captures(&question)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().replace(',', "").parse::<Decimal>().ok());

        Some(Window {
            slug,
            question,
            up_token_id,
            down_token_id,
            reference_price,
            end_time,
            open_price: None,
            fired: FiredFlags::default(),
        })
    }

    /// Merge a discovery round into the registry and evict windows past
    /// their grace period. Returns the number of newly tracked windows.
    pub fn apply_discovery(&self, raws: &[RawMarket], now: DateTime<Utc>) -> usize {
        let mut added = 0;
        let mut windows = self.windows.write();

        for raw in raws {
            let Some(parsed) = self.parse_window(raw, now) else {
                continue;
            };
            match windows.get_mut(&parsed.slug) {
                Some(existing) => {
                    // Derived fields only; open_price / fired survive.
                    existing.question = parsed.question;
                    existing.up_token_id = parsed.up_token_id;
                    existing.down_token_id = parsed.down_token_id;
                    existing.reference_price = parsed.reference_price;
                    existing.end_time = parsed.end_time;
                }
                None => {
                    info!("Tracking new window: {}", parsed.slug);
                    windows.insert(parsed.slug.clone(), parsed);
                    added += 1;
                }
            }
        }

        windows.retain(|slug, w| {
            let keep = (now - w.end_time).num_milliseconds() as f64 / 1000.0
                <= RESOLUTION_GRACE_SECONDS;
            if !keep {
                debug!("Evicting ended window: {}", slug);
            }
            keep
        });

        added
    }

    /// One discovery round against the venue.
    pub async fn refresh(&self, venue: &VenueClient, events: &EventLog) {
        let now = Utc::now();
        match venue.list_windows().await {
            Ok(raws) => {
                let added = self.apply_discovery(&raws, now);
                if added > 0 {
                    debug!("Discovery added {} windows ({} tracked)", added, self.len());
                }
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.stale_reported.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("Market discovery failed ({} in a row): {}", failures, e);
                if failures >= STALE_AFTER_FAILURES
                    && !self.stale_reported.swap(true, Ordering::Relaxed)
                {
                    events.push(
                        EventKind::Warn,
                        format!("registry_stale: discovery failing ({} attempts)", failures),
                    );
                }
                // Keep evicting on the local clock even when the venue
                // is unreachable.
                self.windows.write().retain(|_, w| {
                    (now - w.end_time).num_milliseconds() as f64 / 1000.0
                        <= RESOLUTION_GRACE_SECONDS
                });
            }
        }
    }
}

/// The venue emits RFC 3339 end dates, usually with a Z suffix.
fn parse_end_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Periodic discovery task.
pub async fn run_registry_task(
    registry: Arc<MarketRegistry>,
    venue: Arc<VenueClient>,
    events: Arc<EventLog>,
    refresh_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    // First round immediately so the strategy has windows at startup.
    registry.refresh(&venue, &events).await;

    let mut interval = tokio::time::interval(refresh_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => registry.refresh(&venue, &events).await,
            _ = shutdown.changed() => break,
        }
    }
    info!("Registry task stopped");
}
