//! The strategy engine: the single task that owns every position.
//!
//! Entries, exits, mode switches, and resolution results all flow
//! through this loop, so per-position mutations are totally ordered and
//! at-most-one open position per (strategy, window) holds by
//! construction. Venue I/O suspends; nothing here blocks.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::events::{EventKind, EventLog};
use crate::feed::{PriceFeed, Tick};
use crate::publisher::{PositionView, StatePublisher};
use crate::registry::MarketRegistry;
use crate::risk::RiskGates;
use crate::stats::Stats;
use crate::types::{
    ClosedTrade, ExitPolicy, ExitReason, OrderRequest, OrderSide, OrderType, Position,
    PositionMode, PositionStatus, Side, StrategyKind,
};
use crate::venue::{VenueClient, VenueError};
use crate::windows::Phase;

use super::exit::{evaluate, realized_pnl, ExitDecision, ExitParams};
use super::{EntryRequest, EntryStrategy, ScanCtx};

/// Book favoring our side at this level while spot disagrees with the
/// strike marks a manipulated window.
const MANIPULATION_FAVOR: Decimal = dec!(0.60);
/// Once flagged, bail the moment our bid collapses to this.
const MANIPULATION_HARD_SELL: Decimal = dec!(0.30);
/// How long resolution polling tries before the position is left for
/// the operator (the venue outage budget).
const RESOLUTION_TIMEOUT: Duration = Duration::from_secs(300);
/// A rejected exit order gets this many tries, half a second apart.
const SELL_ATTEMPTS: u32 = 3;
const SELL_RETRY_DELAY: Duration = Duration::from_millis(500);

pub type PositionKey = (StrategyKind, String);

#[derive(Debug, Clone)]
pub struct ResolutionRequest {
    pub key: PositionKey,
    pub slug: String,
    /// Anchors which outcome price is the Up side when the poll reads
    /// the market back.
    pub up_token_id: String,
}

#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    pub key: PositionKey,
    /// None means the poll timed out or the venue stayed unreachable.
    pub outcome: Option<Side>,
}

/// Why an entry gate refused a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateBlock {
    FeedNotLive,
    TooCloseToResolution,
    MaxConcurrent,
}

impl GateBlock {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateBlock::FeedNotLive => "feed_gone",
            GateBlock::TooCloseToResolution => "too_close_to_resolution",
            GateBlock::MaxConcurrent => "max_concurrent_positions",
        }
    }
}

/// Budget and timing gates ahead of any order. The time gate is
/// strict: a signal at exactly the minimum is rejected.
pub fn check_entry_gates(
    feed_live: bool,
    seconds_remaining: f64,
    min_time_to_resolution: f64,
    open_positions: usize,
    max_concurrent: usize,
) -> Result<(), GateBlock> {
    if !feed_live {
        return Err(GateBlock::FeedNotLive);
    }
    if seconds_remaining <= min_time_to_resolution {
        return Err(GateBlock::TooCloseToResolution);
    }
    if open_positions >= max_concurrent {
        return Err(GateBlock::MaxConcurrent);
    }
    Ok(())
}

/// Whole-share sizing: spend at most `max_usdc` at `ask`.
pub fn size_order(max_usdc: Decimal, ask: Decimal) -> (Decimal, Decimal) {
    if ask <= Decimal::ZERO {
        return (Decimal::ZERO, Decimal::ZERO);
    }
    let shares = (max_usdc / ask).floor();
    (shares, shares * ask)
}

pub struct Engine {
    cfg: Config,
    exit_params: ExitParams,
    feed: Arc<PriceFeed>,
    venue: Arc<VenueClient>,
    registry: Arc<MarketRegistry>,
    events: Arc<EventLog>,
    stats: Arc<Mutex<Stats>>,
    publisher: Arc<StatePublisher>,
    risk: RiskGates,
    strategies: Vec<Box<dyn EntryStrategy>>,
    positions: HashMap<PositionKey, Position>,
    tick_rx: mpsc::Receiver<Tick>,
    resolution_tx: mpsc::Sender<ResolutionRequest>,
    outcome_rx: mpsc::Receiver<ResolutionOutcome>,
    last_spike_signal: Option<Instant>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        feed: Arc<PriceFeed>,
        venue: Arc<VenueClient>,
        registry: Arc<MarketRegistry>,
        events: Arc<EventLog>,
        stats: Arc<Mutex<Stats>>,
        publisher: Arc<StatePublisher>,
        strategies: Vec<Box<dyn EntryStrategy>>,
        tick_rx: mpsc::Receiver<Tick>,
        resolution_tx: mpsc::Sender<ResolutionRequest>,
        outcome_rx: mpsc::Receiver<ResolutionOutcome>,
    ) -> Self {
        let exit_params = ExitParams::from_config(&cfg);
        let risk = RiskGates::new(
            cfg.daily_loss_limit_usdc,
            cfg.consecutive_losses_to_pause,
            cfg.pause_minutes_after_streak,
        );
        Self {
            cfg,
            exit_params,
            feed,
            venue,
            registry,
            events,
            stats,
            publisher,
            risk,
            strategies,
            positions: HashMap::new(),
            tick_rx,
            resolution_tx,
            outcome_rx,
            last_spike_signal: None,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Strategy engine started | spike=${}/{}s target=+{}% moonbag=+{}% stop={}% dry_run={}",
            self.cfg.spike_move_usd,
            self.cfg.spike_window_sec,
            self.cfg.profit_target_pct,
            self.cfg.moonbag_pct,
            self.cfg.hard_stop_pct,
            self.cfg.dry_run
        );

        let mut poll = tokio::time::interval(Duration::from_secs_f64(self.cfg.poll_interval_sec));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let exit_interval = Duration::from_secs_f64(self.cfg.exit_eval_interval_sec);
        let mut last_exit_eval = Instant::now();

        loop {
            tokio::select! {
                _ = poll.tick() => {}
                Some(outcome) = self.outcome_rx.recv() => {
                    self.apply_resolution(outcome).await;
                    continue;
                }
                _ = shutdown.changed() => break,
            }

            // Drain tick notifications; the buffer behind the feed
            // handle already has the prices.
            while self.tick_rx.try_recv().is_ok() {}

            let now = Utc::now();
            self.stats.lock().roll_clock(now);

            if self.feed.is_live() {
                self.scan_and_enter(now).await;
            }

            if last_exit_eval.elapsed() >= exit_interval {
                last_exit_eval = Instant::now();
                self.check_exits(now).await;
            }
        }

        info!(
            "Strategy engine stopped ({} open positions left in memory)",
            self.open_count()
        );
    }

    fn open_count(&self) -> usize {
        self.positions
            .values()
            .filter(|p| p.status != PositionStatus::Closed)
            .count()
    }

    fn event(&self, kind: EventKind, message: String) {
        self.events.push(kind, message);
        self.publisher.mark_dirty();
    }

    fn publish_positions(&self) {
        let views = self
            .positions
            .values()
            .filter(|p| p.status != PositionStatus::Closed)
            .map(|p| PositionView {
                strategy: p.strategy,
                window_slug: p.window.slug.clone(),
                question: p.window.question.clone(),
                side: p.side,
                entry_price: p.entry_price,
                shares: p.shares,
                cost: p.cost,
                mode: p.mode,
                status: p.status,
                peak_gain_pct: p.peak_gain_pct,
                opened_at: p.opened_at,
                sell_stuck: p.sell_stuck,
                venue_gone: p.venue_gone,
            })
            .collect();
        self.publisher.update_positions(views);
    }

    // ------------------------------------------------------------------
    // Entries
    // ------------------------------------------------------------------

    async fn scan_and_enter(&mut self, now: DateTime<Utc>) {
        let price = match self.feed.current_price() {
            Some(p) => p,
            None => return,
        };

        let newly_active =
            self.registry
                .latch_open_prices(now, price, self.cfg.settle_seconds);
        if !newly_active.is_empty() {
            self.publisher.mark_dirty();
        }

        let windows = self.registry.snapshot();
        let feed = self.feed.clone();
        let venue = self.venue.clone();
        let events = self.events.clone();

        let mut requests: Vec<EntryRequest> = Vec::new();
        {
            let ctx = ScanCtx {
                now,
                windows: &windows,
                newly_active: &newly_active,
                feed: &feed,
                venue: &venue,
                events: &events,
            };
            for strategy in &mut self.strategies {
                requests.extend(strategy.scan(&ctx).await);
            }
        }

        for request in requests {
            self.process_entry(request, now).await;
        }
    }

    async fn process_entry(&mut self, req: EntryRequest, now: DateTime<Utc>) {
        // Spike signals are debounced globally before being consumed,
        // so a suppressed window keeps its one shot for the next cycle.
        if req.strategy == StrategyKind::Spike {
            if let Some(last) = self.last_spike_signal {
                if last.elapsed() < Duration::from_secs_f64(self.cfg.spike_debounce_sec) {
                    debug!("Signal debounced for {}", req.slug);
                    return;
                }
            }
        }

        // Consume the window's one signal for this strategy. This is
        // the compare-and-set the ordering guarantee hangs on: it runs
        // inside the single strategy task.
        let window_ref = {
            let mut windows = self.registry.write();
            let Some(window) = windows.get_mut(&req.slug) else {
                return;
            };
            if window.fired.get(req.strategy) {
                return;
            }
            match window.phase(now) {
                Phase::Waiting | Phase::Closing | Phase::Ended => return,
                Phase::Settling | Phase::Active => {}
            }
            window.fired.set(req.strategy);
            window.snapshot_ref()
        };

        if req.strategy == StrategyKind::Spike {
            self.last_spike_signal = Some(Instant::now());
        }
        self.stats.lock().record_signal();
        self.event(
            EventKind::Signal,
            format!("[{}] {} | {}", req.strategy, req.note, req.slug),
        );
        info!("SIGNAL [{}]: {} | {}", req.strategy, req.note, req.slug);

        let key: PositionKey = (req.strategy, req.slug.clone());
        if self.positions.contains_key(&key) {
            error!(
                "Invariant violation: position already open for {} on {}",
                req.strategy, req.slug
            );
            self.event(
                EventKind::Error,
                format!("duplicate position refused: {} {}", req.strategy, req.slug),
            );
            return;
        }

        if let Err(block) = check_entry_gates(
            self.feed.is_live(),
            window_ref.seconds_remaining(now),
            self.cfg.min_time_to_resolution_sec,
            self.open_count(),
            self.cfg.max_concurrent_positions,
        ) {
            self.event(
                EventKind::Warn,
                format!("entry refused ({}): {}", block.as_str(), req.slug),
            );
            return;
        }

        if let Err(block) = self.risk.check(now) {
            self.event(
                EventKind::Warn,
                format!("entry refused ({}): {}", block.as_str(), req.slug),
            );
            return;
        }

        let token_id = window_ref.token_for(req.side).to_string();
        let ask = match self.venue.best_ask(&token_id).await {
            Ok(Some(ask)) => ask,
            Ok(None) => {
                self.event(
                    EventKind::Warn,
                    format!("insufficient_liquidity: no {} ask on {}", req.side, req.slug),
                );
                return;
            }
            Err(e) => {
                self.event(
                    EventKind::Warn,
                    format!("book fetch failed for {}: {}", req.slug, e),
                );
                return;
            }
        };

        if ask <= Decimal::ZERO || ask >= Decimal::ONE {
            self.event(
                EventKind::Warn,
                format!("bad ask ${} for {} on {}", ask, req.side, req.slug),
            );
            return;
        }

        // The book already repriced past our cap: the edge is gone.
        if ask > req.price_cap {
            self.event(
                EventKind::Warn,
                format!(
                    "book_repriced: {} ask ${} > cap ${} on {}",
                    req.side, ask, req.price_cap, req.slug
                ),
            );
            return;
        }

        let (shares, cost) = size_order(self.cfg.max_position_usdc, ask);
        if shares < Decimal::ONE {
            self.event(
                EventKind::Warn,
                format!("position too small at ask ${} on {}", ask, req.slug),
            );
            return;
        }

        let order_price = match req.order_type {
            OrderType::Market => ask,
            OrderType::Limit => req.limit_price.unwrap_or(ask),
        };
        let order = OrderRequest {
            token_id: token_id.clone(),
            side: OrderSide::Buy,
            price: order_price,
            size: shares,
            order_type: req.order_type,
        };

        match self.venue.place_order(&order).await {
            Ok(order_id) => {
                info!(
                    "BUY [{}] {} {} shares @ ${} (${}) | {}",
                    req.strategy, req.side, shares, order_price, cost, req.slug
                );
                self.event(
                    EventKind::Buy,
                    format!(
                        "[{}] BUY {} {} @ ${} (${:.2}) | {}",
                        req.strategy, req.side, shares, order_price, cost, req.slug
                    ),
                );
                self.positions.insert(
                    key,
                    Position {
                        strategy: req.strategy,
                        window: window_ref,
                        side: req.side,
                        token_id,
                        entry_price: order_price,
                        shares,
                        cost,
                        opened_at: now,
                        peak_gain_pct: Decimal::ZERO,
                        mode: PositionMode::Normal,
                        status: PositionStatus::Open,
                        policy: req.policy,
                        sell_stuck: false,
                        venue_gone: false,
                        manipulation_flagged: false,
                    },
                );
                debug!("Order {} confirmed", order_id);
                self.publish_positions();
            }
            Err(e) => {
                // Signal dropped for good; the window's flag stays set.
                self.event(
                    EventKind::Warn,
                    format!("venue_rejected buy on {}: {}", req.slug, e),
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Exits
    // ------------------------------------------------------------------

    async fn check_exits(&mut self, now: DateTime<Utc>) {
        let keys: Vec<PositionKey> = self
            .positions
            .iter()
            .filter(|(_, p)| p.status == PositionStatus::Open)
            .map(|(k, _)| k.clone())
            .collect();

        for key in keys {
            let (ended, policy) = match self.positions.get(&key) {
                Some(p) => (p.window.ended(now), p.policy),
                None => continue,
            };

            if ended {
                self.begin_resolution(&key).await;
                continue;
            }

            match policy {
                ExitPolicy::Managed => self.eval_managed(&key, now).await,
                ExitPolicy::LimitTarget(target) => self.eval_limit_target(&key, target, now).await,
                ExitPolicy::HoldToResolution => self.eval_manipulation(&key, now).await,
            }
        }
    }

    async fn eval_managed(&mut self, key: &PositionKey, now: DateTime<Utc>) {
        let token_id = match self.positions.get(key) {
            Some(p) => p.token_id.clone(),
            None => return,
        };

        let bid = match self.venue.best_bid(&token_id).await {
            Ok(Some(bid)) if bid > Decimal::ZERO => bid,
            Ok(_) => return,
            Err(e) => {
                debug!("Bid fetch failed for {}: {}", key.1, e);
                return;
            }
        };

        let decision = {
            let Some(position) = self.positions.get_mut(key) else {
                return;
            };
            let gain = position.gain_pct(bid);
            if gain > position.peak_gain_pct {
                position.peak_gain_pct = gain;
            }
            let loss_usd = position.unrealized_loss_usd(bid);
            evaluate(
                &self.exit_params,
                position.mode,
                gain,
                position.peak_gain_pct,
                loss_usd,
            )
        };

        match decision {
            ExitDecision::Hold => {}
            ExitDecision::Switch(mode) => self.switch_mode(key, mode, bid),
            ExitDecision::Sell(reason) => {
                self.sell_position(key, reason, bid, now).await;
            }
        }
    }

    fn switch_mode(&mut self, key: &PositionKey, mode: PositionMode, bid: Decimal) {
        let Some(position) = self.positions.get_mut(key) else {
            return;
        };
        position.mode = mode;
        let gain = position.gain_pct(bid);
        let side = position.side;
        match mode {
            PositionMode::Moonbag => {
                info!("MOONBAG: {} at {:+.1}%, letting it ride", side, gain);
                self.event(
                    EventKind::Info,
                    format!("moonbag mode: {} {} at {:+.1}%", side, key.1, gain),
                );
            }
            PositionMode::Protection => {
                warn!("PROTECTION: {} at {:+.1}%, managing the loss", side, gain);
                self.event(
                    EventKind::Info,
                    format!("protection mode: {} {} at {:+.1}%", side, key.1, gain),
                );
            }
            PositionMode::Normal => {}
        }
        self.publish_positions();
    }

    async fn eval_limit_target(&mut self, key: &PositionKey, target: Decimal, now: DateTime<Utc>) {
        let token_id = match self.positions.get(key) {
            Some(p) => p.token_id.clone(),
            None => return,
        };

        let bid = match self.venue.best_bid(&token_id).await {
            Ok(Some(bid)) => bid,
            Ok(None) => return,
            Err(e) => {
                debug!("Bid fetch failed for {}: {}", key.1, e);
                return;
            }
        };

        if bid >= target {
            self.sell_position(key, ExitReason::TakeProfit, target, now)
                .await;
        }
    }

    /// Manipulation escape for hold-to-resolution positions: the book
    /// says our side is winning while spot sits on the wrong side of
    /// the strike. Flag it, then bail if our bid collapses.
    async fn eval_manipulation(&mut self, key: &PositionKey, now: DateTime<Utc>) {
        let (up_token, down_token, side, strike, flagged) = match self.positions.get(key) {
            Some(p) => match p.window.reference_price {
                Some(strike) => (
                    p.window.up_token_id.clone(),
                    p.window.down_token_id.clone(),
                    p.side,
                    strike,
                    p.manipulation_flagged,
                ),
                None => return,
            },
            None => return,
        };
        let Some(spot) = self.feed.current_price() else {
            return;
        };

        let up_bid = self
            .venue
            .best_bid(&up_token)
            .await
            .ok()
            .flatten()
            .unwrap_or(Decimal::ZERO);
        let down_bid = self
            .venue
            .best_bid(&down_token)
            .await
            .ok()
            .flatten()
            .unwrap_or(Decimal::ZERO);

        if !flagged {
            let wrong_side_up =
                side == Side::Up && up_bid >= MANIPULATION_FAVOR && spot < strike;
            let wrong_side_down =
                side == Side::Down && down_bid >= MANIPULATION_FAVOR && spot > strike;
            if wrong_side_up || wrong_side_down {
                if let Some(position) = self.positions.get_mut(key) {
                    position.manipulation_flagged = true;
                }
                warn!(
                    "MANIPULATION: {} favored at ${} but spot ${} vs strike ${}",
                    side,
                    if side == Side::Up { up_bid } else { down_bid },
                    spot.round_dp(0),
                    strike.round_dp(0)
                );
                self.event(
                    EventKind::Warn,
                    format!(
                        "manipulation flagged: {} {} (book ${}, spot ${} vs strike ${})",
                        side,
                        key.1,
                        if side == Side::Up { up_bid } else { down_bid },
                        spot.round_dp(0),
                        strike.round_dp(0)
                    ),
                );
                self.publish_positions();
            }
            return;
        }

        let our_bid = if side == Side::Up { up_bid } else { down_bid };
        if our_bid > Decimal::ZERO && our_bid <= MANIPULATION_HARD_SELL {
            self.sell_position(key, ExitReason::HardStop, our_bid, now)
                .await;
        }
    }

    async fn sell_position(
        &mut self,
        key: &PositionKey,
        reason: ExitReason,
        exit_price: Decimal,
        now: DateTime<Utc>,
    ) {
        let (token_id, shares) = {
            let Some(position) = self.positions.get_mut(key) else {
                return;
            };
            position.status = PositionStatus::Closing;
            (position.token_id.clone(), position.shares)
        };

        let order = OrderRequest {
            token_id,
            side: OrderSide::Sell,
            price: exit_price,
            size: shares,
            order_type: OrderType::Market,
        };

        match self.place_sell(&order).await {
            Ok(_) => self.finalize_close(key, reason, exit_price, now),
            Err(e) => {
                // Keep the position; it falls through to resolution.
                if let Some(position) = self.positions.get_mut(key) {
                    position.sell_stuck = true;
                    position.status = PositionStatus::Open;
                }
                self.event(
                    EventKind::Warn,
                    format!("sell_stuck on {}: {}", key.1, e),
                );
                self.publish_positions();
            }
        }
    }

    /// Exit orders get a short second chance: the book moves fast and
    /// a transient reject should not strand the position.
    async fn place_sell(&self, order: &OrderRequest) -> Result<String, VenueError> {
        let mut attempt: u32 = 1;
        loop {
            match self.venue.place_order(order).await {
                Ok(order_id) => return Ok(order_id),
                Err(e) if attempt < SELL_ATTEMPTS => {
                    warn!(
                        "Sell attempt {}/{} failed: {}, retrying in {:?}",
                        attempt, SELL_ATTEMPTS, e, SELL_RETRY_DELAY
                    );
                    attempt += 1;
                    tokio::time::sleep(SELL_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn finalize_close(
        &mut self,
        key: &PositionKey,
        reason: ExitReason,
        exit_price: Decimal,
        now: DateTime<Utc>,
    ) {
        let Some(mut position) = self.positions.remove(key) else {
            return;
        };
        position.status = PositionStatus::Closed;

        let pnl = realized_pnl(
            position.entry_price,
            exit_price,
            position.shares,
            self.cfg.fee_rate,
        );
        let pnl_pct = if position.entry_price.is_zero() {
            Decimal::ZERO
        } else {
            (exit_price - position.entry_price) / position.entry_price * Decimal::ONE_HUNDRED
        };

        info!(
            "EXIT [{}] {} {}: entry=${} exit=${} pnl=${:+.2} ({:+.1}%)",
            reason, position.strategy, position.side, position.entry_price, exit_price, pnl, pnl_pct
        );
        self.event(
            EventKind::Sell,
            format!(
                "[{}] SELL {} {} @ ${} [{}] pnl ${:+.2}",
                position.strategy, position.side, key.1, exit_price, reason, pnl
            ),
        );

        let trade = ClosedTrade {
            strategy: position.strategy,
            window_slug: position.window.slug.clone(),
            side: position.side,
            entry: position.entry_price,
            exit: exit_price,
            shares: position.shares,
            cost: position.cost,
            pnl,
            pnl_pct,
            status: reason,
            opened_at: position.opened_at,
            closed_at: now,
        };
        self.stats.lock().record_trade(trade);
        self.risk.record_close(pnl, now);
        self.publish_positions();
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    async fn begin_resolution(&mut self, key: &PositionKey) {
        let (slug, up_token_id) = {
            let Some(position) = self.positions.get_mut(key) else {
                return;
            };
            if position.status != PositionStatus::Open {
                return;
            }
            position.status = PositionStatus::Closing;
            (
                position.window.slug.clone(),
                position.window.up_token_id.clone(),
            )
        };

        info!("Window ended, polling resolution for {}", slug);
        if self
            .resolution_tx
            .send(ResolutionRequest {
                key: key.clone(),
                slug,
                up_token_id,
            })
            .await
            .is_err()
        {
            warn!("Resolution task gone; position left in memory");
        }
        self.publish_positions();
    }

    async fn apply_resolution(&mut self, outcome: ResolutionOutcome) {
        let now = Utc::now();
        let side = match self.positions.get(&outcome.key) {
            Some(position) => position.side,
            None => return,
        };

        match outcome.outcome {
            Some(winner) => {
                let (reason, exit_price) = if winner == side {
                    (ExitReason::ResolvedWin, Decimal::ONE)
                } else {
                    (ExitReason::ResolvedLoss, Decimal::ZERO)
                };
                self.finalize_close(&outcome.key, reason, exit_price, now);
            }
            None => {
                if let Some(position) = self.positions.get_mut(&outcome.key) {
                    position.venue_gone = true;
                }
                warn!(
                    "venue_gone: resolution unavailable for {}, position left for operator",
                    outcome.key.1
                );
                self.event(
                    EventKind::Error,
                    format!("venue_gone: {} unresolved, left for operator", outcome.key.1),
                );
                self.publish_positions();
            }
        }
    }
}

/// Resolution poller: one lightweight task per ended window, results
/// funneled back into the engine loop.
pub async fn run_resolution_task(
    venue: Arc<VenueClient>,
    mut request_rx: mpsc::Receiver<ResolutionRequest>,
    outcome_tx: mpsc::Sender<ResolutionOutcome>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            request = request_rx.recv() => {
                let Some(request) = request else { break };
                let venue = venue.clone();
                let outcome_tx = outcome_tx.clone();
                tokio::spawn(async move {
                    let outcome = match venue
                        .wait_resolution(&request.slug, &request.up_token_id, RESOLUTION_TIMEOUT)
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!("Resolution poll error for {}: {}", request.slug, e);
                            None
                        }
                    };
                    let _ = outcome_tx
                        .send(ResolutionOutcome { key: request.key, outcome })
                        .await;
                });
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("Resolution task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use crate::windows::WindowRef;
    use chrono::TimeZone;

    fn test_engine() -> (Engine, mpsc::Receiver<ResolutionRequest>, mpsc::Sender<ResolutionOutcome>)
    {
        let cfg = Config::from_env().unwrap();
        let events = Arc::new(EventLog::new());
        let (feed, tick_rx) = PriceFeed::new(&cfg, events.clone());
        let venue = Arc::new(VenueClient::new(cfg.clone()).unwrap());
        let registry = Arc::new(MarketRegistry::new());
        let stats = Arc::new(Mutex::new(Stats::new()));
        let publisher = StatePublisher::new(true);
        let (resolution_tx, resolution_rx) = mpsc::channel(8);
        let (outcome_tx, outcome_rx) = mpsc::channel(8);

        let engine = Engine::new(
            cfg,
            Arc::new(feed),
            venue,
            registry,
            events,
            stats,
            publisher,
            Vec::new(),
            tick_rx,
            resolution_tx,
            outcome_rx,
        );
        (engine, resolution_rx, outcome_tx)
    }

    fn open_position(entry: Decimal, shares: Decimal, side: Side) -> Position {
        let end = Utc.timestamp_opt(1_700_000_300, 0).unwrap();
        Position {
            strategy: StrategyKind::Spike,
            window: WindowRef {
                slug: "w1".to_string(),
                question: "q".to_string(),
                up_token_id: "111".to_string(),
                down_token_id: "222".to_string(),
                reference_price: None,
                end_time: end,
            },
            side,
            token_id: "111".to_string(),
            entry_price: entry,
            shares,
            cost: entry * shares,
            opened_at: end - chrono::Duration::seconds(200),
            peak_gain_pct: Decimal::ZERO,
            mode: PositionMode::Normal,
            status: PositionStatus::Open,
            policy: ExitPolicy::Managed,
            sell_stuck: false,
            venue_gone: false,
            manipulation_flagged: false,
        }
    }

    #[tokio::test]
    async fn test_resolution_win_pays_full_share() {
        let (mut engine, _res_rx, _out_tx) = test_engine();
        let key: PositionKey = (StrategyKind::Spike, "w1".to_string());
        engine
            .positions
            .insert(key.clone(), open_position(dec!(0.50), dec!(200), Side::Up));

        engine
            .apply_resolution(ResolutionOutcome {
                key: key.clone(),
                outcome: Some(Side::Up),
            })
            .await;

        assert!(engine.positions.is_empty());
        let stats = engine.stats.lock();
        let trades = stats.recent_trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].status, ExitReason::ResolvedWin);
        // 200 shares * (1 - 0.50) * (1 - 0.02) = 98.
        assert_eq!(trades[0].pnl, dec!(98.00));
    }

    #[tokio::test]
    async fn test_resolution_loss_burns_cost() {
        let (mut engine, _res_rx, _out_tx) = test_engine();
        let key: PositionKey = (StrategyKind::Spike, "w1".to_string());
        engine
            .positions
            .insert(key.clone(), open_position(dec!(0.50), dec!(200), Side::Up));

        engine
            .apply_resolution(ResolutionOutcome {
                key: key.clone(),
                outcome: Some(Side::Down),
            })
            .await;

        let stats = engine.stats.lock();
        let trades = stats.recent_trades();
        assert_eq!(trades[0].status, ExitReason::ResolvedLoss);
        assert_eq!(trades[0].pnl, dec!(-100.00));
    }

    #[tokio::test]
    async fn test_resolution_timeout_leaves_position_for_operator() {
        let (mut engine, _res_rx, _out_tx) = test_engine();
        let key: PositionKey = (StrategyKind::Spike, "w1".to_string());
        engine
            .positions
            .insert(key.clone(), open_position(dec!(0.55), dec!(90), Side::Up));

        engine
            .apply_resolution(ResolutionOutcome {
                key: key.clone(),
                outcome: None,
            })
            .await;

        let position = engine.positions.get(&key).unwrap();
        assert!(position.venue_gone);
        assert_eq!(engine.stats.lock().trade_count(), 0);
    }

    #[tokio::test]
    async fn test_finalize_close_take_profit_arithmetic() {
        let (mut engine, _res_rx, _out_tx) = test_engine();
        let key: PositionKey = (StrategyKind::Spike, "w1".to_string());
        engine
            .positions
            .insert(key.clone(), open_position(dec!(0.51), dec!(196), Side::Up));

        let now = Utc.timestamp_opt(1_700_000_250, 0).unwrap();
        engine.finalize_close(&key, ExitReason::TakeProfit, dec!(0.562), now);

        let stats = engine.stats.lock();
        let trades = stats.recent_trades();
        assert_eq!(trades.len(), 1);
        // 196 * 0.052 * 0.98 = 9.98816, roughly ten dollars of edge.
        assert_eq!(trades[0].pnl, dec!(9.98816));
        assert!(trades[0].pnl_pct > dec!(10.1) && trades[0].pnl_pct < dec!(10.3));
    }

    #[tokio::test]
    async fn test_begin_resolution_requests_poll_once() {
        let (mut engine, mut res_rx, _out_tx) = test_engine();
        let key: PositionKey = (StrategyKind::Spike, "w1".to_string());
        engine
            .positions
            .insert(key.clone(), open_position(dec!(0.50), dec!(100), Side::Up));

        engine.begin_resolution(&key).await;
        assert_eq!(
            engine.positions.get(&key).unwrap().status,
            PositionStatus::Closing
        );
        let request = res_rx.try_recv().unwrap();
        assert_eq!(request.slug, "w1");
        assert_eq!(request.up_token_id, "111");

        // A second pass does not enqueue another poll.
        engine.begin_resolution(&key).await;
        assert!(res_rx.try_recv().is_err());
    }

    #[test]
    fn test_entry_time_gate_is_strict() {
        // Exactly at the minimum: rejected.
        assert_eq!(
            check_entry_gates(true, 30.0, 30.0, 0, 3),
            Err(GateBlock::TooCloseToResolution)
        );
        // One millisecond more remaining: accepted.
        assert!(check_entry_gates(true, 30.001, 30.0, 0, 3).is_ok());
    }

    #[test]
    fn test_entry_gate_feed_liveness() {
        assert_eq!(
            check_entry_gates(false, 200.0, 30.0, 0, 3),
            Err(GateBlock::FeedNotLive)
        );
    }

    #[test]
    fn test_entry_gate_budget() {
        assert_eq!(
            check_entry_gates(true, 200.0, 30.0, 3, 3),
            Err(GateBlock::MaxConcurrent)
        );
        assert!(check_entry_gates(true, 200.0, 30.0, 2, 3).is_ok());
    }

    #[test]
    fn test_sizing_floors_to_whole_shares() {
        // $100 at $0.51 buys 196 shares for $99.96.
        let (shares, cost) = size_order(dec!(100), dec!(0.51));
        assert_eq!(shares, dec!(196));
        assert_eq!(cost, dec!(99.96));

        let (shares, cost) = size_order(dec!(50), dec!(0.60));
        assert_eq!(shares, dec!(83));
        assert_eq!(cost, dec!(49.80));
    }

    #[test]
    fn test_sizing_degenerate_ask() {
        let (shares, cost) = size_order(dec!(50), Decimal::ZERO);
        assert_eq!(shares, Decimal::ZERO);
        assert_eq!(cost, Decimal::ZERO);
    }
}
