mod config;
mod events;
mod feed;
mod publisher;
mod registry;
mod risk;
mod stats;
mod strategy;
mod time_util;
mod types;
mod venue;
mod windows;

use anyhow::Result;
use clap::Parser;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::Config;
use crate::events::EventLog;
use crate::feed::PriceFeed;
use crate::publisher::{BotSnapshot, StatePublisher};
use crate::registry::{run_registry_task, MarketRegistry};
use crate::stats::Stats;
use crate::strategy::engine::{run_resolution_task, Engine};
use crate::strategy::late::LateStrategy;
use crate::strategy::passive::PassiveStrategy;
use crate::strategy::spike::SpikeStrategy;
use crate::strategy::EntryStrategy;
use crate::venue::{VenueClient, VenueError};

/// Binance → Polymarket 5-minute latency arbitrage bot.
#[derive(Debug, Parser)]
#[command(name = "polylag")]
struct Cli {
    /// Run without the periodic status line.
    #[arg(long)]
    headless: bool,

    /// Override DRY_RUN from the environment.
    #[arg(long)]
    dry_run: Option<bool>,
}

fn setup_logging(level: &str) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(match level {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };
    if let Some(dry_run) = cli.dry_run {
        cfg.dry_run = dry_run;
    }
    if let Err(e) = cfg.validate_credentials() {
        eprintln!("Configuration error: {:#}", e);
        std::process::exit(1);
    }

    setup_logging(&cfg.log_level);

    info!("============================================================");
    info!("Binance-Polymarket {} Arbitrage Bot", cfg.duration_tag);
    info!(
        "  mode          = {}",
        if cfg.dry_run {
            "DRY RUN (simulated orders)"
        } else {
            "LIVE TRADING"
        }
    );
    info!("  symbol        = {}", cfg.symbol);
    info!("  spike         = ${} in {}s", cfg.spike_move_usd, cfg.spike_window_sec);
    info!(
        "  exits         = target +{}% / moonbag +{}% / stop {}%",
        cfg.profit_target_pct, cfg.moonbag_pct, cfg.hard_stop_pct
    );
    info!(
        "  sizing        = ${} x {} max positions, entry cap ${}",
        cfg.max_position_usdc, cfg.max_concurrent_positions, cfg.max_entry_price
    );
    info!("  daily loss cap= ${} (0 = off)", cfg.daily_loss_limit_usdc);
    info!("============================================================");

    if let Err(e) = run(cfg, cli.headless).await {
        error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cfg: Config, headless: bool) -> Result<()> {
    let events = Arc::new(EventLog::new());
    let venue = Arc::new(VenueClient::new(cfg.clone())?);

    // Bad credentials are fatal before any task spawns. A merely
    // unreachable venue is not: discovery retries.
    match venue.verify_auth().await {
        Ok(()) => {
            if !cfg.dry_run {
                info!("Venue credentials verified");
            }
        }
        Err(VenueError::Auth(e)) => {
            error!("Venue authentication failed: {}", e);
            std::process::exit(2);
        }
        Err(e) => warn!("Venue not reachable yet, continuing: {}", e),
    }

    let registry = Arc::new(MarketRegistry::new());
    let (feed, tick_rx) = PriceFeed::new(&cfg, events.clone());
    let feed = Arc::new(feed);
    let stats = Arc::new(Mutex::new(Stats::new()));
    let publisher = StatePublisher::new(cfg.dry_run);

    let (resolution_tx, resolution_rx) = mpsc::channel(64);
    let (outcome_tx, outcome_rx) = mpsc::channel(64);

    let strategies: Vec<Box<dyn EntryStrategy>> = vec![
        Box::new(SpikeStrategy::new(&cfg)),
        Box::new(PassiveStrategy::new(&cfg)),
        Box::new(LateStrategy::new(&cfg)),
    ];

    let engine = Engine::new(
        cfg.clone(),
        feed.clone(),
        venue.clone(),
        registry.clone(),
        events.clone(),
        stats.clone(),
        publisher.clone(),
        strategies,
        tick_rx,
        resolution_tx,
        outcome_rx,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut feed_task = tokio::spawn({
        let feed = feed.clone();
        let rx = shutdown_rx.clone();
        async move { feed.run(rx).await }
    });
    let mut engine_task = tokio::spawn(engine.run(shutdown_rx.clone()));
    let mut resolution_task = tokio::spawn(run_resolution_task(
        venue.clone(),
        resolution_rx,
        outcome_tx,
        shutdown_rx.clone(),
    ));
    let mut registry_task = tokio::spawn(run_registry_task(
        registry.clone(),
        venue.clone(),
        events.clone(),
        Duration::from_secs_f64(cfg.registry_refresh_sec),
        shutdown_rx.clone(),
    ));
    let mut publisher_task = tokio::spawn(publisher.clone().run(
        feed.clone(),
        registry.clone(),
        stats.clone(),
        events.clone(),
        shutdown_rx.clone(),
    ));

    let status_task = if headless {
        None
    } else {
        Some(tokio::spawn(run_status_printer(
            publisher.subscribe(),
            shutdown_rx.clone(),
        )))
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Drain in order: feed, strategy, resolution, registry, then the
    // publisher with a telemetry grace so the final snapshot flushes.
    // In-flight venue orders are deliberately not cancelled.
    for (name, handle) in [
        ("feed", &mut feed_task),
        ("strategy", &mut engine_task),
        ("resolution", &mut resolution_task),
        ("registry", &mut registry_task),
    ] {
        if tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .is_err()
        {
            warn!("{} task slow to stop, aborting it", name);
        }
    }
    feed_task.abort();
    engine_task.abort();
    resolution_task.abort();
    registry_task.abort();

    if tokio::time::timeout(Duration::from_secs(10), &mut publisher_task)
        .await
        .is_err()
    {
        warn!("publisher task slow to stop, aborting it");
        publisher_task.abort();
    }
    if let Some(handle) = status_task {
        handle.abort();
    }

    info!("Bot stopped.");
    Ok(())
}

/// Read-only observer over the published snapshot: one compact status
/// line every 30 seconds.
async fn run_status_printer(
    snapshot_rx: watch::Receiver<BotSnapshot>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let s = snapshot_rx.borrow().clone();
                let px = s
                    .spot_price
                    .map(|p| format!("${}", p.round_dp(2)))
                    .unwrap_or_else(|| "n/a".to_string());
                info!(
                    "[status] spot={} live={} windows={} open={} trades={} pnl=${:+.2} last={}",
                    px,
                    s.feed_live,
                    s.windows.len(),
                    s.positions.len(),
                    s.stats.trades,
                    s.stats.total_pnl,
                    s.events.last().map(|e| e.message.as_str()).unwrap_or("-")
                );
            }
            _ = shutdown.changed() => break,
        }
    }
}
