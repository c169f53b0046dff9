//! Grid Harvester - Main Entry Point
//!
//! Wires the composition root: exchange client, snapshot store, risk
//! manager, order pipeline, grid engine and the execution gateway, then
//! runs the cooperative timer loops until shutdown.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use grid_harvester::config::Config;
use grid_harvester::exchange::{
    ExchangeClient, KrakenClient, MarketStream, MockExchangeClient, RateLimiter,
};
use grid_harvester::gateway::ExecutionGateway;
use grid_harvester::grid::GridStateManager;
use grid_harvester::market_data::{MarketDataEvent, SnapshotStore};
use grid_harvester::orders::OrderManager;
use grid_harvester::persistence::{MockStore, SqliteStore, TradeStore};
use grid_harvester::risk::RiskManager;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Grid Harvester CLI
#[derive(Parser)]
#[command(name = "grid-harvester")]
#[command(version, about = "Grid trading with layered limit orders and risk management")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading backend (default)
    Run {
        /// Trade against the live exchange instead of the mock venue
        #[arg(long)]
        live: bool,
    },

    /// Show persisted grid state and risk history
    Status {
        /// Path to the SQLite database
        #[arg(short, long, default_value = "data/grid_harvester.db")]
        db: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    match cli.command {
        Some(Commands::Status { db }) => show_status(&db),
        Some(Commands::Run { live }) => run(live).await,
        None => run(false).await,
    }
}

async fn run(live: bool) -> Result<()> {
    info!(
        "Grid Harvester v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::load()?;
    config.validate()?;

    if live {
        warn!("LIVE TRADING MODE - real money at risk");
    } else {
        info!("MOCK TRADING MODE - paper trading against the simulated venue");
    }

    // Shared rate-limit budget for every outbound exchange call.
    let limiter = Arc::new(RateLimiter::new(config.execution.rate_limit_per_minute));

    let mut mock_venue: Option<Arc<MockExchangeClient>> = None;
    let exchange: Arc<dyn ExchangeClient> = if live {
        anyhow::ensure!(
            !config.exchange.api_key.is_empty() && !config.exchange.api_secret.is_empty(),
            "live mode requires exchange credentials"
        );
        Arc::new(
            KrakenClient::new(&config.exchange, &config.execution, limiter.clone())
                .context("Failed to create exchange client")?,
        )
    } else {
        let venue = Arc::new(MockExchangeClient::new(dec!(10000)).with_limiter(limiter.clone()));
        mock_venue = Some(venue.clone());
        venue
    };

    let store: Arc<dyn TradeStore> = if config.persistence_configured() {
        Arc::new(
            SqliteStore::new(&config.persistence.db_path)
                .context("Failed to open persistence store")?,
        )
    } else {
        info!("persistence credentials missing, running in mock-persistence mode");
        Arc::new(MockStore::new())
    };

    // Market-data snapshot store and its event stream.
    let mut market_data = SnapshotStore::new(Duration::from_secs(
        config.execution.stale_after_secs,
    ));
    let market_events = market_data.subscribe_events();
    let market_data = Arc::new(market_data);

    // Risk manager, the single gatekeeper.
    let mut risk = RiskManager::new(config.risk.clone(), store.clone(), market_data.clone());
    let risk_events = risk.subscribe_events();
    let risk = Arc::new(risk);

    // Order pipeline with the emergency-stop gate.
    let mut orders = OrderManager::new(
        exchange.clone(),
        store.clone(),
        risk.emergency_handle(),
        config.profit.reinvestment_percent,
        Duration::from_secs(config.execution.request_timeout_secs),
    );
    let order_events = orders.subscribe_events();
    let orders = Arc::new(orders);

    // Grid engine.
    let grid = Arc::new(GridStateManager::new(
        exchange.clone(),
        store.clone(),
        market_data.clone(),
        config.grid.clone(),
        config.profit.reinvestment_percent,
        Duration::from_secs(config.execution.request_timeout_secs),
    ));

    let gateway = Arc::new(ExecutionGateway::new(
        risk.clone(),
        orders.clone(),
        grid.clone(),
        market_data.clone(),
        exchange.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (stream_tx, stream_rx) = mpsc::channel(1024);

    let mut tasks = Vec::new();

    // Exchange push stream; paper trading runs a synthetic feed instead.
    if live {
        let stream = MarketStream::new(config.grid.trading_pairs.clone());
        tasks.push(tokio::spawn(stream.run(stream_tx, shutdown_rx.clone())));
    } else if let Some(venue) = mock_venue {
        tasks.push(tokio::spawn(run_mock_feed(
            venue,
            config.grid.trading_pairs.clone(),
            stream_tx,
            shutdown_rx.clone(),
        )));
    }

    tasks.push(tokio::spawn(
        market_data
            .clone()
            .run_ingest(stream_rx, shutdown_rx.clone()),
    ));
    tasks.push(tokio::spawn(market_data.clone().run_watchdog(
        Duration::from_secs(config.execution.market_scan_interval_secs),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(orders.clone().run_sync_loop(
        Duration::from_secs(config.execution.order_sync_interval_secs),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(risk.clone().run_evaluation_loop(
        Duration::from_secs(config.execution.risk_eval_interval_secs),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(
        gateway
            .clone()
            .run_fill_pump(order_events, shutdown_rx.clone()),
    ));
    tasks.push(tokio::spawn(
        gateway
            .clone()
            .run_risk_pump(risk_events, shutdown_rx.clone()),
    ));
    tasks.push(tokio::spawn(run_tick_pump(
        grid.clone(),
        config.grid.trading_pairs.clone(),
        market_events,
        shutdown_rx.clone(),
    )));

    info!(
        pairs = ?config.grid.trading_pairs,
        grid_levels = config.grid.grid_levels,
        "trading loops started"
    );

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received, draining in-flight work");

    // Cancel the timers; in-flight calls finish or hit their deadline.
    shutdown_tx.send(true).ok();
    for task in tasks {
        if let Err(e) = task.await {
            if !e.is_cancelled() {
                error!(error = %e, "task ended abnormally");
            }
        }
    }

    info!("Grid Harvester shutdown complete");
    Ok(())
}

/// Drive the grid engine from the market-data event stream: the first
/// tick for a configured pair initializes its grid at that price, every
/// later tick triggers a fill-detection pass.
async fn run_tick_pump(
    grid: Arc<GridStateManager>,
    configured_pairs: Vec<String>,
    mut events: mpsc::Receiver<MarketDataEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let configured: HashSet<String> = configured_pairs.into_iter().collect();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(MarketDataEvent::Tick { symbol, price }) => {
                    if !configured.contains(&symbol) {
                        continue;
                    }
                    if grid.grid_snapshot(&symbol).await.is_none() {
                        if let Err(e) = grid.initialize_grid(&symbol, price).await {
                            error!(%symbol, error = %e, "grid initialization failed");
                        }
                    } else if let Err(e) = grid.check_order_fills(&symbol).await {
                        warn!(%symbol, error = %e, "fill detection failed");
                    }
                }
                Some(MarketDataEvent::StaleData { symbol, age_secs }) => {
                    warn!(%symbol, age_secs, "stale market data");
                }
                None => return,
            },
            _ = shutdown.changed() => return,
        }
    }
}

/// Synthetic market feed for paper trading: a triangle wave around a
/// fixed base price wide enough to sweep the grid's rungs.
async fn run_mock_feed(
    venue: Arc<MockExchangeClient>,
    pairs: Vec<String>,
    stream_tx: mpsc::Sender<grid_harvester::exchange::StreamEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    use grid_harvester::exchange::{StreamEvent, TickerData};
    use rust_decimal::Decimal;

    const BASE_PRICE: rust_decimal::Decimal = dec!(50000);
    const STEP: rust_decimal::Decimal = dec!(250);

    let mut interval = tokio::time::interval(Duration::from_secs(2));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut tick: i64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                // Triangle wave: 0..12 up, 12..24 down, +-6% around base.
                let phase = tick % 24;
                let offset = if phase < 12 { phase } else { 24 - phase };
                let price = BASE_PRICE + STEP * Decimal::from(offset - 6);
                tick += 1;

                for pair in &pairs {
                    venue.set_price(pair, price).await;
                    let event = StreamEvent::Ticker(TickerData {
                        pair: pair.clone(),
                        bid: price - dec!(5),
                        ask: price + dec!(5),
                        last: price,
                        volume_24h: dec!(1200),
                        vwap_24h: price,
                        trade_count_24h: 10_000,
                        open_24h: BASE_PRICE,
                        timestamp: chrono::Utc::now(),
                    });
                    if stream_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

fn show_status(db: &str) -> Result<()> {
    let store = SqliteStore::new(db).context("Failed to open database")?;
    let config = Config::load().unwrap_or_default();

    println!("Grid Harvester status ({db})");
    println!();

    for pair in &config.grid.trading_pairs {
        match store.load_grid_state(pair) {
            Ok(Some(state)) => {
                println!("  {pair}");
                println!(
                    "    bounds: {} - {} ({} levels)",
                    state.grid_lower_bound, state.grid_upper_bound, state.total_grid_levels
                );
                println!(
                    "    orders: {} buys / {} sells",
                    state.active_buy_orders, state.active_sell_orders
                );
                println!(
                    "    invested: {}  profit: {}",
                    state.total_invested, state.current_profit
                );
                println!("    last rebalance: {}", state.last_rebalance_time);
            }
            Ok(None) => println!("  {pair}: no grid state"),
            Err(e) => println!("  {pair}: failed to load ({e})"),
        }
    }

    match store.load_portfolio_high() {
        Ok(Some(high)) => println!("\n  portfolio high: {high}"),
        Ok(None) => println!("\n  no risk metrics recorded yet"),
        Err(e) => println!("\n  failed to load risk metrics: {e}"),
    }

    Ok(())
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "grid-harvester.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer guard alive for the program duration.
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("grid_harvester=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}
