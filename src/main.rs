//! Ladder DCA Trading Bot
//!
//! Buys a fixed fraction of cash every time the price dips a set percentage
//! below the most recent entry, and sells each lot independently at its own
//! take-profit, under stop-loss, drawdown and daily-loss guards.

mod bot;
mod db;
mod exchange;
mod feed;
mod metrics;
mod models;
mod trading;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::bot::{claim_lease, launch, launch_with, lease_ttl, Bot, BotStats};
use crate::db::{Database, MemoryStore, StateStore};
use crate::exchange::{ExchangePort, ExchangeProvider, SimulatedExchange};
use crate::feed::{ExchangeFeed, FileReplayFeed, PriceFeed, RandomWalkFeed};
use crate::models::AuditAction;
use crate::trading::{
    order_venue, BotState, ControlCommand, DecisionEngine, EngineHandle, LadderConfig,
};

/// Ladder DCA trading bot CLI.
#[derive(Parser)]
#[command(name = "ladderbot")]
#[command(about = "Buy the dips in rungs, sell each rung at its own target", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./ladderbot.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Trading symbol (overrides the config file)
    #[arg(short, long)]
    symbol: Option<String>,

    /// Exchange (simulated, binance, bybit, kucoin, okx, coinbase, kraken)
    #[arg(short, long)]
    exchange: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum FeedKind {
    /// Poll the exchange's last traded price
    Exchange,
    /// Synthetic random walk
    Random,
    /// Replay prices from a file
    File,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the ladder
    Run {
        /// Price source
        #[arg(short, long, value_enum, default_value = "random")]
        feed: FeedKind,

        /// Price file for the file feed (one price or "timestamp,price" per line)
        #[arg(short, long)]
        prices: Option<PathBuf>,

        /// Starting price for the random feed
        #[arg(long, default_value = "50000")]
        start_price: f64,

        /// Unpause on start (a fresh or halted ledger starts paused)
        #[arg(long)]
        resume: bool,

        /// Send orders to the configured exchange instead of the paper venue
        #[arg(long)]
        live: bool,

        /// Keep the ledger in memory only (paper trading)
        #[arg(long)]
        memory: bool,

        /// Paper venue slippage per fill, in percent
        #[arg(long)]
        slippage: Option<Decimal>,

        /// Paper venue fee per fill, in percent of the quote amount
        #[arg(long)]
        fee_rate: Option<Decimal>,

        /// Paper venue delay per order, in milliseconds
        #[arg(long)]
        latency_ms: Option<u64>,
    },

    /// Show ledger status and statistics
    Status,

    /// Show the effective configuration
    Config {
        /// Print as JSON (credentials omitted)
        #[arg(long)]
        json: bool,
    },

    /// Pause trading
    Pause,

    /// Resume trading
    Resume,

    /// Close every open lot at market and pause
    Liquidate {
        /// Liquidation price for the paper venue
        #[arg(short, long)]
        price: Option<Decimal>,
    },

    /// Wipe the ledger and start over from the initial capital
    Reset,

    /// Show the audit log, newest first
    Logs {
        /// Maximum number of events to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let live = matches!(cli.command, Commands::Run { live: true, .. });
    let config = load_config(&cli, live)?;

    let database_url = cli.database.clone();

    match cli.command {
        Commands::Run {
            feed,
            prices,
            start_price,
            resume,
            live: _,
            memory,
            slippage,
            fee_rate,
            latency_ms,
        } => {
            if memory && config.live_mode {
                bail!("--memory is for paper trading only; a live ledger must be persisted");
            }

            info!(
                symbol = %config.symbol,
                venue = %order_venue(&config),
                live = config.live_mode,
                "Starting ladder bot"
            );

            let (price_feed, replay_len) = build_feed(feed, prices, start_price, &config)?;
            let feed_label = match replay_len {
                Some(n) => format!("{} ({} prices)", price_feed.name(), n),
                None => price_feed.name().to_string(),
            };

            let poll_interval = Duration::from_millis(config.polling_interval_ms);
            let paper = PaperVenue {
                slippage_pct: slippage,
                fee_rate_pct: fee_rate,
                latency_ms,
            };
            let exchange = paper.build(&config)?;

            let db = if memory {
                None
            } else {
                Some(Arc::new(Database::new(&database_url).await?))
            };
            // Claim the ledger before loading it so a second runner never writes
            let owner = uuid::Uuid::new_v4().to_string();
            let store: Arc<dyn StateStore> = match &db {
                Some(db) => {
                    claim_lease(db, &config.symbol, &owner, lease_ttl(poll_interval)).await?;
                    db.clone()
                }
                None => Arc::new(MemoryStore::new()),
            };

            let handle = launch_with(config.clone(), exchange, store).await?;
            let mut bot = Bot::new(handle, price_feed, poll_interval).with_owner(owner);
            if let Some(db) = db {
                bot = bot.with_database(db);
            }

            let handle = bot.handle();
            if resume {
                handle.resume().await;
            }

            let state = handle.state().await;
            println!("\n=== Ladder DCA Bot ===");
            println!("{}", config.summary());
            println!("Feed:            {}", feed_label);
            println!("Storage:         {}", if memory { "memory" } else { "sqlite" });
            println!("Balance:         ${:.2}", state.balance);
            println!("Open Lots:       {}", state.positions.len());
            if state.is_paused {
                println!("\nLedger is paused. Use --resume or 'ladderbot resume' to trade.");
            }
            println!("\nPress Ctrl+C to stop.\n");

            if let Err(e) = bot.run().await {
                tracing::error!(error = %e, "Bot error");
            }

            // Show final stats
            let stats = bot.get_stats().await;
            println!("\n{}", stats);
        }

        Commands::Status => {
            let db = Database::new(&database_url).await?;
            let Some(state) = db.load(&config.symbol).await? else {
                println!("No ledger for {}. Run 'ladderbot run' to start one.", config.symbol);
                let known = db.list_symbols().await?;
                if !known.is_empty() {
                    println!("Ledgers on file: {}", known.join(", "));
                }
                return Ok(());
            };

            let max_dd = db.calculate_max_drawdown(&config.symbol).await.unwrap_or(0.0);
            let stats = BotStats::from_state(&state, &config, max_dd);
            println!("\n{}", stats);

            print_lots(&state);
            print_logs(&state, 10);
        }

        Commands::Config { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("\n=== Ladder Configuration ===\n");
                println!("{}", config.summary());
            }
        }

        Commands::Pause => {
            let db = Arc::new(Database::new(&database_url).await?);
            control(config, db, ControlCommand::Pause, None).await?;
        }

        Commands::Resume => {
            let db = Arc::new(Database::new(&database_url).await?);
            control(config, db, ControlCommand::Resume, None).await?;
        }

        Commands::Liquidate { price } => {
            let db = Arc::new(Database::new(&database_url).await?);
            control(config, db, ControlCommand::Liquidate, price).await?;
        }

        Commands::Reset => {
            let db = Arc::new(Database::new(&database_url).await?);
            control(config, db, ControlCommand::Reset, None).await?;
        }

        Commands::Logs { limit } => {
            let db = Database::new(&database_url).await?;
            let Some(state) = db.load(&config.symbol).await? else {
                println!("No ledger for {}.", config.symbol);
                return Ok(());
            };
            print_logs(&state, limit);
        }
    }

    Ok(())
}

/// File, then CLI overrides, then credentials from the environment.
fn load_config(cli: &Cli, live: bool) -> Result<LadderConfig> {
    let mut config = match &cli.config {
        Some(path) => LadderConfig::from_file(path)?,
        None => LadderConfig::default(),
    };

    if let Some(symbol) = &cli.symbol {
        config.symbol = symbol.to_uppercase();
    }
    if let Some(exchange) = &cli.exchange {
        config.exchange = exchange
            .parse::<ExchangeProvider>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    if live {
        config.live_mode = true;
    }
    config.apply_env();

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Price source for `run`, plus the replay length for a file feed.
fn build_feed(
    kind: FeedKind,
    prices: Option<PathBuf>,
    start_price: f64,
    config: &LadderConfig,
) -> Result<(Box<dyn PriceFeed>, Option<usize>)> {
    match kind {
        FeedKind::Exchange if config.exchange == ExchangeProvider::Simulated => {
            bail!(
                "The simulated exchange has no market to poll; \
                 use --feed random or --feed file, or pick a real --exchange"
            );
        }
        FeedKind::Exchange => {
            let venue = exchange::connect(config.exchange)
                .with_context(|| format!("No price feed for {}", config.exchange))?;
            Ok((Box::new(ExchangeFeed::new(venue, &config.symbol)), None))
        }
        FeedKind::Random => Ok((Box::new(RandomWalkFeed::new(start_price)), None)),
        FeedKind::File => {
            let path = prices.context("--prices is required with --feed file")?;
            let replay = FileReplayFeed::from_path(&path)?;
            let remaining = replay.remaining();
            Ok((Box::new(replay), Some(remaining)))
        }
    }
}

/// Paper venue fill model from the `run` flags, in percent.
struct PaperVenue {
    slippage_pct: Option<Decimal>,
    fee_rate_pct: Option<Decimal>,
    latency_ms: Option<u64>,
}

impl PaperVenue {
    /// Order venue for `config`. The fill model only applies to paper trading.
    fn build(&self, config: &LadderConfig) -> Result<Box<dyn ExchangePort>> {
        let venue = order_venue(config);
        if venue != ExchangeProvider::Simulated {
            let tuned = self.slippage_pct.is_some()
                || self.fee_rate_pct.is_some()
                || self.latency_ms.is_some();
            if tuned {
                warn!("--slippage, --fee-rate and --latency-ms only apply to the paper venue");
            }
            return exchange::connect(venue).with_context(|| format!("Failed to connect {}", venue));
        }

        let mut paper = SimulatedExchange::new();
        if let Some(pct) = self.slippage_pct {
            paper = paper.with_slippage(percent_to_fraction("--slippage", pct)?);
        }
        if let Some(pct) = self.fee_rate_pct {
            paper = paper.with_fee_rate(percent_to_fraction("--fee-rate", pct)?);
        }
        if let Some(ms) = self.latency_ms {
            paper = paper.with_latency(Duration::from_millis(ms));
        }
        Ok(Box::new(paper))
    }
}

fn percent_to_fraction(flag: &str, pct: Decimal) -> Result<Decimal> {
    if pct < Decimal::ZERO || pct >= Decimal::ONE_HUNDRED {
        bail!("{} must be in [0, 100), got {}", flag, pct);
    }
    Ok(pct / Decimal::ONE_HUNDRED)
}

/// Apply an operator command.
///
/// A running bot holds the ledger lease, so the command is queued for it and
/// applied before its next tick. Otherwise this process takes the lease,
/// applies the command to the stored ledger and lets go.
async fn control(
    config: LadderConfig,
    db: Arc<Database>,
    command: ControlCommand,
    price: Option<Decimal>,
) -> Result<()> {
    let symbol = config.symbol.clone();
    let owner = uuid::Uuid::new_v4().to_string();
    let ttl = lease_ttl(Duration::from_millis(config.polling_interval_ms));

    if !db.acquire_lease(&symbol, &owner, ttl).await? {
        db.enqueue_command(&symbol, command).await?;
        if price.is_some() {
            warn!("--price is ignored, the running bot liquidates at its own last price");
        }
        println!("{} is running; '{}' queued for its next tick.", symbol, command);
        return Ok(());
    }

    let result = apply_directly(config, db.clone(), command, price).await;
    if let Err(e) = db.release_lease(&symbol, &owner).await {
        warn!(error = %e, "Failed to release ledger lease");
    }
    let state = result?;

    match command {
        ControlCommand::Pause => println!(
            "Paused. {} open lots, balance ${:.2}",
            state.positions.len(),
            state.balance
        ),
        ControlCommand::Resume if state.is_connected => println!("Resumed."),
        ControlCommand::Resume => println!("Resumed, but the exchange is not connected."),
        ControlCommand::Liquidate => {
            println!("Liquidated. Bot paused.");
            println!("Balance:      ${:.2}", state.balance);
            println!("Realized P&L: ${:.2}", state.realized_pnl);
            if !state.positions.is_empty() {
                println!("{} lots could not be sold and remain open.", state.positions.len());
            }
        }
        ControlCommand::Reset => {
            println!("Ledger reset. Balance ${:.2}, paused.", state.balance)
        }
    }
    Ok(())
}

async fn apply_directly(
    config: LadderConfig,
    db: Arc<Database>,
    command: ControlCommand,
    price: Option<Decimal>,
) -> Result<BotState> {
    let handle = match command {
        ControlCommand::Liquidate => open_for_liquidation(config, db, price).await?,
        _ => launch(config, db).await?,
    };
    handle.apply(command).await
}

/// The paper venue has no market of its own, so it fills at `price`.
async fn open_for_liquidation(
    config: LadderConfig,
    db: Arc<Database>,
    price: Option<Decimal>,
) -> Result<EngineHandle> {
    if order_venue(&config) != ExchangeProvider::Simulated {
        if price.is_some() {
            warn!("--price is ignored for live liquidation, using the exchange price");
        }
        return launch(config, db).await;
    }

    let Some(price) = price else {
        bail!("Paper liquidation needs --price");
    };
    if price <= Decimal::ZERO {
        bail!("Liquidation price must be positive, got {}", price);
    }

    let venue = SimulatedExchange::new().with_mark_price(price);
    let engine = DecisionEngine::load(config, Box::new(venue), db).await?;
    Ok(EngineHandle::new(engine))
}

fn print_lots(state: &BotState) {
    if state.positions.is_empty() {
        return;
    }

    let price = state.current_price;
    println!("\n=== Open Lots ===");
    println!(
        "{:<20} {:>12} {:>14} {:>12} {:>12}",
        "OPENED", "ENTRY", "QUANTITY", "TARGET", "FLOATING"
    );
    println!("{}", "-".repeat(74));

    for lot in &state.positions {
        let floating = if price > Decimal::ZERO {
            format!("${:.2}", lot.unrealized_pnl(price))
        } else {
            "-".to_string()
        };
        println!(
            "{:<20} {:>12.2} {:>14.6} {:>12.2} {:>12}",
            lot.entry_time.format("%Y-%m-%d %H:%M:%S"),
            lot.entry_price,
            lot.quantity,
            lot.tp_price,
            floating
        );
    }
}

fn print_logs(state: &BotState, limit: usize) {
    if state.logs.is_empty() {
        return;
    }

    println!("\n=== Recent Activity ===");
    for event in state.logs.iter().take(limit) {
        let amount = if event.action == AuditAction::Buy || event.action == AuditAction::Sell {
            format!(" ${:.2}", event.amount)
        } else {
            String::new()
        };
        println!(
            "  {} {:<6} {}{}",
            event.timestamp.format("%H:%M:%S"),
            event.action.as_str(),
            truncate(&event.message, 60),
            amount
        );
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn paper_config() -> LadderConfig {
        LadderConfig {
            min_notional: dec!(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_paper_venue_applies_fill_model() {
        let paper = PaperVenue {
            slippage_pct: Some(dec!(1)),
            fee_rate_pct: Some(dec!(0.1)),
            latency_ms: None,
        };
        let venue = paper.build(&paper_config()).unwrap();
        assert_eq!(venue.provider(), ExchangeProvider::Simulated);

        let buy = venue.market_buy("BTCUSDT", dec!(101), dec!(100)).await.unwrap();
        assert_eq!(buy.fill_price, dec!(101));
        assert_eq!(buy.quantity, dec!(100.899) / dec!(101));
    }

    #[test]
    fn test_exchange_feed_needs_a_real_venue() {
        let err = build_feed(FeedKind::Exchange, None, 100.0, &paper_config())
            .err()
            .unwrap();
        assert!(err.to_string().contains("--feed random"));

        let binance = LadderConfig {
            exchange: ExchangeProvider::Binance,
            ..paper_config()
        };
        let (feed, replay_len) = build_feed(FeedKind::Exchange, None, 100.0, &binance).unwrap();
        assert_eq!(feed.name(), "exchange");
        assert_eq!(replay_len, None);
    }

    #[test]
    fn test_file_feed_reports_its_length() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"100\n98\n102\n").unwrap();

        let path = Some(file.path().to_path_buf());
        let (feed, replay_len) = build_feed(FeedKind::File, path, 0.0, &paper_config()).unwrap();
        assert_eq!(feed.name(), "file");
        assert_eq!(replay_len, Some(3));
    }

    #[test]
    fn test_fill_model_percent_bounds() {
        assert_eq!(percent_to_fraction("--slippage", dec!(0.5)).unwrap(), dec!(0.005));
        assert!(percent_to_fraction("--slippage", dec!(-1)).is_err());
        assert!(percent_to_fraction("--fee-rate", dec!(100)).is_err());
    }

    #[tokio::test]
    async fn test_control_queues_while_ledger_is_leased() {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let ttl = lease_ttl(Duration::from_millis(1000));
        claim_lease(&db, "BTCUSDT", "runner", ttl).await.unwrap();

        control(paper_config(), db.clone(), ControlCommand::Pause, None).await.unwrap();

        assert_eq!(db.take_commands("BTCUSDT").await.unwrap(), vec![ControlCommand::Pause]);
        // Nothing was loaded or written behind the runner's back
        assert!(db.load("BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_control_applies_directly_without_runner() {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());

        control(paper_config(), db.clone(), ControlCommand::Resume, None).await.unwrap();

        let stored = db.load("BTCUSDT").await.unwrap().unwrap();
        assert!(!stored.is_paused);
        assert!(db.take_commands("BTCUSDT").await.unwrap().is_empty());
        // The lease was handed back
        claim_lease(&db, "BTCUSDT", "runner", lease_ttl(Duration::from_secs(1))).await.unwrap();
    }
}
