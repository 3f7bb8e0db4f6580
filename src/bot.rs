//! Bot runner: drives the decision engine from a price feed.
//!
//! Handles:
//! - Polling the feed at the configured interval
//! - Feeding each price through the engine handle
//! - Holding the ledger lease and applying queued operator commands
//! - Recording the equity curve
//! - Graceful shutdown on Ctrl+C or when the feed runs dry

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::db::{Database, StateStore};
use crate::exchange;
use crate::feed::PriceFeed;
use crate::metrics::{LadderMetrics, MetricsCalculator};
use crate::exchange::ExchangePort;
use crate::trading::{order_venue, BotState, DecisionEngine, EngineHandle, LadderConfig};

/// Connect the order venue for `config` and load its engine.
pub async fn launch(config: LadderConfig, store: Arc<dyn StateStore>) -> Result<EngineHandle> {
    let venue = order_venue(&config);
    let exchange =
        exchange::connect(venue).with_context(|| format!("Failed to connect {}", venue))?;
    launch_with(config, exchange, store).await
}

/// Load an engine on an already built order venue.
pub async fn launch_with(
    config: LadderConfig,
    exchange: Box<dyn ExchangePort>,
    store: Arc<dyn StateStore>,
) -> Result<EngineHandle> {
    let engine = DecisionEngine::load(config, exchange, store).await?;
    Ok(EngineHandle::new(engine))
}

/// How long a lease survives without a heartbeat.
pub fn lease_ttl(poll_interval: Duration) -> Duration {
    (poll_interval * 3).max(Duration::from_secs(30))
}

/// Take the lease on `symbol` for `owner`, or fail if another process holds it.
pub async fn claim_lease(db: &Database, symbol: &str, owner: &str, ttl: Duration) -> Result<()> {
    if !db.acquire_lease(symbol, owner, ttl).await? {
        bail!("{} is already being run by another process", symbol);
    }
    debug!(symbol = %symbol, owner = %owner, "Ledger lease acquired");
    Ok(())
}

/// Outcome of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Ticked,
    /// The feed has no more prices
    Exhausted,
    /// Another process took over the ledger
    Evicted,
}

/// Main bot runner.
pub struct Bot {
    handle: EngineHandle,
    feed: Box<dyn PriceFeed>,
    poll_interval: Duration,
    db: Option<Arc<Database>>,
    owner: String,
    ticks: u64,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl Bot {
    pub fn new(handle: EngineHandle, feed: Box<dyn PriceFeed>, poll_interval: Duration) -> Self {
        Self {
            handle,
            feed,
            poll_interval,
            db: None,
            owner: uuid::Uuid::new_v4().to_string(),
            ticks: 0,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Hold the ledger lease, drain the control queue and record an equity
    /// point after every tick.
    pub fn with_database(mut self, db: Arc<Database>) -> Self {
        self.db = Some(db);
        self
    }

    /// Lease owner id, when the lease was claimed before the engine loaded.
    pub fn with_owner(mut self, owner: String) -> Self {
        self.owner = owner;
        self
    }

    pub fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Main run loop. Returns when Ctrl+C is pressed or the feed is exhausted.
    pub async fn run(&mut self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        self.run_loop().await
    }

    async fn run_loop(&mut self) -> Result<()> {
        self.claim_ledger().await?;

        info!(
            feed = self.feed.name(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Starting ladder run loop"
        );

        let mut poll_interval = interval(self.poll_interval);

        while !self.shutdown.load(Ordering::SeqCst) {
            poll_interval.tick().await;

            match self.step().await {
                Ok(Step::Ticked) => {}
                Ok(Step::Exhausted) => {
                    info!(ticks = self.ticks, "Price feed exhausted");
                    break;
                }
                Ok(Step::Evicted) => {
                    warn!(owner = %self.owner, "Ledger lease lost, stopping");
                    break;
                }
                Err(e) => {
                    // Feed hiccups are retried on the next poll
                    error!(error = %e, "Error in bot tick");
                }
            }
        }

        self.shutdown().await
    }

    /// Take the ledger lease, or fail if another process is running it.
    pub async fn claim_ledger(&self) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let symbol = self.handle.config().await.symbol;
        claim_lease(db, &symbol, &self.owner, lease_ttl(self.poll_interval)).await
    }

    /// One poll: renew the lease, apply queued commands, then fetch a price
    /// and tick.
    async fn step(&mut self) -> Result<Step> {
        if let Some(db) = &self.db {
            let symbol = self.handle.config().await.symbol;
            if !db.acquire_lease(&symbol, &self.owner, lease_ttl(self.poll_interval)).await? {
                return Ok(Step::Evicted);
            }

            for command in db.take_commands(&symbol).await? {
                match self.handle.apply(command).await {
                    Ok(state) => info!(
                        command = %command,
                        paused = state.is_paused,
                        open_lots = state.positions.len(),
                        "Applied queued command"
                    ),
                    Err(e) => error!(command = %command, error = %e, "Queued command failed"),
                }
            }
        }

        let Some(price) = self.feed.next_price().await? else {
            return Ok(Step::Exhausted);
        };

        let state = self.handle.tick(price).await;
        self.ticks += 1;

        debug!(
            price = %price,
            balance = %state.balance,
            open_lots = state.positions.len(),
            paused = state.is_paused,
            "Tick processed"
        );

        if let Err(e) = self.record_equity(&state).await {
            warn!(error = %e, "Failed to record equity point");
        }

        Ok(Step::Ticked)
    }

    /// Record equity curve point.
    async fn record_equity(&self, state: &BotState) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        if state.current_price <= Decimal::ZERO {
            return Ok(());
        }

        let config = self.handle.config().await;
        db.record_equity_point(
            &config.symbol,
            state.equity_at(state.current_price),
            state.balance,
            state.exposure_at(state.current_price),
            state.realized_pnl,
        )
        .await
    }

    /// Graceful shutdown.
    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down bot...");

        let state = self.handle.state().await;
        if let Some(db) = &self.db {
            let symbol = self.handle.config().await.symbol;
            if let Err(e) = db.release_lease(&symbol, &self.owner).await {
                warn!(error = %e, "Failed to release ledger lease");
            }
        }

        info!(
            ticks = self.ticks,
            balance = %state.balance,
            open_lots = state.positions.len(),
            realized_pnl = %state.realized_pnl,
            "Bot shutdown complete"
        );

        Ok(())
    }

    /// Get current stats.
    pub async fn get_stats(&self) -> BotStats {
        let state = self.handle.state().await;
        let config = self.handle.config().await;

        let max_drawdown = match &self.db {
            Some(db) => db.calculate_max_drawdown(&config.symbol).await.unwrap_or(0.0),
            None => 0.0,
        };

        let mut stats = BotStats::from_state(&state, &config, max_drawdown);
        stats.ticks = self.ticks;
        stats
    }
}

/// Bot statistics.
#[derive(Debug, Clone)]
pub struct BotStats {
    pub symbol: String,
    pub venue: String,
    pub live_mode: bool,
    pub current_price: Decimal,
    pub balance: Decimal,
    pub equity: Decimal,
    pub exposure: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub peak_equity: Decimal,
    pub daily_loss: Decimal,
    pub open_lots: usize,
    pub level_cap: usize,
    /// Max drawdown over the recorded equity curve (fraction)
    pub max_drawdown: f64,
    pub metrics: LadderMetrics,
    pub ticks: u64,
    pub is_paused: bool,
    pub is_connected: bool,
}

impl BotStats {
    /// Dashboard numbers for a ledger snapshot.
    pub fn from_state(state: &BotState, config: &LadderConfig, max_drawdown: f64) -> Self {
        let price = state.current_price;
        let (equity, exposure, unrealized_pnl) = if price > Decimal::ZERO {
            (state.equity_at(price), state.exposure_at(price), state.unrealized_pnl(price))
        } else {
            // No tick since load: value lots at cost
            let invested: Decimal = state.positions.iter().map(|l| l.invested).sum();
            (state.balance + invested, invested, Decimal::ZERO)
        };

        Self {
            symbol: config.symbol.clone(),
            venue: order_venue(config).to_string(),
            live_mode: config.live_mode,
            current_price: price,
            balance: state.balance,
            equity,
            exposure,
            unrealized_pnl,
            realized_pnl: state.realized_pnl,
            peak_equity: state.peak_equity,
            daily_loss: state.daily_loss,
            open_lots: state.positions.len(),
            level_cap: state.effective_max_levels,
            max_drawdown,
            metrics: MetricsCalculator::calculate(&state.history, config.initial_capital),
            ticks: 0,
            is_paused: state.is_paused,
            is_connected: state.is_connected,
        }
    }
}

impl std::fmt::Display for BotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== {} on {} ===", self.symbol, self.venue)?;
        writeln!(f, "Last Price:      ${:.2}", self.current_price)?;
        writeln!(f, "Equity:          ${:.2}", self.equity)?;
        writeln!(f, "Balance:         ${:.2}", self.balance)?;
        writeln!(f, "Exposure:        ${:.2}", self.exposure)?;
        writeln!(f, "Unrealized P&L:  ${:.2}", self.unrealized_pnl)?;
        writeln!(f, "Realized P&L:    ${:.2}", self.realized_pnl)?;
        writeln!(f, "Peak Equity:     ${:.2}", self.peak_equity)?;
        writeln!(f, "Daily Loss:      ${:.2}", self.daily_loss)?;
        writeln!(f, "Max Drawdown:    {:.2}%", self.max_drawdown * 100.0)?;
        writeln!(f, "Active Levels:   {}/{}", self.open_lots, self.level_cap)?;
        if self.ticks > 0 {
            writeln!(f, "Ticks:           {}", self.ticks)?;
        }
        writeln!(
            f,
            "Status:          {} {} {}",
            if self.is_paused { "Paused" } else { "Active" },
            if self.is_connected { "(Connected)" } else { "(Disconnected)" },
            if self.live_mode { "LIVE" } else { "PAPER" }
        )?;
        if self.metrics.closed_lots > 0 {
            writeln!(f, "\n--- Closed Lots ---")?;
            writeln!(f, "{}", self.metrics)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::feed::FileReplayFeed;
    use crate::models::AuditAction;
    use crate::trading::ControlCommand;
    use rust_decimal_macros::dec;

    fn ladder_config() -> LadderConfig {
        LadderConfig {
            initial_capital: dec!(1000),
            min_notional: dec!(1),
            enable_stop_loss: false,
            ..Default::default()
        }
    }

    async fn bot_with(prices: Vec<Decimal>) -> Bot {
        let handle = launch(ladder_config(), Arc::new(MemoryStore::new())).await.unwrap();
        handle.resume().await;
        Bot::new(handle, Box::new(FileReplayFeed::new(prices)), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_runs_feed_to_exhaustion() {
        // Buy at 100, ladder at 98, both lots take profit at 102 and the
        // empty ladder opens a fresh rung on the same tick
        let mut bot = bot_with(vec![dec!(100), dec!(98), dec!(99), dec!(102)]).await;
        bot.run_loop().await.unwrap();

        let state = bot.handle().state().await;
        assert_eq!(bot.ticks, 4);
        assert_eq!(state.positions.len(), 1);
        assert_eq!(state.positions[0].entry_price, dec!(102));
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.logs.count(AuditAction::Buy), 3);
        assert_eq!(state.logs.count(AuditAction::Sell), 2);
        assert!(state.realized_pnl > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_loop() {
        let mut bot = bot_with(vec![dec!(100), dec!(101)]).await;
        bot.shutdown_signal().store(true, Ordering::SeqCst);

        bot.run_loop().await.unwrap();
        assert_eq!(bot.ticks, 0);
        assert!(bot.handle().state().await.positions.is_empty());
    }

    #[tokio::test]
    async fn test_records_equity_curve() {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let mut bot = bot_with(vec![dec!(100), dec!(90), dec!(95)])
            .await
            .with_database(db.clone());
        bot.run_loop().await.unwrap();

        let curve = db.get_equity_curve("BTCUSDT", 10).await.unwrap();
        assert_eq!(curve.len(), 3);
        assert!(db.calculate_max_drawdown("BTCUSDT").await.unwrap() > 0.0);

        let stats = bot.get_stats().await;
        assert_eq!(stats.ticks, 3);
        assert!(stats.max_drawdown > 0.0);
    }

    #[tokio::test]
    async fn test_stats_from_state() {
        let mut bot = bot_with(vec![dec!(100), dec!(102)]).await;
        bot.run_loop().await.unwrap();

        let stats = bot.get_stats().await;
        assert_eq!(stats.symbol, "BTCUSDT");
        assert_eq!(stats.venue, "SIMULATED");
        assert_eq!(stats.open_lots, 1);
        assert_eq!(stats.level_cap, 20);
        assert_eq!(stats.metrics.closed_lots, 1);
        assert_eq!(stats.current_price, dec!(102));
        assert!(!stats.is_paused);

        let report = stats.to_string();
        assert!(report.contains("Active Levels:   1/20"));
        assert!(report.contains("Closed Lots"));
    }

    #[tokio::test]
    async fn test_stats_before_first_tick_values_lots_at_cost() {
        let mut state = BotState::new(dec!(100), 20);
        let lot = crate::models::Lot::open(
            "BTCUSDT",
            "SIM-1".to_string(),
            chrono::Utc::now(),
            dec!(100),
            dec!(0.05),
            dec!(5),
            dec!(2),
            None,
        );
        state.open_lot(lot).unwrap();

        let stats = BotStats::from_state(&state, &ladder_config(), 0.0);
        assert_eq!(stats.balance, dec!(95));
        assert_eq!(stats.equity, dec!(100));
        assert_eq!(stats.exposure, dec!(5));
        assert_eq!(stats.unrealized_pnl, Decimal::ZERO);
    }

    fn replay_bot(handle: EngineHandle, prices: Vec<Decimal>, db: &Arc<Database>) -> Bot {
        Bot::new(handle, Box::new(FileReplayFeed::new(prices)), Duration::from_millis(1))
            .with_database(db.clone())
    }

    #[tokio::test]
    async fn test_queued_liquidation_reaches_running_engine() {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());

        let runner = launch(ladder_config(), db.clone()).await.unwrap();
        runner.resume().await;
        let prices = vec![dec!(100), dec!(98), dec!(97), dec!(96)];
        let mut bot = replay_bot(runner, prices, &db);
        bot.claim_ledger().await.unwrap();

        assert_eq!(bot.step().await.unwrap(), Step::Ticked);
        assert_eq!(bot.step().await.unwrap(), Step::Ticked);
        assert_eq!(bot.handle().state().await.positions.len(), 2);

        // An operator cannot take the ledger while the runner holds it
        let ttl = lease_ttl(Duration::from_millis(1));
        assert!(claim_lease(&db, "BTCUSDT", "operator", ttl).await.is_err());
        db.enqueue_command("BTCUSDT", ControlCommand::Liquidate).await.unwrap();

        assert_eq!(bot.step().await.unwrap(), Step::Ticked);
        let state = bot.handle().state().await;
        assert!(state.is_paused);
        assert!(state.positions.is_empty());
        assert_eq!(state.history.len(), 2);

        // Later ticks keep the liquidated ledger rather than an older copy
        assert_eq!(bot.step().await.unwrap(), Step::Ticked);
        let stored = db.load("BTCUSDT").await.unwrap().unwrap();
        assert!(stored.is_paused);
        assert!(stored.positions.is_empty());
        assert_eq!(stored.history.len(), 2);

        // Once the runner stops, a second engine loads the liquidated ledger
        bot.shutdown().await.unwrap();
        claim_lease(&db, "BTCUSDT", "operator", ttl).await.unwrap();
        let operator = launch(ladder_config(), db.clone()).await.unwrap();
        let state = operator.apply(ControlCommand::Resume).await.unwrap();
        assert!(!state.is_paused);
        assert!(state.positions.is_empty());
        assert_eq!(state.balance, stored.balance);
    }

    #[tokio::test]
    async fn test_second_runner_is_refused() {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());

        let first = launch(ladder_config(), db.clone()).await.unwrap();
        let first = replay_bot(first, vec![dec!(100)], &db);
        first.claim_ledger().await.unwrap();

        let second = launch(ladder_config(), db.clone()).await.unwrap();
        let second = replay_bot(second, vec![dec!(100)], &db);
        let err = second.claim_ledger().await.unwrap_err();
        assert!(err.to_string().contains("already being run"));

        first.shutdown().await.unwrap();
        second.claim_ledger().await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_lease_stops_the_loop() {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let handle = launch(ladder_config(), db.clone()).await.unwrap();
        handle.resume().await;
        let mut bot = replay_bot(handle, vec![dec!(100), dec!(98)], &db);
        bot.claim_ledger().await.unwrap();

        db.release_lease("BTCUSDT", &bot.owner).await.unwrap();
        let ttl = lease_ttl(Duration::from_millis(1));
        assert!(db.acquire_lease("BTCUSDT", "usurper", ttl).await.unwrap());

        assert_eq!(bot.step().await.unwrap(), Step::Evicted);
        assert!(bot.handle().state().await.positions.is_empty());
    }
}
