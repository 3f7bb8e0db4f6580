//! Decision engine: the tick state machine that owns the ledger.
//!
//! One tick, while active:
//! 1. Record the price and recompute the level cap
//! 2. Ask the risk governor; on a breach liquidate everything and pause
//! 3. Exit pass over open lots, oldest first
//! 4. Entry pass: at most one new rung per tick
//!
//! Nothing here is fatal. Venue failures become audit events and the next
//! qualifying tick retries naturally; persistence failures are logged.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use super::config::{ConfigError, DailyLossReset, LadderConfig};
use super::ledger::BotState;
use super::risk::{HaltReason, RiskGovernor, RiskVerdict};
use crate::db::StateStore;
use crate::exchange::{self, ExchangePort, ExchangeProvider};
use crate::models::{AuditAction, Lot};

/// Venue that receives orders: the configured one in live mode, the paper
/// venue otherwise.
pub fn order_venue(config: &LadderConfig) -> ExchangeProvider {
    if config.live_mode {
        config.exchange
    } else {
        ExchangeProvider::Simulated
    }
}

pub struct DecisionEngine {
    config: LadderConfig,
    state: BotState,
    exchange: Box<dyn ExchangePort>,
    store: Arc<dyn StateStore>,
}

impl DecisionEngine {
    /// Build an engine for `config.symbol`, resuming a saved ledger if the
    /// store has one.
    pub async fn load(
        config: LadderConfig,
        exchange: Box<dyn ExchangePort>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        config.validate()?;

        let venue = order_venue(&config);
        if exchange.provider() != venue {
            bail!(
                "Exchange adapter is {} but the configuration routes orders to {}",
                exchange.provider(),
                venue
            );
        }

        let state = match store
            .load(&config.symbol)
            .await
            .with_context(|| format!("Failed to load state for {}", config.symbol))?
        {
            Some(mut saved) => {
                saved.reset_transient();
                info!(
                    symbol = %config.symbol,
                    balance = %saved.balance,
                    open_lots = saved.positions.len(),
                    "Resumed saved ledger"
                );
                saved
            }
            None => {
                let levels = config.level_sizing().effective_levels(config.initial_capital);
                BotState::new(config.initial_capital, levels)
            }
        };

        let mut engine = Self {
            config,
            state,
            exchange,
            store,
        };
        engine.authenticate(Utc::now()).await;
        engine.persist().await;

        Ok(engine)
    }

    pub fn config(&self) -> &LadderConfig {
        &self.config
    }

    /// Independent copy of the ledger.
    pub fn state(&self) -> BotState {
        self.state.clone()
    }

    /// Advance one time step at `price`.
    pub async fn tick(&mut self, price: Decimal) -> BotState {
        self.tick_at(price, Utc::now()).await
    }

    /// `tick` with an explicit clock.
    pub async fn tick_at(&mut self, price: Decimal, now: DateTime<Utc>) -> BotState {
        if self.state.is_paused || self.config.emergency_stop {
            return self.state.clone();
        }

        if self.config.live_mode && !self.state.is_connected {
            self.state.is_paused = true;
            self.note(now, AuditAction::Error, "Live mode connection lost. Bot paused.");
            self.persist().await;
            return self.state.clone();
        }

        if price <= Decimal::ZERO {
            self.log(
                now,
                AuditAction::Error,
                price,
                Decimal::ZERO,
                Decimal::ZERO,
                format!("Rejected invalid tick price {}", price),
            );
            self.persist().await;
            return self.state.clone();
        }

        self.roll_daily_loss(now);
        self.state.current_price = price;

        let equity = self.state.equity_at(price);
        self.state.effective_max_levels = self.config.level_sizing().effective_levels(equity);

        let assessment = RiskGovernor::evaluate(&self.state, &self.config, price);
        self.state.peak_equity = assessment.peak_equity;

        if let RiskVerdict::LiquidateAndPause(reason) = assessment.verdict {
            warn!(
                symbol = %self.config.symbol,
                reason = %reason,
                equity = %assessment.equity,
                peak = %assessment.peak_equity,
                daily_loss = %self.state.daily_loss,
                "Risk limit breached, liquidating"
            );
            self.close_all(reason, price, now).await;
            self.state.is_paused = true;
            self.persist().await;
            return self.state.clone();
        }

        self.process_exits(price, now).await;
        self.process_entries(price, now).await;

        self.persist().await;
        self.state.clone()
    }

    /// Stop trading. Pausing an already paused engine changes nothing.
    pub async fn pause(&mut self) -> BotState {
        if !self.state.is_paused {
            self.state.is_paused = true;
            self.note(Utc::now(), AuditAction::System, "Bot Paused");
            self.persist().await;
        }
        self.state.clone()
    }

    /// Start trading again. A disconnected live venue gets one more
    /// authentication attempt first.
    pub async fn resume(&mut self) -> BotState {
        if self.state.is_paused {
            let now = Utc::now();
            if self.config.live_mode && !self.state.is_connected {
                self.authenticate(now).await;
            }
            self.state.is_paused = false;
            self.note(now, AuditAction::System, "Bot Resumed");
            self.persist().await;
        }
        self.state.clone()
    }

    /// Validate and swap in a new configuration. On error the running
    /// configuration is untouched.
    pub async fn update_config(&mut self, config: LadderConfig) -> Result<BotState, ConfigError> {
        config.validate()?;

        if config.symbol != self.config.symbol {
            return Err(ConfigError::InvalidValue(
                "symbol".to_string(),
                format!(
                    "cannot switch from {} to {} on a running ledger",
                    self.config.symbol, config.symbol
                ),
            ));
        }

        let venue = order_venue(&config);
        let replacement = if venue != self.exchange.provider() {
            Some(exchange::connect(venue).map_err(|_| ConfigError::UnsupportedExchange(venue))?)
        } else {
            None
        };

        if let Some(adapter) = replacement {
            info!(from = %self.exchange.provider(), to = %venue, "Switching exchange");
            self.exchange = adapter;
        }
        self.config = config;

        let now = Utc::now();
        self.authenticate(now).await;
        self.note(now, AuditAction::System, "Configuration updated");
        self.persist().await;

        Ok(self.state.clone())
    }

    /// Close every open lot at market and pause.
    ///
    /// Uses the last tick price, or the venue's last price when no tick has
    /// run since load. Lots whose sell fails stay open.
    pub async fn liquidate_all(&mut self, reason: HaltReason) -> BotState {
        let now = Utc::now();

        let price = if self.state.current_price > Decimal::ZERO {
            Some(self.state.current_price)
        } else {
            match self.exchange.last_price(&self.config.symbol).await {
                Ok(p) if p > Decimal::ZERO => Some(p),
                Ok(p) => {
                    warn!(price = %p, "Venue returned a non-positive price");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "Failed to fetch price for liquidation");
                    None
                }
            }
        };

        match price {
            Some(price) => self.close_all(reason, price, now).await,
            None => self.note(
                now,
                AuditAction::Error,
                format!("Emergency Closure: {} aborted, no price available", reason),
            ),
        }

        self.state.is_paused = true;
        self.persist().await;
        self.state.clone()
    }

    /// Throw the ledger away and start again from the configured capital.
    pub async fn reset(&mut self) -> Result<BotState> {
        self.store
            .clear(&self.config.symbol)
            .await
            .with_context(|| format!("Failed to clear state for {}", self.config.symbol))?;

        let levels = self.config.level_sizing().effective_levels(self.config.initial_capital);
        let connected = self.state.is_connected;
        self.state = BotState::new(self.config.initial_capital, levels);
        self.state.is_connected = connected;

        self.note(
            Utc::now(),
            AuditAction::System,
            format!("Ledger reset to {}", self.config.initial_capital),
        );
        self.persist().await;

        Ok(self.state.clone())
    }

    // ==================== Tick Stages ====================

    async fn process_exits(&mut self, price: Decimal, now: DateTime<Utc>) {
        for lot_id in self.state.fifo_lot_ids() {
            let reason = match self.state.lot(lot_id) {
                Some(lot) => RiskGovernor::exit_reason(lot, &self.config, price),
                None => None,
            };
            if let Some(reason) = reason {
                self.execute_sell(lot_id, price, now, reason.label()).await;
            }
        }
    }

    async fn process_entries(&mut self, price: Decimal, now: DateTime<Utc>) {
        if !self.config.enable_dca {
            return;
        }
        if self.state.positions.len() >= self.state.effective_max_levels {
            return;
        }

        // Dip is measured from the most recent entry, not the lowest one
        let should_buy = match self.state.latest_lot() {
            None => true,
            Some(last) => {
                let threshold = last.entry_price
                    * (Decimal::ONE - self.config.dip_trigger_pct / Decimal::ONE_HUNDRED);
                price <= threshold
            }
        };
        if !should_buy {
            return;
        }

        let order_amount = self.state.balance * self.config.allocation_rate;
        let min_notional = self.effective_min_notional().await;

        if order_amount < min_notional {
            self.log(
                now,
                AuditAction::Skip,
                price,
                Decimal::ZERO,
                order_amount,
                format!("Order below min notional ({})", min_notional),
            );
            return;
        }
        if self.state.balance < order_amount {
            return;
        }

        self.execute_buy(price, order_amount, now).await;
    }

    async fn effective_min_notional(&self) -> Decimal {
        let venue_min = match self.exchange.min_notional(&self.config.symbol).await {
            Ok(min) => min,
            Err(e) => {
                warn!(error = %e, "Failed to fetch venue min notional, using configured minimum");
                Decimal::ZERO
            }
        };
        self.config.min_notional.max(venue_min)
    }

    async fn execute_buy(&mut self, price: Decimal, amount: Decimal, now: DateTime<Utc>) {
        let fill = match self.exchange.market_buy(&self.config.symbol, amount, price).await {
            Ok(fill) => fill,
            Err(e) => {
                self.log(
                    now,
                    AuditAction::Error,
                    price,
                    Decimal::ZERO,
                    amount,
                    format!("Buy failed: {}", e),
                );
                return;
            }
        };

        if fill.quantity <= Decimal::ZERO
            || fill.fill_price <= Decimal::ZERO
            || fill.quote_spent <= Decimal::ZERO
        {
            self.log(
                now,
                AuditAction::Error,
                price,
                fill.quantity,
                amount,
                format!("Buy failed: empty fill for order {}", fill.order_id),
            );
            return;
        }

        let lot = Lot::open(
            &self.config.symbol,
            fill.order_id,
            now,
            fill.fill_price,
            fill.quantity,
            fill.quote_spent,
            self.config.take_profit_pct,
            self.config.stop_loss(),
        );

        match self.state.open_lot(lot) {
            Ok(()) => self.log(
                now,
                AuditAction::Buy,
                fill.fill_price,
                fill.quantity,
                fill.quote_spent,
                "DCA Buy Executed",
            ),
            Err(e) => self.log(
                now,
                AuditAction::Error,
                fill.fill_price,
                fill.quantity,
                fill.quote_spent,
                format!("Buy filled but not booked: {}", e),
            ),
        }
    }

    async fn execute_sell(
        &mut self,
        lot_id: Uuid,
        price: Decimal,
        now: DateTime<Utc>,
        label: &str,
    ) {
        let quantity = match self.state.lot(lot_id) {
            Some(lot) => lot.quantity,
            None => return,
        };

        let fill = match self.exchange.market_sell(&self.config.symbol, quantity, price).await {
            Ok(fill) => fill,
            Err(e) => {
                self.log(
                    now,
                    AuditAction::Error,
                    price,
                    quantity,
                    Decimal::ZERO,
                    format!("Sell failed: {}", e),
                );
                return;
            }
        };

        let closed = self
            .state
            .close_lot(lot_id, now, fill.fill_price, fill.proceeds, fill.order_id)
            .map(|lot| lot.realized_pnl().unwrap_or_default());

        match closed {
            Ok(pnl) => self.log(
                now,
                AuditAction::Sell,
                fill.fill_price,
                quantity,
                fill.proceeds,
                format!("{}. Position Closed (PnL: ${:.2})", label, pnl),
            ),
            Err(e) => self.log(
                now,
                AuditAction::Error,
                fill.fill_price,
                quantity,
                fill.proceeds,
                format!("Sell filled but not booked: {}", e),
            ),
        }
    }

    async fn close_all(&mut self, reason: HaltReason, price: Decimal, now: DateTime<Utc>) {
        self.note(now, AuditAction::System, format!("Emergency Closure: {}", reason));

        for lot_id in self.state.fifo_lot_ids() {
            self.execute_sell(lot_id, price, now, "Emergency closure").await;
        }
    }

    // ==================== Helpers ====================

    async fn authenticate(&mut self, now: DateTime<Utc>) {
        let connected = match self.exchange.authenticate(&self.config.credentials).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(exchange = %self.exchange.provider(), error = %e, "Authentication error");
                false
            }
        };

        if !connected {
            self.note(
                now,
                AuditAction::Error,
                format!("Could not connect to {}", self.exchange.provider()),
            );
        }
        self.state.is_connected = connected;
    }

    fn roll_daily_loss(&mut self, now: DateTime<Utc>) {
        if self.config.daily_loss_reset != DailyLossReset::UtcMidnight {
            return;
        }

        let today = now.date_naive();
        match self.state.daily_loss_day {
            Some(day) if day == today => {}
            Some(_) => {
                let previous = self.state.daily_loss;
                self.state.daily_loss = Decimal::ZERO;
                self.state.daily_loss_day = Some(today);
                if previous > Decimal::ZERO {
                    self.log(
                        now,
                        AuditAction::System,
                        Decimal::ZERO,
                        Decimal::ZERO,
                        previous,
                        format!("Daily loss counter reset (was {:.2})", previous),
                    );
                }
            }
            None => self.state.daily_loss_day = Some(today),
        }
    }

    /// Event with no price, quantity or amount attached.
    fn note(&mut self, now: DateTime<Utc>, action: AuditAction, message: impl Into<String>) {
        self.log(now, action, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, message);
    }

    fn log(
        &mut self,
        now: DateTime<Utc>,
        action: AuditAction,
        price: Decimal,
        quantity: Decimal,
        amount: Decimal,
        message: impl Into<String>,
    ) {
        self.state
            .logs
            .record(now, &self.config.symbol, action, price, quantity, amount, message);
    }

    async fn persist(&self) {
        if let Err(e) = self.store.save(&self.config.symbol, &self.state).await {
            warn!(symbol = %self.config.symbol, error = %e, "Failed to persist bot state");
        }
    }
}
