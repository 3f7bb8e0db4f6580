//! Ladder configuration.

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exchange::{ApiCredentials, ExchangeProvider};

/// Environment variables holding venue credentials.
pub const ENV_API_KEY: &str = "LADDER_API_KEY";
pub const ENV_API_SECRET: &str = "LADDER_API_SECRET";
pub const ENV_API_PASSPHRASE: &str = "LADDER_API_PASSPHRASE";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
    #[error("Live trading on {0} requires API credentials")]
    MissingCredentials(ExchangeProvider),
    #[error("Exchange {0} is not supported")]
    UnsupportedExchange(ExchangeProvider),
}

/// When the accumulated daily loss counter goes back to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DailyLossReset {
    /// Counter only grows; cleared by resetting the bot
    #[default]
    Never,
    /// Cleared on the first tick of each UTC day
    UtcMidnight,
}

/// How the ladder's depth is capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelSizing {
    /// Constant number of open lots
    Fixed(u32),
    /// floor(equity × pct / 100) open lots, never fewer than one
    Dynamic { equity_pct: Decimal },
}

impl LevelSizing {
    /// Maximum number of open lots at the given equity.
    pub fn effective_levels(&self, equity: Decimal) -> usize {
        match self {
            LevelSizing::Fixed(levels) => *levels as usize,
            LevelSizing::Dynamic { equity_pct } => {
                let raw = (equity * *equity_pct / Decimal::ONE_HUNDRED).floor();
                if raw < Decimal::ONE {
                    1
                } else {
                    raw.to_usize().unwrap_or(usize::MAX)
                }
            }
        }
    }
}

/// Configuration for the ladder strategy and its risk controls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LadderConfig {
    /// Quote currency the ledger starts with
    pub initial_capital: Decimal,

    /// Fraction of the current balance spent per entry (0.0 to 1.0)
    pub allocation_rate: Decimal,

    /// Drop below the latest entry that triggers the next rung, in percent
    pub dip_trigger_pct: Decimal,

    /// Gain over the fill price at which a lot is sold, in percent
    pub take_profit_pct: Decimal,

    /// Loss under the fill price at which a lot is cut, in percent
    pub stop_loss_pct: Decimal,

    pub enable_stop_loss: bool,

    /// Fixed cap on open lots (ignored when dynamic sizing is on)
    pub max_dca_levels: u32,

    /// Derive the cap from equity instead of `max_dca_levels`
    pub use_dynamic_levels: bool,

    /// Share of equity, in percent, that becomes the dynamic cap
    pub levels_equity_pct: Decimal,

    /// Smallest order value we are willing to send
    pub min_notional: Decimal,

    /// Traded pair (e.g., "BTCUSDT")
    pub symbol: String,

    /// Open new rungs at all
    pub enable_dca: bool,

    pub enable_global_drawdown: bool,

    /// Peak-to-current equity drop, in percent, that liquidates everything
    pub max_drawdown_pct: Decimal,

    /// Realized losses after which everything is liquidated
    pub max_daily_loss: Option<Decimal>,

    pub daily_loss_reset: DailyLossReset,

    /// Advisory polling interval for the runner
    pub polling_interval_ms: u64,

    pub exchange: ExchangeProvider,

    /// Trade real funds; requires a connected venue
    pub live_mode: bool,

    /// Never written out; loaded from the environment
    #[serde(skip_serializing)]
    pub credentials: ApiCredentials,

    /// Hard kill switch: ticks do nothing while set
    pub emergency_stop: bool,
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            initial_capital: dec!(100),        // $100 starting balance
            allocation_rate: dec!(0.05),       // 5% of balance per rung
            dip_trigger_pct: dec!(2),          // Next rung 2% under the last
            take_profit_pct: dec!(2),          // Sell each lot at +2%
            stop_loss_pct: dec!(10),           // Cut each lot at -10%
            enable_stop_loss: true,
            max_dca_levels: 20,
            use_dynamic_levels: false,
            levels_equity_pct: dec!(20),
            min_notional: dec!(5),             // Typical spot minimum
            symbol: "BTCUSDT".to_string(),
            enable_dca: true,
            enable_global_drawdown: true,
            max_drawdown_pct: dec!(20),        // Liquidate at 20% drawdown
            max_daily_loss: None,
            daily_loss_reset: DailyLossReset::Never,
            polling_interval_ms: 1000,
            exchange: ExchangeProvider::Simulated,
            live_mode: false,
            credentials: ApiCredentials::default(),
            emergency_stop: false,
        }
    }
}

impl LadderConfig {
    /// Read a JSON config file. Missing fields fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Fill credentials from `LADDER_API_KEY` / `LADDER_API_SECRET` /
    /// `LADDER_API_PASSPHRASE` when set.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(ENV_API_KEY) {
            self.credentials.api_key = key;
        }
        if let Ok(secret) = std::env::var(ENV_API_SECRET) {
            self.credentials.api_secret = secret;
        }
        if let Ok(passphrase) = std::env::var(ENV_API_PASSPHRASE) {
            self.credentials.passphrase = Some(passphrase);
        }
    }

    pub fn level_sizing(&self) -> LevelSizing {
        if self.use_dynamic_levels {
            LevelSizing::Dynamic {
                equity_pct: self.levels_equity_pct,
            }
        } else {
            LevelSizing::Fixed(self.max_dca_levels)
        }
    }

    /// Stop-loss percent to stamp on new lots, if stop-loss is on.
    pub fn stop_loss(&self) -> Option<Decimal> {
        self.enable_stop_loss.then_some(self.stop_loss_pct)
    }

    /// Check every range before the config is allowed anywhere near the engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &str, rule: &str, value: impl std::fmt::Display) -> ConfigError {
            ConfigError::InvalidValue(field.to_string(), format!("{}, got {}", rule, value))
        }

        let zero = Decimal::ZERO;
        let hundred = Decimal::ONE_HUNDRED;

        if self.initial_capital <= zero {
            return Err(invalid("initial_capital", "must be positive", self.initial_capital));
        }
        if self.allocation_rate <= zero || self.allocation_rate > Decimal::ONE {
            return Err(invalid("allocation_rate", "must be in (0, 1]", self.allocation_rate));
        }
        if self.dip_trigger_pct < zero {
            return Err(invalid("dip_trigger_pct", "must not be negative", self.dip_trigger_pct));
        }
        if self.take_profit_pct <= zero {
            return Err(invalid("take_profit_pct", "must be positive", self.take_profit_pct));
        }
        if self.stop_loss_pct <= zero || self.stop_loss_pct >= hundred {
            return Err(invalid("stop_loss_pct", "must be in (0, 100)", self.stop_loss_pct));
        }
        if self.max_dca_levels == 0 {
            return Err(invalid("max_dca_levels", "must be at least 1", self.max_dca_levels));
        }
        if self.levels_equity_pct <= zero {
            return Err(invalid("levels_equity_pct", "must be positive", self.levels_equity_pct));
        }
        if self.min_notional < zero {
            return Err(invalid("min_notional", "must not be negative", self.min_notional));
        }
        if self.max_drawdown_pct <= zero || self.max_drawdown_pct > hundred {
            return Err(invalid("max_drawdown_pct", "must be in (0, 100]", self.max_drawdown_pct));
        }
        if let Some(cap) = self.max_daily_loss {
            if cap <= zero {
                return Err(invalid("max_daily_loss", "must be positive when set", cap));
            }
        }
        if self.polling_interval_ms == 0 {
            return Err(invalid("polling_interval_ms", "must be positive", 0));
        }
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "symbol".to_string(),
                "must not be empty".to_string(),
            ));
        }
        if self.live_mode && self.exchange.is_real_venue() && !self.credentials.is_complete() {
            return Err(ConfigError::MissingCredentials(self.exchange));
        }

        Ok(())
    }

    /// Human-readable summary with secrets masked.
    pub fn summary(&self) -> String {
        let levels = match self.level_sizing() {
            LevelSizing::Fixed(n) => format!("{} (fixed)", n),
            LevelSizing::Dynamic { equity_pct } => format!("{}% of equity (dynamic)", equity_pct),
        };
        let stop = match self.stop_loss() {
            Some(pct) => format!("{}%", pct),
            None => "off".to_string(),
        };
        let drawdown = if self.enable_global_drawdown {
            format!("{}%", self.max_drawdown_pct)
        } else {
            "off".to_string()
        };
        let daily = match self.max_daily_loss {
            Some(cap) => format!("${} ({:?} reset)", cap, self.daily_loss_reset),
            None => "none".to_string(),
        };

        let mut out = String::new();
        out.push_str(&format!("Symbol:          {}\n", self.symbol));
        let mode = if self.live_mode { "LIVE" } else { "paper" };
        out.push_str(&format!("Exchange:        {} ({})\n", self.exchange, mode));
        out.push_str(&format!("API Key:         {}\n", self.credentials.masked_key()));
        out.push_str(&format!("Initial Capital: ${}\n", self.initial_capital));
        out.push_str(&format!(
            "Allocation:      {}% of balance\n",
            self.allocation_rate * Decimal::ONE_HUNDRED
        ));
        out.push_str(&format!("Dip Trigger:     {}%\n", self.dip_trigger_pct));
        out.push_str(&format!("Take Profit:     {}%\n", self.take_profit_pct));
        out.push_str(&format!("Stop Loss:       {}\n", stop));
        out.push_str(&format!("Max Levels:      {}\n", levels));
        out.push_str(&format!("Min Notional:    ${}\n", self.min_notional));
        out.push_str(&format!("DCA Entries:     {}\n", if self.enable_dca { "on" } else { "off" }));
        out.push_str(&format!("Max Drawdown:    {}\n", drawdown));
        out.push_str(&format!("Daily Loss Cap:  {}\n", daily));
        out.push_str(&format!("Poll Interval:   {}ms\n", self.polling_interval_ms));
        out.push_str(&format!("Emergency Stop:  {}", self.emergency_stop));
        out
    }
}
