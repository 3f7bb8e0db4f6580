//! Exchange connectivity: the narrow port the engine trades through, plus one
//! implementation per venue.

mod binance;
mod simulated;

pub use binance::BinanceClient;
pub use simulated::{SimulatedControls, SimulatedExchange};

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Venue selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeProvider {
    #[default]
    Simulated,
    Binance,
    Bybit,
    Kucoin,
    Okx,
    Coinbase,
    Kraken,
}

impl ExchangeProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeProvider::Simulated => "SIMULATED",
            ExchangeProvider::Binance => "BINANCE",
            ExchangeProvider::Bybit => "BYBIT",
            ExchangeProvider::Kucoin => "KUCOIN",
            ExchangeProvider::Okx => "OKX",
            ExchangeProvider::Coinbase => "COINBASE",
            ExchangeProvider::Kraken => "KRAKEN",
        }
    }

    /// Whether orders on this venue move real funds.
    pub fn is_real_venue(&self) -> bool {
        !matches!(self, ExchangeProvider::Simulated)
    }
}

impl fmt::Display for ExchangeProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "simulated" | "sim" | "paper" => Ok(ExchangeProvider::Simulated),
            "binance" => Ok(ExchangeProvider::Binance),
            "bybit" => Ok(ExchangeProvider::Bybit),
            "kucoin" => Ok(ExchangeProvider::Kucoin),
            "okx" => Ok(ExchangeProvider::Okx),
            "coinbase" => Ok(ExchangeProvider::Coinbase),
            "kraken" => Ok(ExchangeProvider::Kraken),
            other => Err(format!("unknown exchange: {}", other)),
        }
    }
}

/// API credentials for a venue.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

impl ApiCredentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            passphrase: None,
        }
    }

    /// Both key and secret are present.
    pub fn is_complete(&self) -> bool {
        !self.api_key.trim().is_empty() && !self.api_secret.trim().is_empty()
    }

    /// Key with everything but the last four characters hidden.
    pub fn masked_key(&self) -> String {
        mask(&self.api_key)
    }
}

// Never print secrets, even in debug output
impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &mask(&self.api_key))
            .field("api_secret", &mask(&self.api_secret))
            .field("passphrase", &self.passphrase.as_deref().map(mask))
            .finish()
    }
}

fn mask(value: &str) -> String {
    if value.is_empty() {
        return "<unset>".to_string();
    }
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}

/// Result of a filled market buy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuyFill {
    pub order_id: String,
    /// Base-asset quantity received
    pub quantity: Decimal,
    /// Average fill price
    pub fill_price: Decimal,
    /// Quote currency actually spent
    pub quote_spent: Decimal,
}

/// Result of a filled market sell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SellFill {
    pub order_id: String,
    /// Quote currency received
    pub proceeds: Decimal,
    /// Average fill price
    pub fill_price: Decimal,
}

/// Errors surfaced by an exchange adapter. All are recoverable from the
/// engine's point of view.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("http error: {0}")]
    Http(String),
    #[error("unexpected http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("exchange {0} is not supported")]
    Unsupported(ExchangeProvider),
    #[error("simulated failure: {0}")]
    Simulated(String),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        ExchangeError::Http(err.to_string())
    }
}

/// Capability interface for one trading venue.
///
/// Lot economics are always computed from the returned fill, never from the
/// reference price passed in.
#[async_trait]
pub trait ExchangePort: Send + Sync {
    fn provider(&self) -> ExchangeProvider;

    /// Verify credentials. `Ok(false)` means the venue answered but refused them.
    async fn authenticate(&mut self, credentials: &ApiCredentials) -> Result<bool, ExchangeError>;

    /// Spend `quote_amount` of the quote currency at market.
    async fn market_buy(
        &self,
        symbol: &str,
        quote_amount: Decimal,
        reference_price: Decimal,
    ) -> Result<BuyFill, ExchangeError>;

    /// Sell `quantity` of the base asset at market.
    async fn market_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        reference_price: Decimal,
    ) -> Result<SellFill, ExchangeError>;

    /// Smallest order value the venue accepts for `symbol`.
    async fn min_notional(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Last traded price for `symbol`.
    async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;
}

/// Build the adapter for a venue.
pub fn connect(provider: ExchangeProvider) -> Result<Box<dyn ExchangePort>, ExchangeError> {
    match provider {
        ExchangeProvider::Simulated => Ok(Box::new(SimulatedExchange::new())),
        ExchangeProvider::Binance => Ok(Box::new(BinanceClient::new()?)),
        other => Err(ExchangeError::Unsupported(other)),
    }
}
