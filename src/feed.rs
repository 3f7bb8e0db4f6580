//! Price feeds that drive the engine's ticks.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

use crate::exchange::ExchangePort;

/// Per-step volatility of the random walk (0.3%)
pub const RANDOM_WALK_VOLATILITY: f64 = 0.003;

/// Source of tick prices.
#[async_trait]
pub trait PriceFeed: Send {
    fn name(&self) -> &'static str;

    /// Next price, or `None` once the feed is exhausted.
    async fn next_price(&mut self) -> Result<Option<Decimal>>;
}

/// Polls the venue's last traded price.
pub struct ExchangeFeed {
    exchange: Box<dyn ExchangePort>,
    symbol: String,
}

impl ExchangeFeed {
    pub fn new(exchange: Box<dyn ExchangePort>, symbol: &str) -> Self {
        Self {
            exchange,
            symbol: symbol.to_string(),
        }
    }
}

#[async_trait]
impl PriceFeed for ExchangeFeed {
    fn name(&self) -> &'static str {
        "exchange"
    }

    async fn next_price(&mut self) -> Result<Option<Decimal>> {
        let price = self
            .exchange
            .last_price(&self.symbol)
            .await
            .with_context(|| {
                format!(
                    "Failed to fetch {} price from {}",
                    self.symbol,
                    self.exchange.provider()
                )
            })?;
        Ok(Some(price))
    }
}

/// Synthetic market: each step moves the price by up to ±0.15%.
pub struct RandomWalkFeed {
    price: f64,
    volatility: f64,
    rng: StdRng,
}

impl RandomWalkFeed {
    pub fn new(start_price: f64) -> Self {
        Self::with_rng(start_price, StdRng::from_entropy())
    }

    /// Reproducible walk.
    pub fn seeded(start_price: f64, seed: u64) -> Self {
        Self::with_rng(start_price, StdRng::seed_from_u64(seed))
    }

    fn with_rng(start_price: f64, rng: StdRng) -> Self {
        Self {
            price: start_price,
            volatility: RANDOM_WALK_VOLATILITY,
            rng,
        }
    }
}

#[async_trait]
impl PriceFeed for RandomWalkFeed {
    fn name(&self) -> &'static str {
        "random"
    }

    async fn next_price(&mut self) -> Result<Option<Decimal>> {
        let change = self.price * self.volatility * (self.rng.gen::<f64>() - 0.5);
        self.price += change;

        // Rejects NaN and infinity
        let price = Decimal::try_from(self.price)
            .map_err(|e| anyhow!("Random walk produced an invalid price {}: {}", self.price, e))?;
        Ok(Some(price.round_dp(2)))
    }
}

/// Replays prices from a text file, one per line.
///
/// Lines are either `price` or `timestamp,price`; blank lines and lines
/// starting with `#` are ignored.
pub struct FileReplayFeed {
    prices: std::vec::IntoIter<Decimal>,
}

impl FileReplayFeed {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read price file {}", path.display()))?;
        Ok(Self::new(parse_prices(&raw)?))
    }

    pub fn new(prices: Vec<Decimal>) -> Self {
        Self {
            prices: prices.into_iter(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.prices.len()
    }
}

#[async_trait]
impl PriceFeed for FileReplayFeed {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn next_price(&mut self) -> Result<Option<Decimal>> {
        Ok(self.prices.next())
    }
}

/// Parse a price file.
pub fn parse_prices(raw: &str) -> Result<Vec<Decimal>> {
    let mut prices = Vec::new();

    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let field = line.rsplit(',').next().unwrap_or(line).trim();
        let price: Decimal = field
            .parse()
            .with_context(|| format!("Line {}: invalid price {:?}", index + 1, field))?;
        prices.push(price);
    }

    Ok(prices)
}
