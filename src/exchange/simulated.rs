//! Paper venue: instantaneous market fills at the reference price.
//!
//! Slippage and fees default to zero so lot economics match the quoted
//! price exactly; both can be switched on for more pessimistic paper runs.
//! Failure injection lets tests and dry runs exercise the engine's error
//! paths without a network.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::{ApiCredentials, BuyFill, ExchangeError, ExchangePort, ExchangeProvider, SellFill};

/// Switches shared between a simulated venue and whoever drives it.
#[derive(Debug, Default)]
pub struct SimulatedControls {
    pub fail_buys: AtomicBool,
    pub fail_sells: AtomicBool,
    pub reject_auth: AtomicBool,
}

impl SimulatedControls {
    pub fn set_fail_buys(&self, fail: bool) {
        self.fail_buys.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_sells(&self, fail: bool) {
        self.fail_sells.store(fail, Ordering::SeqCst);
    }

    pub fn set_reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }
}

/// In-process exchange used for paper trading.
pub struct SimulatedExchange {
    min_notional: Decimal,
    slippage: Decimal,
    fee_rate: Decimal,
    latency: Option<Duration>,
    /// Last price seen on an order, served by `last_price`
    mark: RwLock<Decimal>,
    next_order: AtomicU64,
    controls: Arc<SimulatedControls>,
}

impl Default for SimulatedExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedExchange {
    pub fn new() -> Self {
        Self {
            min_notional: dec!(5),   // Typical spot minimum
            slippage: Decimal::ZERO,
            fee_rate: Decimal::ZERO,
            latency: None,
            mark: RwLock::new(dec!(50000)), // BTC-ish starting mark
            next_order: AtomicU64::new(1),
            controls: Arc::new(SimulatedControls::default()),
        }
    }

    pub fn with_min_notional(mut self, min_notional: Decimal) -> Self {
        self.min_notional = min_notional;
        self
    }

    /// Adverse price move applied to every fill (0.0 to 1.0).
    pub fn with_slippage(mut self, slippage: Decimal) -> Self {
        self.slippage = slippage;
        self
    }

    /// Fee charged on the quote side of every fill (0.0 to 1.0).
    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    /// Delay every order call, to mimic a round trip.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_mark_price(self, price: Decimal) -> Self {
        if let Ok(mut mark) = self.mark.write() {
            *mark = price;
        }
        self
    }

    /// Handle for toggling failures after the venue has been boxed.
    pub fn controls(&self) -> Arc<SimulatedControls> {
        Arc::clone(&self.controls)
    }

    fn next_order_id(&self) -> String {
        let n = self.next_order.fetch_add(1, Ordering::SeqCst);
        format!("SIM-{:06}", n)
    }

    fn set_mark(&self, price: Decimal) {
        if let Ok(mut mark) = self.mark.write() {
            *mark = price;
        }
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ExchangePort for SimulatedExchange {
    fn provider(&self) -> ExchangeProvider {
        ExchangeProvider::Simulated
    }

    async fn authenticate(&mut self, _credentials: &ApiCredentials) -> Result<bool, ExchangeError> {
        Ok(!self.controls.reject_auth.load(Ordering::SeqCst))
    }

    async fn market_buy(
        &self,
        _symbol: &str,
        quote_amount: Decimal,
        reference_price: Decimal,
    ) -> Result<BuyFill, ExchangeError> {
        self.simulate_latency().await;

        if self.controls.fail_buys.load(Ordering::SeqCst) {
            return Err(ExchangeError::Simulated("buy rejected by venue".to_string()));
        }
        if reference_price <= Decimal::ZERO {
            return Err(ExchangeError::Rejected(format!(
                "invalid reference price {}",
                reference_price
            )));
        }
        if quote_amount < self.min_notional {
            return Err(ExchangeError::Rejected(format!(
                "order value {} below minimum notional {}",
                quote_amount, self.min_notional
            )));
        }

        let fill_price = reference_price * (Decimal::ONE + self.slippage);
        let fee = quote_amount * self.fee_rate;
        let quantity = (quote_amount - fee) / fill_price;
        self.set_mark(reference_price);

        Ok(BuyFill {
            order_id: self.next_order_id(),
            quantity,
            fill_price,
            quote_spent: quote_amount,
        })
    }

    async fn market_sell(
        &self,
        _symbol: &str,
        quantity: Decimal,
        reference_price: Decimal,
    ) -> Result<SellFill, ExchangeError> {
        self.simulate_latency().await;

        if self.controls.fail_sells.load(Ordering::SeqCst) {
            return Err(ExchangeError::Simulated("sell rejected by venue".to_string()));
        }
        if reference_price <= Decimal::ZERO {
            return Err(ExchangeError::Rejected(format!(
                "invalid reference price {}",
                reference_price
            )));
        }

        let fill_price = reference_price * (Decimal::ONE - self.slippage);
        let gross = quantity * fill_price;
        let proceeds = gross - gross * self.fee_rate;
        self.set_mark(reference_price);

        Ok(SellFill {
            order_id: self.next_order_id(),
            proceeds,
            fill_price,
        })
    }

    async fn min_notional(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.min_notional)
    }

    async fn last_price(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
        self.mark
            .read()
            .map(|mark| *mark)
            .map_err(|_| ExchangeError::Simulated("mark price lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fills_at_reference_price() {
        let venue = SimulatedExchange::new();
        let buy = venue.market_buy("BTCUSDT", dec!(5), dec!(100)).await.unwrap();

        assert_eq!(buy.fill_price, dec!(100));
        assert_eq!(buy.quantity, dec!(0.05));
        assert_eq!(buy.quote_spent, dec!(5));
        assert_eq!(buy.order_id, "SIM-000001");

        let sell = venue.market_sell("BTCUSDT", dec!(0.05), dec!(102)).await.unwrap();
        assert_eq!(sell.proceeds, dec!(5.1));
        assert_eq!(sell.order_id, "SIM-000002");
        assert_eq!(venue.last_price("BTCUSDT").await.unwrap(), dec!(102));
    }

    #[tokio::test]
    async fn test_slippage_and_fees() {
        let venue = SimulatedExchange::new()
            .with_slippage(dec!(0.01))
            .with_fee_rate(dec!(0.001));

        let buy = venue.market_buy("BTCUSDT", dec!(101), dec!(100)).await.unwrap();
        assert_eq!(buy.fill_price, dec!(101));
        // 0.1% of the quote goes to fees
        assert_eq!(buy.quantity, dec!(100.899) / dec!(101));

        let sell = venue.market_sell("BTCUSDT", dec!(1), dec!(100)).await.unwrap();
        assert_eq!(sell.fill_price, dec!(99));
        assert_eq!(sell.proceeds, dec!(99) - dec!(0.099));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let mut venue = SimulatedExchange::new();
        let controls = venue.controls();

        controls.set_fail_buys(true);
        assert!(venue.market_buy("BTCUSDT", dec!(10), dec!(100)).await.is_err());
        controls.set_fail_buys(false);
        assert!(venue.market_buy("BTCUSDT", dec!(10), dec!(100)).await.is_ok());

        controls.set_fail_sells(true);
        assert!(venue.market_sell("BTCUSDT", dec!(1), dec!(100)).await.is_err());

        assert!(venue.authenticate(&ApiCredentials::default()).await.unwrap());
        controls.set_reject_auth(true);
        assert!(!venue.authenticate(&ApiCredentials::default()).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_below_min_notional() {
        let venue = SimulatedExchange::new().with_min_notional(dec!(10));
        let result = venue.market_buy("BTCUSDT", dec!(9.99), dec!(100)).await;
        assert!(matches!(result, Err(ExchangeError::Rejected(_))));
        assert_eq!(venue.min_notional("BTCUSDT").await.unwrap(), dec!(10));
    }
}
