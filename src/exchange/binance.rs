//! Binance spot REST client.
//!
//! Handles:
//! - HMAC-SHA256 request signing (`X-MBX-APIKEY` header + `signature` param)
//! - Market orders sized by quote amount (buys) or base quantity (sells)
//! - Exchange-info filters (minimum notional, lot step size)
//! - Fill accounting net of commission, so a lot records what the account holds
//! - Ticker price lookups, retried with exponential backoff

use std::time::Duration;

use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use super::{ApiCredentials, BuyFill, ExchangeError, ExchangePort, ExchangeProvider, SellFill};

type HmacSha256 = Hmac<Sha256>;

/// Spot API base URL
pub const BINANCE_URL: &str = "https://api.binance.com";

/// Window (ms) in which a signed request stays valid
const RECV_WINDOW_MS: u64 = 5000;

/// Decimals Binance accepts on `quoteOrderQty`
const QUOTE_PRECISION: u32 = 8;

/// Error body returned on rejected requests
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

/// Subset of an order response with `newOrderRespType=FULL`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    status: String,
    executed_qty: Decimal,
    cummulative_quote_qty: Decimal,
    #[serde(default)]
    fills: Vec<OrderFill>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderFill {
    commission: Decimal,
    commission_asset: String,
}

impl OrderResponse {
    /// Total commission charged in `asset`.
    fn commission_in(&self, asset: &str) -> Decimal {
        self.fills
            .iter()
            .filter(|f| f.commission_asset.eq_ignore_ascii_case(asset))
            .map(|f| f.commission)
            .sum()
    }

    fn average_price(&self) -> Decimal {
        self.cummulative_quote_qty / self.executed_qty
    }
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    base_asset: String,
    quote_asset: String,
    filters: Vec<serde_json::Value>,
}

/// Trading filters relevant to market orders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolFilters {
    pub base_asset: String,
    pub quote_asset: String,
    pub min_notional: Decimal,
    pub step_size: Option<Decimal>,
}

impl SymbolFilters {
    fn from_info(info: &SymbolInfo) -> Self {
        let mut min_notional = Decimal::ZERO;
        let mut step_size = None;

        for filter in &info.filters {
            let kind = filter.get("filterType").and_then(|v| v.as_str());
            match kind {
                // NOTIONAL replaced MIN_NOTIONAL; accept either
                Some("NOTIONAL") | Some("MIN_NOTIONAL") => {
                    if let Some(value) = decimal_field(filter, "minNotional") {
                        min_notional = value;
                    }
                }
                Some("LOT_SIZE") => {
                    step_size = decimal_field(filter, "stepSize").filter(|s| !s.is_zero());
                }
                _ => {}
            }
        }

        Self {
            base_asset: info.base_asset.clone(),
            quote_asset: info.quote_asset.clone(),
            min_notional,
            step_size,
        }
    }

    /// Round a base quantity down to the lot step.
    pub fn round_quantity(&self, quantity: Decimal) -> Decimal {
        match self.step_size {
            Some(step) => (quantity / step).floor() * step,
            None => quantity,
        }
    }
}

fn decimal_field(value: &serde_json::Value, key: &str) -> Option<Decimal> {
    value.get(key)?.as_str()?.parse().ok()
}

/// Binance spot adapter.
pub struct BinanceClient {
    http: Client,
    base_url: String,
    credentials: Option<ApiCredentials>,
}

impl BinanceClient {
    pub fn new() -> Result<Self, ExchangeError> {
        Self::with_base_url(BINANCE_URL)
    }

    /// Point the client at another host (testnet, local mock).
    pub fn with_base_url(base_url: &str) -> Result<Self, ExchangeError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials: None,
        })
    }

    /// Fetch trading filters for a symbol.
    pub async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        let url = format!("{}/api/v3/exchangeInfo?symbol={}", self.base_url, symbol);
        let info: ExchangeInfo = self.get_with_retry(&url).await?;

        info.symbols
            .iter()
            .find(|s| s.symbol.eq_ignore_ascii_case(symbol))
            .map(SymbolFilters::from_info)
            .ok_or_else(|| ExchangeError::Parse(format!("symbol {} not in exchange info", symbol)))
    }

    /// Send a signed market order.
    async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        sizing: (&str, Decimal),
    ) -> Result<OrderResponse, ExchangeError> {
        let credentials = self.require_credentials()?;
        let params = vec![
            ("symbol", symbol.to_uppercase()),
            ("side", side.to_string()),
            ("type", "MARKET".to_string()),
            (sizing.0, sizing.1.normalize().to_string()),
            ("newOrderRespType", "FULL".to_string()),
        ];
        let query = signed_query(&params, &credentials.api_secret, Utc::now().timestamp_millis())?;
        let url = format!("{}/api/v3/order?{}", self.base_url, query);

        debug!(symbol = %symbol, side = %side, "Submitting Binance market order");
        let resp = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &credentials.api_key)
            .send()
            .await?;

        let order: OrderResponse = read_response(resp).await?;
        if order.executed_qty.is_zero() {
            return Err(ExchangeError::Rejected(format!(
                "order {} not filled (status {})",
                order.order_id, order.status
            )));
        }
        Ok(order)
    }

    fn require_credentials(&self) -> Result<&ApiCredentials, ExchangeError> {
        self.credentials
            .as_ref()
            .filter(|c| c.is_complete())
            .ok_or_else(|| ExchangeError::Auth("no API credentials configured".to_string()))
    }

    /// Public GET, retried on transport errors, 429s and 5xx.
    async fn get_with_retry<T: DeserializeOwned + Send>(
        &self,
        url: &str,
    ) -> Result<T, ExchangeError> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        retry(backoff, || async {
            let resp = self
                .http
                .get(url)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(ExchangeError::Http(e.to_string())))?;

            let status = resp.status();
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(backoff::Error::transient(ExchangeError::HttpStatus {
                    status: status.as_u16(),
                    body: "retryable".to_string(),
                }));
            }

            read_response(resp).await.map_err(backoff::Error::permanent)
        })
        .await
    }
}

#[async_trait]
impl ExchangePort for BinanceClient {
    fn provider(&self) -> ExchangeProvider {
        ExchangeProvider::Binance
    }

    async fn authenticate(&mut self, credentials: &ApiCredentials) -> Result<bool, ExchangeError> {
        if !credentials.is_complete() {
            self.credentials = None;
            return Ok(false);
        }

        let query = signed_query(&[], &credentials.api_secret, Utc::now().timestamp_millis())?;
        let url = format!("{}/api/v3/account?{}", self.base_url, query);
        let resp = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &credentials.api_key)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            self.credentials = None;
            return Ok(false);
        }
        read_response::<serde_json::Value>(resp).await?;

        self.credentials = Some(credentials.clone());
        Ok(true)
    }

    async fn market_buy(
        &self,
        symbol: &str,
        quote_amount: Decimal,
        _reference_price: Decimal,
    ) -> Result<BuyFill, ExchangeError> {
        let filters = self.symbol_filters(symbol).await?;
        let quote = quote_amount.round_dp_with_strategy(QUOTE_PRECISION, RoundingStrategy::ToZero);
        let order = self.place_market_order(symbol, "BUY", ("quoteOrderQty", quote)).await?;

        Ok(buy_fill(&order, &filters))
    }

    async fn market_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        _reference_price: Decimal,
    ) -> Result<SellFill, ExchangeError> {
        let filters = self.symbol_filters(symbol).await?;

        // Lots are recorded on the step at buy time, so only a step change
        // on the venue can make this round
        let sellable = filters.round_quantity(quantity);
        if sellable != quantity {
            return Err(ExchangeError::Rejected(format!(
                "quantity {} is off the {} lot step",
                quantity,
                filters.step_size.unwrap_or_default()
            )));
        }

        let order = self.place_market_order(symbol, "SELL", ("quantity", quantity)).await?;

        Ok(sell_fill(&order, &filters))
    }

    async fn min_notional(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.symbol_filters(symbol).await?.min_notional)
    }

    async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let url = format!(
            "{}/api/v3/ticker/price?symbol={}",
            self.base_url,
            symbol.to_uppercase()
        );
        let ticker: TickerPrice = self.get_with_retry(&url).await?;
        Ok(ticker.price)
    }
}

/// Buy fill net of commission taken in the base asset, rounded down to the
/// lot step so the whole lot can be sold as recorded.
fn buy_fill(order: &OrderResponse, filters: &SymbolFilters) -> BuyFill {
    let net = order.executed_qty - order.commission_in(&filters.base_asset);
    let quantity = filters.round_quantity(net);
    if quantity != net {
        debug!(net = %net, quantity = %quantity, "Buy quantity rounded to lot step");
    }
    if quantity <= Decimal::ZERO {
        warn!(order_id = order.order_id, net = %net, "Buy fill smaller than one lot step");
    }

    BuyFill {
        order_id: order.order_id.to_string(),
        quantity,
        fill_price: order.average_price(),
        quote_spent: order.cummulative_quote_qty,
    }
}

/// Sell fill with quote-asset commission taken off the proceeds.
fn sell_fill(order: &OrderResponse, filters: &SymbolFilters) -> SellFill {
    SellFill {
        order_id: order.order_id.to_string(),
        proceeds: order.cummulative_quote_qty - order.commission_in(&filters.quote_asset),
        fill_price: order.average_price(),
    }
}

/// Decode a response, turning Binance error bodies into `Rejected`.
async fn read_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ExchangeError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        if let Ok(err) = serde_json::from_str::<ApiErrorBody>(&body) {
            return Err(ExchangeError::Rejected(format!("{} (code {})", err.msg, err.code)));
        }
        return Err(ExchangeError::HttpStatus {
            status: status.as_u16(),
            body,
        });
    }

    resp.json::<T>()
        .await
        .map_err(|e| ExchangeError::Parse(e.to_string()))
}

/// Build `params&recvWindow=..&timestamp=..&signature=..`.
fn signed_query(
    params: &[(&str, String)],
    secret: &str,
    timestamp_ms: i64,
) -> Result<String, ExchangeError> {
    let mut query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    query.push(format!("recvWindow={}", RECV_WINDOW_MS));
    query.push(format!("timestamp={}", timestamp_ms));
    let payload = query.join("&");

    let signature = hex::encode(hmac_sha256(secret.as_bytes(), payload.as_bytes())?);
    Ok(format!("{}&signature={}", payload, signature))
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<Vec<u8>, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ExchangeError::Auth(format!("unusable API secret: {}", e)))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_hmac_rfc4231_case_2() {
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_hmac_long_key_is_hashed() {
        let key = [0xaau8; 131];
        let message = b"Test Using Larger Than Block-Size Key - Hash Key First";
        let mac = hmac_sha256(&key, message).unwrap();
        assert_eq!(
            hex::encode(mac),
            "60e431591ee0b67f0d8a26aacbf5b77f8e0bc6213728c5140546040f0ee37f54"
        );
    }

    #[test]
    fn test_signed_query_layout() {
        let params = vec![("symbol", "BTCUSDT".to_string()), ("side", "BUY".to_string())];
        let query = signed_query(&params, "secret", 1_700_000_000_000).unwrap();

        let expected = "symbol=BTCUSDT&side=BUY&recvWindow=5000&timestamp=1700000000000&signature=";
        assert!(query.starts_with(expected));
        let signature = query.rsplit("signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn test_symbol_filters() {
        let filters: Vec<serde_json::Value> = serde_json::from_str(
            r#"[
                {"filterType": "PRICE_FILTER", "tickSize": "0.01000000"},
                {"filterType": "LOT_SIZE", "minQty": "0.00001000", "stepSize": "0.00001000"},
                {"filterType": "NOTIONAL", "minNotional": "5.00000000", "applyMinToMarket": true}
            ]"#,
        )
        .unwrap();

        let parsed = SymbolFilters::from_info(&SymbolInfo {
            symbol: "BTCUSDT".to_string(),
            base_asset: "BTC".to_string(),
            quote_asset: "USDT".to_string(),
            filters,
        });
        assert_eq!(parsed.min_notional, dec!(5));
        assert_eq!(parsed.round_quantity(dec!(0.000123456)), dec!(0.00012));
    }

    #[test]
    fn test_order_response_parsing() {
        let order: OrderResponse = serde_json::from_str(
            r#"{
                "symbol": "BTCUSDT",
                "orderId": 28,
                "status": "FILLED",
                "executedQty": "0.00010000",
                "cummulativeQuoteQty": "5.00000000",
                "fills": []
            }"#,
        )
        .unwrap();

        assert_eq!(order.order_id, 28);
        assert_eq!(order.average_price(), dec!(50000));
        assert!(order.fills.is_empty());
    }

    fn btc_filters() -> SymbolFilters {
        SymbolFilters {
            base_asset: "BTC".to_string(),
            quote_asset: "USDT".to_string(),
            min_notional: dec!(5),
            step_size: Some(dec!(0.00001)),
        }
    }

    #[test]
    fn test_buy_fill_nets_base_commission() {
        let order: OrderResponse = serde_json::from_str(
            r#"{
                "symbol": "BTCUSDT",
                "orderId": 41,
                "status": "FILLED",
                "executedQty": "0.00200000",
                "cummulativeQuoteQty": "100.00000000",
                "fills": [
                    {"price": "50000.00", "qty": "0.00120000", "commission": "0.00000120", "commissionAsset": "BTC"},
                    {"price": "50000.00", "qty": "0.00080000", "commission": "0.00000080", "commissionAsset": "BTC"}
                ]
            }"#,
        )
        .unwrap();

        let fill = buy_fill(&order, &btc_filters());
        // 0.002 - 0.000002 = 0.001998, floored to the 0.00001 step
        assert_eq!(fill.quantity, dec!(0.00199));
        assert_eq!(fill.quote_spent, dec!(100));
        assert_eq!(fill.fill_price, dec!(50000));
        assert_eq!(btc_filters().round_quantity(fill.quantity), fill.quantity);
    }

    #[test]
    fn test_bnb_commission_leaves_quantity_whole() {
        let order: OrderResponse = serde_json::from_str(
            r#"{
                "orderId": 42,
                "status": "FILLED",
                "executedQty": "0.00200000",
                "cummulativeQuoteQty": "100.00000000",
                "fills": [
                    {"price": "50000.00", "qty": "0.00200000", "commission": "0.00010000", "commissionAsset": "BNB"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(buy_fill(&order, &btc_filters()).quantity, dec!(0.002));
    }

    #[test]
    fn test_sell_fill_nets_quote_commission() {
        let order: OrderResponse = serde_json::from_str(
            r#"{
                "orderId": 43,
                "status": "FILLED",
                "executedQty": "0.00199000",
                "cummulativeQuoteQty": "101.49000000",
                "fills": [
                    {"price": "51000.00", "qty": "0.00199000", "commission": "0.10149000", "commissionAsset": "USDT"}
                ]
            }"#,
        )
        .unwrap();

        let fill = sell_fill(&order, &btc_filters());
        assert_eq!(fill.proceeds, dec!(101.38851));
        assert_eq!(fill.fill_price, dec!(51000));
    }

    #[tokio::test]
    async fn test_orders_require_credentials() {
        let client = BinanceClient::new().unwrap();
        let result = client.market_buy("BTCUSDT", dec!(10), dec!(50000)).await;
        assert!(matches!(result, Err(ExchangeError::Auth(_))));
    }
}
