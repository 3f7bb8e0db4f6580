//! Lot model: one DCA entry and its eventual matching exit.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stop-loss setting captured when the lot was opened.
///
/// `Disabled` means stop-loss was off at entry time, so the lot can only
/// leave the ladder through take-profit or a liquidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "price", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopLoss {
    Disabled,
    At(Decimal),
}

impl StopLoss {
    /// Stop price, if one was set.
    pub fn price(&self) -> Option<Decimal> {
        match self {
            StopLoss::Disabled => None,
            StopLoss::At(price) => Some(*price),
        }
    }
}

/// Lifecycle of a lot. A closed lot carries its exit economics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LotStatus {
    Open,
    Closed {
        exit_time: DateTime<Utc>,
        exit_price: Decimal,
        proceeds: Decimal,
        pnl: Decimal,
        exit_order_id: String,
    },
}

/// A single rung of the ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    /// Opaque identifier assigned at fill time
    pub id: Uuid,

    /// Traded symbol (e.g., "BTCUSDT")
    pub symbol: String,

    /// Venue order id of the entry fill
    pub entry_order_id: String,

    /// When the entry filled
    pub entry_time: DateTime<Utc>,

    /// Average fill price of the entry
    pub entry_price: Decimal,

    /// Base-asset quantity bought; fixed for the life of the lot
    pub quantity: Decimal,

    /// Quote currency spent on the entry
    pub invested: Decimal,

    /// Price at or above which the lot is sold
    pub tp_price: Decimal,

    /// Stop-loss captured at entry
    pub stop_loss: StopLoss,

    #[serde(flatten)]
    pub status: LotStatus,
}

impl Lot {
    /// Build an open lot from an entry fill.
    ///
    /// Take-profit and stop-loss are derived from the fill price, never from
    /// the price that triggered the order.
    pub fn open(
        symbol: &str,
        entry_order_id: String,
        entry_time: DateTime<Utc>,
        fill_price: Decimal,
        quantity: Decimal,
        invested: Decimal,
        take_profit_pct: Decimal,
        stop_loss_pct: Option<Decimal>,
    ) -> Self {
        let hundred = Decimal::ONE_HUNDRED;
        let tp_price = fill_price * (Decimal::ONE + take_profit_pct / hundred);
        let stop_loss = match stop_loss_pct {
            Some(pct) => StopLoss::At(fill_price * (Decimal::ONE - pct / hundred)),
            None => StopLoss::Disabled,
        };

        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            entry_order_id,
            entry_time,
            entry_price: fill_price,
            quantity,
            invested,
            tp_price,
            stop_loss,
            status: LotStatus::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, LotStatus::Open)
    }

    /// Consume an open lot and return its closed record.
    ///
    /// Returns `None` if the lot is already closed; closed lots never re-open
    /// and never close twice.
    pub fn close(
        self,
        exit_time: DateTime<Utc>,
        exit_price: Decimal,
        proceeds: Decimal,
        exit_order_id: String,
    ) -> Option<Self> {
        if !self.is_open() {
            return None;
        }
        let pnl = proceeds - self.invested;
        Some(Self {
            status: LotStatus::Closed {
                exit_time,
                exit_price,
                proceeds,
                pnl,
                exit_order_id,
            },
            ..self
        })
    }

    /// Whether the exit rule fires at `price`.
    ///
    /// Take-profit is checked for every lot; the stop only applies when
    /// stop-loss is enabled in the current config and the lot carries one.
    pub fn should_exit(&self, price: Decimal, stop_loss_enabled: bool) -> bool {
        if price >= self.tp_price {
            return true;
        }
        match self.stop_loss {
            StopLoss::At(stop) if stop_loss_enabled => price <= stop,
            _ => false,
        }
    }

    /// Mark-to-market value at `price`.
    pub fn market_value(&self, price: Decimal) -> Decimal {
        self.quantity * price
    }

    /// Floating P&L at `price` for an open lot.
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.market_value(price) - self.invested
    }

    /// Realized P&L once closed.
    pub fn realized_pnl(&self) -> Option<Decimal> {
        match &self.status {
            LotStatus::Closed { pnl, .. } => Some(*pnl),
            LotStatus::Open => None,
        }
    }

    pub fn exit_price(&self) -> Option<Decimal> {
        match &self.status {
            LotStatus::Closed { exit_price, .. } => Some(*exit_price),
            LotStatus::Open => None,
        }
    }

    pub fn exit_time(&self) -> Option<DateTime<Utc>> {
        match &self.status {
            LotStatus::Closed { exit_time, .. } => Some(*exit_time),
            LotStatus::Open => None,
        }
    }

    /// Return on the invested amount once closed.
    pub fn return_pct(&self) -> Option<Decimal> {
        let pnl = self.realized_pnl()?;
        if self.invested.is_zero() {
            return None;
        }
        Some(pnl / self.invested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn lot_at(price: Decimal, stop_loss_pct: Option<Decimal>) -> Lot {
        Lot::open(
            "BTCUSDT",
            "SIM-000001".to_string(),
            Utc::now(),
            price,
            dec!(0.05),
            dec!(5),
            dec!(2),
            stop_loss_pct,
        )
    }

    #[test]
    fn test_targets_from_fill_price() {
        let lot = lot_at(dec!(100), Some(dec!(10)));
        assert_eq!(lot.tp_price, dec!(102));
        assert_eq!(lot.stop_loss, StopLoss::At(dec!(90)));

        let lot = lot_at(dec!(100), None);
        assert_eq!(lot.stop_loss, StopLoss::Disabled);
        assert_eq!(lot.stop_loss.price(), None);
    }

    #[test]
    fn test_exit_rule_boundaries() {
        let lot = lot_at(dec!(100), Some(dec!(10)));

        assert!(lot.should_exit(dec!(102), true));
        assert!(!lot.should_exit(dec!(101.99), true));
        assert!(lot.should_exit(dec!(90), true));
        assert!(!lot.should_exit(dec!(90.01), true));

        // Stop carried by the lot is ignored once stop-loss is switched off
        assert!(!lot.should_exit(dec!(80), false));
    }

    #[test]
    fn test_close_is_one_way() {
        let lot = lot_at(dec!(100), None);
        let closed = lot
            .close(Utc::now(), dec!(102), dec!(5.1), "SIM-000002".to_string())
            .unwrap();

        assert!(!closed.is_open());
        assert_eq!(closed.realized_pnl(), Some(dec!(0.1)));
        assert_eq!(closed.return_pct(), Some(dec!(0.02)));

        let again = closed.close(Utc::now(), dec!(110), dec!(5.5), "SIM-000003".to_string());
        assert!(again.is_none());
    }

    #[test]
    fn test_serde_shape() {
        let lot = lot_at(dec!(100), Some(dec!(10)));
        let json = serde_json::to_value(&lot).unwrap();
        assert_eq!(json["status"], "OPEN");
        assert_eq!(json["stop_loss"]["kind"], "AT");

        let back: Lot = serde_json::from_value(json).unwrap();
        assert_eq!(back, lot);
    }
}
