//! Position ledger: balance, open lots and closed-lot history.
//!
//! The ledger is plain data. Only the decision engine mutates it, and every
//! mutation goes through `open_lot` / `close_lot` so the balance can never
//! go negative and a lot can never be closed twice.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{AuditLog, Lot};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: Decimal, available: Decimal },
    #[error("Lot {0} is not open")]
    UnknownLot(Uuid),
}

/// Authoritative trading state for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotState {
    /// Free quote currency
    pub balance: Decimal,

    /// Open lots, in insertion order
    pub positions: Vec<Lot>,

    /// Closed lots, most recent first
    pub history: Vec<Lot>,

    pub logs: AuditLog,

    /// Last tick price; zero until the first tick after load
    pub current_price: Decimal,

    /// High-water mark of equity
    pub peak_equity: Decimal,

    /// Sum of closed-lot P&L
    pub realized_pnl: Decimal,

    /// Sum of losing closed-lot P&L magnitudes since the last reset
    pub daily_loss: Decimal,

    /// UTC day the daily loss counter belongs to
    #[serde(default)]
    pub daily_loss_day: Option<NaiveDate>,

    pub effective_max_levels: usize,

    pub is_paused: bool,

    pub is_connected: bool,
}

impl BotState {
    /// Fresh ledger. Starts paused so nothing trades until resumed.
    pub fn new(initial_capital: Decimal, max_levels: usize) -> Self {
        Self {
            balance: initial_capital,
            positions: Vec::new(),
            history: Vec::new(),
            logs: AuditLog::new(),
            current_price: Decimal::ZERO,
            peak_equity: initial_capital,
            realized_pnl: Decimal::ZERO,
            daily_loss: Decimal::ZERO,
            daily_loss_day: None,
            effective_max_levels: max_levels,
            is_paused: true,
            is_connected: false,
        }
    }

    /// Add an open lot and pay for it.
    pub fn open_lot(&mut self, lot: Lot) -> Result<(), LedgerError> {
        if lot.invested > self.balance {
            return Err(LedgerError::InsufficientBalance {
                needed: lot.invested,
                available: self.balance,
            });
        }
        self.balance -= lot.invested;
        self.positions.push(lot);
        Ok(())
    }

    /// Close an open lot with the given sell proceeds.
    ///
    /// The closed record goes to the front of `history`; its P&L feeds the
    /// realized total and, when negative, the daily loss counter.
    pub fn close_lot(
        &mut self,
        lot_id: Uuid,
        exit_time: DateTime<Utc>,
        exit_price: Decimal,
        proceeds: Decimal,
        exit_order_id: String,
    ) -> Result<&Lot, LedgerError> {
        let index = self
            .positions
            .iter()
            .position(|l| l.id == lot_id)
            .ok_or(LedgerError::UnknownLot(lot_id))?;

        let lot = self.positions.remove(index);
        let closed = lot
            .close(exit_time, exit_price, proceeds, exit_order_id)
            .ok_or(LedgerError::UnknownLot(lot_id))?;

        let pnl = closed.realized_pnl().unwrap_or_default();
        self.balance += proceeds;
        self.realized_pnl += pnl;
        if pnl < Decimal::ZERO {
            self.daily_loss += pnl.abs();
        }
        self.history.insert(0, closed);
        Ok(&self.history[0])
    }

    /// Balance plus open lots marked at `price`.
    pub fn equity_at(&self, price: Decimal) -> Decimal {
        self.balance + self.exposure_at(price)
    }

    /// Market value of open lots at `price`.
    pub fn exposure_at(&self, price: Decimal) -> Decimal {
        self.positions.iter().map(|l| l.market_value(price)).sum()
    }

    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.positions.iter().map(|l| l.unrealized_pnl(price)).sum()
    }

    /// Open lot ids, oldest entry first. Ties keep insertion order.
    pub fn fifo_lot_ids(&self) -> Vec<Uuid> {
        let mut lots: Vec<&Lot> = self.positions.iter().collect();
        lots.sort_by_key(|l| l.entry_time);
        lots.into_iter().map(|l| l.id).collect()
    }

    /// Most recently opened lot: the dip baseline. On a timestamp tie the
    /// later insertion wins.
    pub fn latest_lot(&self) -> Option<&Lot> {
        self.positions.iter().max_by_key(|l| l.entry_time)
    }

    pub fn lot(&self, lot_id: Uuid) -> Option<&Lot> {
        self.positions.iter().find(|l| l.id == lot_id)
    }

    /// Transient fields go back to their defaults after a load.
    pub fn reset_transient(&mut self) {
        self.current_price = Decimal::ZERO;
    }
}
