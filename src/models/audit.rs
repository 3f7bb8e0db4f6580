//! Audit log: capped, newest-first record of what the engine did and why.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Maximum number of retained events.
pub const AUDIT_CAPACITY: usize = 200;

/// Kind of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditAction {
    Buy,
    Sell,
    Skip,
    Error,
    System,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Buy => "BUY",
            AuditAction::Sell => "SELL",
            AuditAction::Skip => "SKIP",
            AuditAction::Error => "ERROR",
            AuditAction::System => "SYSTEM",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub action: AuditAction,
    pub price: Decimal,
    pub quantity: Decimal,
    pub amount: Decimal,
    pub message: String,
}

/// Ring buffer of audit events, most recent first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLog {
    events: VecDeque<AuditEvent>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            events: VecDeque::with_capacity(AUDIT_CAPACITY),
        }
    }

    /// Append an event, evicting the oldest once the cap is reached.
    ///
    /// The event is mirrored to `tracing` so operators see it in the process
    /// log as well as in the persisted snapshot.
    pub fn record(
        &mut self,
        timestamp: DateTime<Utc>,
        symbol: &str,
        action: AuditAction,
        price: Decimal,
        quantity: Decimal,
        amount: Decimal,
        message: impl Into<String>,
    ) -> &AuditEvent {
        let event = AuditEvent {
            id: Uuid::new_v4(),
            timestamp,
            symbol: symbol.to_string(),
            action,
            price,
            quantity,
            amount,
            message: message.into(),
        };

        match action {
            AuditAction::Error => warn!(
                symbol = %event.symbol,
                price = %price,
                amount = %amount,
                "{}", event.message
            ),
            AuditAction::Skip => debug!(
                symbol = %event.symbol,
                price = %price,
                amount = %amount,
                "{}", event.message
            ),
            _ => info!(
                symbol = %event.symbol,
                action = %action,
                price = %price,
                quantity = %quantity,
                amount = %amount,
                "{}", event.message
            ),
        }

        self.events.push_front(event);
        self.events.truncate(AUDIT_CAPACITY);
        &self.events[0]
    }

    /// Events, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &AuditEvent> {
        self.events.iter()
    }

    pub fn latest(&self) -> Option<&AuditEvent> {
        self.events.front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Count events of one kind.
    pub fn count(&self, action: AuditAction) -> usize {
        self.events.iter().filter(|e| e.action == action).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_newest_first() {
        let mut log = AuditLog::new();
        log.record(Utc::now(), "BTCUSDT", AuditAction::System, dec!(0), dec!(0), dec!(0), "first");
        log.record(
            Utc::now(),
            "BTCUSDT",
            AuditAction::Buy,
            dec!(100),
            dec!(0.05),
            dec!(5),
            "second",
        );

        assert_eq!(log.len(), 2);
        assert_eq!(log.latest().unwrap().message, "second");
        assert_eq!(log.iter().last().unwrap().message, "first");
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut log = AuditLog::new();
        for i in 0..(AUDIT_CAPACITY + 25) {
            log.record(
                Utc::now(),
                "BTCUSDT",
                AuditAction::Skip,
                dec!(1),
                dec!(0),
                dec!(0),
                format!("event {}", i),
            );
        }

        assert_eq!(log.len(), AUDIT_CAPACITY);
        assert_eq!(log.latest().unwrap().message, format!("event {}", AUDIT_CAPACITY + 24));
        // The first 25 events were evicted
        assert_eq!(log.iter().last().unwrap().message, "event 25");
        assert_eq!(log.count(AuditAction::Skip), AUDIT_CAPACITY);
    }

    #[test]
    fn test_action_wire_names() {
        let json = serde_json::to_string(&AuditAction::Error).unwrap();
        assert_eq!(json, "\"ERROR\"");
        assert_eq!(AuditAction::System.to_string(), "SYSTEM");
    }
}
