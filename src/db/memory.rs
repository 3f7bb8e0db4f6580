//! In-process state store for paper sessions and tests.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::StateStore;
use crate::trading::BotState;

/// Snapshots kept in memory. Stored as JSON so a load always hands back an
/// independent copy, the same as a real database would.
#[derive(Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of symbols with a saved snapshot.
    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, symbol: &str) -> Result<Option<BotState>> {
        let snapshots = self.snapshots.read().await;
        match snapshots.get(symbol) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, symbol: &str, state: &BotState) -> Result<()> {
        let raw = serde_json::to_string(state)?;
        self.snapshots.write().await.insert(symbol.to_string(), raw);
        Ok(())
    }

    async fn clear(&self, symbol: &str) -> Result<()> {
        self.snapshots.write().await.remove(symbol);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_ok, block_on};

    #[tokio::test]
    async fn test_round_trip_is_a_copy() {
        let store = MemoryStore::new();
        let mut state = BotState::new(dec!(100), 20);
        store.save("BTCUSDT", &state).await.unwrap();

        // Mutating the saved value does not leak into the store
        state.balance = dec!(1);
        let loaded = store.load("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(loaded.balance, dec!(100));
        assert_eq!(store.len().await, 1);

        store.clear("BTCUSDT").await.unwrap();
        assert!(store.load("BTCUSDT").await.unwrap().is_none());
    }

    #[test]
    fn test_symbols_are_independent() {
        let store = MemoryStore::new();
        block_on(async {
            assert_ok!(store.save("BTCUSDT", &BotState::new(dec!(100), 20)).await);
            assert_ok!(store.save("ETHUSDT", &BotState::new(dec!(250), 5)).await);
            assert_ok!(store.clear("BTCUSDT").await);

            let eth = assert_ok!(store.load("ETHUSDT").await);
            assert_eq!(eth.map(|s| s.balance), Some(dec!(250)));
            assert!(assert_ok!(store.load("BTCUSDT").await).is_none());
            assert_eq!(store.len().await, 1);
        });
    }
}
