//! Shared handle to a running engine.
//!
//! Ticks and control operations are serialized through one mutex. Readers go
//! through a separate snapshot that is replaced after every operation, so a
//! tick waiting on the venue never blocks `state()`.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};

use super::config::{ConfigError, LadderConfig};
use super::control::ControlCommand;
use super::engine::DecisionEngine;
use super::ledger::BotState;
use super::risk::HaltReason;

#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<Mutex<DecisionEngine>>,
    snapshot: Arc<RwLock<BotState>>,
    config: Arc<RwLock<LadderConfig>>,
}

impl EngineHandle {
    pub fn new(engine: DecisionEngine) -> Self {
        let snapshot = engine.state();
        let config = engine.config().clone();
        Self {
            engine: Arc::new(Mutex::new(engine)),
            snapshot: Arc::new(RwLock::new(snapshot)),
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// Last published snapshot. May lag an in-flight tick.
    pub async fn state(&self) -> BotState {
        self.snapshot.read().await.clone()
    }

    pub async fn config(&self) -> LadderConfig {
        self.config.read().await.clone()
    }

    pub async fn tick(&self, price: Decimal) -> BotState {
        self.tick_at(price, Utc::now()).await
    }

    pub async fn tick_at(&self, price: Decimal, now: DateTime<Utc>) -> BotState {
        let mut engine = self.engine.lock().await;
        let state = engine.tick_at(price, now).await;
        self.publish(state).await
    }

    pub async fn pause(&self) -> BotState {
        let mut engine = self.engine.lock().await;
        let state = engine.pause().await;
        self.publish(state).await
    }

    pub async fn resume(&self) -> BotState {
        let mut engine = self.engine.lock().await;
        let state = engine.resume().await;
        self.publish(state).await
    }

    /// Applied between ticks, never during one.
    pub async fn update_config(&self, config: LadderConfig) -> Result<BotState, ConfigError> {
        let mut engine = self.engine.lock().await;
        let state = engine.update_config(config).await?;
        *self.config.write().await = engine.config().clone();
        Ok(self.publish(state).await)
    }

    pub async fn liquidate_all(&self, reason: HaltReason) -> BotState {
        let mut engine = self.engine.lock().await;
        let state = engine.liquidate_all(reason).await;
        self.publish(state).await
    }

    pub async fn reset(&self) -> Result<BotState> {
        let mut engine = self.engine.lock().await;
        let state = engine.reset().await?;
        Ok(self.publish(state).await)
    }

    /// Run a queued operator command.
    pub async fn apply(&self, command: ControlCommand) -> Result<BotState> {
        let state = match command {
            ControlCommand::Pause => self.pause().await,
            ControlCommand::Resume => self.resume().await,
            ControlCommand::Liquidate => self.liquidate_all(HaltReason::ManualEmergencyStop).await,
            ControlCommand::Reset => self.reset().await?,
        };
        Ok(state)
    }

    async fn publish(&self, state: BotState) -> BotState {
        *self.snapshot.write().await = state.clone();
        state
    }
}
