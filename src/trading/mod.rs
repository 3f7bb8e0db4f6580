//! Trading logic: ledger, risk governor, decision engine.

mod config;
mod control;
mod engine;
mod handle;
mod ledger;
mod risk;

pub use config::{ConfigError, DailyLossReset, LadderConfig, LevelSizing};
pub use control::ControlCommand;
pub use engine::{order_venue, DecisionEngine};
pub use handle::EngineHandle;
pub use ledger::{BotState, LedgerError};
pub use risk::{ExitReason, HaltReason, RiskAssessment, RiskGovernor, RiskVerdict};
