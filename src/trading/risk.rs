//! Risk governor: stateless checks of the ledger against the configured limits.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::config::LadderConfig;
use super::ledger::BotState;
use crate::models::Lot;

/// Why every open lot is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HaltReason {
    GlobalDrawdownTriggered,
    DailyLossLimitReached,
    ManualEmergencyStop,
}

impl HaltReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            HaltReason::GlobalDrawdownTriggered => "GLOBAL_DRAWDOWN_TRIGGERED",
            HaltReason::DailyLossLimitReached => "DAILY_LOSS_LIMIT_REACHED",
            HaltReason::ManualEmergencyStop => "MANUAL_EMERGENCY_STOP",
        }
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a risk evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskVerdict {
    Continue,
    LiquidateAndPause(HaltReason),
}

/// Risk evaluation at one price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskAssessment {
    /// Balance plus open lots marked at the price
    pub equity: Decimal,
    /// High-water mark including this equity
    pub peak_equity: Decimal,
    /// (peak - equity) / peak, as a fraction
    pub drawdown: Decimal,
    pub verdict: RiskVerdict,
}

/// Why a single lot leaves the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
}

impl ExitReason {
    pub fn label(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "Take profit",
            ExitReason::StopLoss => "Stop loss",
        }
    }
}

pub struct RiskGovernor;

impl RiskGovernor {
    /// Evaluate drawdown and daily loss at `price`.
    ///
    /// The returned peak must be written back by the caller even when the
    /// verdict is `Continue`.
    pub fn evaluate(state: &BotState, config: &LadderConfig, price: Decimal) -> RiskAssessment {
        let equity = state.equity_at(price);
        let peak_equity = state.peak_equity.max(equity);

        let drawdown = if peak_equity > Decimal::ZERO {
            (peak_equity - equity) / peak_equity
        } else {
            Decimal::ZERO
        };

        let verdict = if config.enable_global_drawdown
            && drawdown >= config.max_drawdown_pct / Decimal::ONE_HUNDRED
        {
            RiskVerdict::LiquidateAndPause(HaltReason::GlobalDrawdownTriggered)
        } else if config
            .max_daily_loss
            .is_some_and(|cap| state.daily_loss >= cap)
        {
            RiskVerdict::LiquidateAndPause(HaltReason::DailyLossLimitReached)
        } else {
            RiskVerdict::Continue
        };

        RiskAssessment {
            equity,
            peak_equity,
            drawdown,
            verdict,
        }
    }

    /// Exit rule for one lot. Take-profit wins when both could fire.
    pub fn exit_reason(lot: &Lot, config: &LadderConfig, price: Decimal) -> Option<ExitReason> {
        if !lot.should_exit(price, config.enable_stop_loss) {
            return None;
        }
        if price >= lot.tp_price {
            Some(ExitReason::TakeProfit)
        } else {
            Some(ExitReason::StopLoss)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn state_with(balance: Decimal, peak: Decimal) -> BotState {
        let mut state = BotState::new(balance, 20);
        state.peak_equity = peak;
        state
    }

    #[test]
    fn test_drawdown_boundary() {
        let config = LadderConfig {
            max_drawdown_pct: dec!(20),
            ..Default::default()
        };

        let at_limit = RiskGovernor::evaluate(&state_with(dec!(800), dec!(1000)), &config, dec!(1));
        assert_eq!(at_limit.drawdown, dec!(0.2));
        assert_eq!(
            at_limit.verdict,
            RiskVerdict::LiquidateAndPause(HaltReason::GlobalDrawdownTriggered)
        );

        let inside =
            RiskGovernor::evaluate(&state_with(dec!(800.01), dec!(1000)), &config, dec!(1));
        assert_eq!(inside.verdict, RiskVerdict::Continue);
    }

    #[test]
    fn test_drawdown_disabled() {
        let config = LadderConfig {
            enable_global_drawdown: false,
            ..Default::default()
        };
        let result = RiskGovernor::evaluate(&state_with(dec!(100), dec!(1000)), &config, dec!(1));
        assert_eq!(result.verdict, RiskVerdict::Continue);
        assert_eq!(result.drawdown, dec!(0.9));
    }

    #[test]
    fn test_peak_tracks_new_highs() {
        let config = LadderConfig::default();
        let mut state = state_with(dec!(100), dec!(100));
        let lot = Lot::open(
            "BTCUSDT",
            "SIM-1".to_string(),
            Utc::now(),
            dec!(100),
            dec!(0.5),
            dec!(50),
            dec!(2),
            None,
        );
        state.open_lot(lot).unwrap();

        let result = RiskGovernor::evaluate(&state, &config, dec!(120));
        assert_eq!(result.equity, dec!(110));
        assert_eq!(result.peak_equity, dec!(110));
        assert_eq!(result.drawdown, dec!(0));
    }

    #[test]
    fn test_daily_loss_cap() {
        let config = LadderConfig {
            max_daily_loss: Some(dec!(0.4)),
            ..Default::default()
        };
        let mut state = state_with(dec!(100), dec!(100));
        state.daily_loss = dec!(0.39);
        assert_eq!(RiskGovernor::evaluate(&state, &config, dec!(1)).verdict, RiskVerdict::Continue);

        state.daily_loss = dec!(0.4);
        assert_eq!(
            RiskGovernor::evaluate(&state, &config, dec!(1)).verdict,
            RiskVerdict::LiquidateAndPause(HaltReason::DailyLossLimitReached)
        );
    }

    #[test]
    fn test_zero_peak_has_no_drawdown() {
        let config = LadderConfig::default();
        let mut state = state_with(dec!(0), dec!(0));
        state.balance = Decimal::ZERO;
        let result = RiskGovernor::evaluate(&state, &config, dec!(1));
        assert_eq!(result.drawdown, Decimal::ZERO);
        assert_eq!(result.verdict, RiskVerdict::Continue);
    }

    #[test]
    fn test_exit_reasons() {
        let config = LadderConfig::default();
        let lot = Lot::open(
            "BTCUSDT",
            "SIM-1".to_string(),
            Utc::now(),
            dec!(100),
            dec!(0.05),
            dec!(5),
            dec!(2),
            Some(dec!(10)),
        );

        assert_eq!(
            RiskGovernor::exit_reason(&lot, &config, dec!(102)),
            Some(ExitReason::TakeProfit)
        );
        assert_eq!(RiskGovernor::exit_reason(&lot, &config, dec!(90)), Some(ExitReason::StopLoss));
        assert_eq!(RiskGovernor::exit_reason(&lot, &config, dec!(95)), None);

        let no_stop = LadderConfig {
            enable_stop_loss: false,
            ..Default::default()
        };
        assert_eq!(RiskGovernor::exit_reason(&lot, &no_stop, dec!(90)), None);
    }
}
