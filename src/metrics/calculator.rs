//! Calculator for ladder performance over closed lots: win rate, profit
//! factor, return dispersion, realized drawdown.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::Lot;

/// Summary of closed-lot performance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LadderMetrics {
    pub closed_lots: u32,
    pub winning_lots: u32,
    pub losing_lots: u32,
    pub win_rate: f64,
    pub total_pnl: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub profit_factor: f64,
    /// Mean P&L per closed lot
    pub expectancy: Decimal,
    /// Mean of per-lot returns (fraction of invested)
    pub mean_return: f64,
    pub return_std_dev: f64,
    pub best_lot: Decimal,
    pub worst_lot: Decimal,
    pub avg_holding_minutes: f64,
    /// Worst peak-to-trough drop of realized equity (fraction)
    pub max_realized_drawdown: f64,
}

/// Calculator for computing ladder performance metrics.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Calculate metrics from closed-lot history (any order).
    pub fn calculate(history: &[Lot], initial_capital: Decimal) -> LadderMetrics {
        let mut closed: Vec<&Lot> = history.iter().filter(|l| !l.is_open()).collect();
        let mut metrics = LadderMetrics::default();

        if closed.is_empty() {
            return metrics;
        }

        // Chronological by exit
        closed.sort_by_key(|l| l.exit_time());

        let pnls: Vec<Decimal> = closed.iter().filter_map(|l| l.realized_pnl()).collect();
        metrics.closed_lots = pnls.len() as u32;

        Self::calculate_pnl_metrics(&mut metrics, &pnls);
        Self::calculate_return_stats(&mut metrics, &closed);
        Self::calculate_drawdown(&mut metrics, &pnls, initial_capital);

        let holding: Vec<f64> = closed
            .iter()
            .filter_map(|l| {
                l.exit_time()
                    .map(|exit| (exit - l.entry_time).num_seconds() as f64 / 60.0)
            })
            .collect();
        if !holding.is_empty() {
            metrics.avg_holding_minutes = holding.mean();
        }

        metrics
    }

    /// Calculate P&L-related metrics from realized lot outcomes.
    fn calculate_pnl_metrics(metrics: &mut LadderMetrics, pnls: &[Decimal]) {
        let (wins, losses): (Vec<Decimal>, Vec<Decimal>) =
            pnls.iter().copied().partition(|&p| p > Decimal::ZERO);

        metrics.winning_lots = wins.len() as u32;
        metrics.losing_lots = losses.len() as u32;
        metrics.total_pnl = pnls.iter().copied().sum();

        if !pnls.is_empty() {
            metrics.win_rate = wins.len() as f64 / pnls.len() as f64;
            metrics.expectancy = metrics.total_pnl / Decimal::from(pnls.len() as u32);
        }

        if !wins.is_empty() {
            metrics.avg_win =
                wins.iter().copied().sum::<Decimal>() / Decimal::from(wins.len() as u32);
        }
        if !losses.is_empty() {
            let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();
            metrics.avg_loss = gross_loss / Decimal::from(losses.len() as u32);
        }

        // Profit factor
        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();
        if gross_loss > Decimal::ZERO {
            metrics.profit_factor =
                gross_profit.to_f64().unwrap_or(0.0) / gross_loss.to_f64().unwrap_or(1.0);
        } else if gross_profit > Decimal::ZERO {
            metrics.profit_factor = f64::INFINITY;
        }

        metrics.best_lot = pnls.iter().copied().max().unwrap_or_default();
        metrics.worst_lot = pnls.iter().copied().min().unwrap_or_default();
    }

    /// Mean and standard deviation of per-lot returns.
    fn calculate_return_stats(metrics: &mut LadderMetrics, closed: &[&Lot]) {
        let returns: Vec<f64> = closed
            .iter()
            .filter_map(|l| l.return_pct())
            .filter_map(|r| r.to_f64())
            .collect();

        if returns.is_empty() {
            return;
        }
        metrics.mean_return = returns.iter().mean();
        if returns.len() >= 2 {
            metrics.return_std_dev = returns.iter().std_dev();
        }
    }

    /// Drawdown of starting capital plus cumulative realized P&L.
    fn calculate_drawdown(metrics: &mut LadderMetrics, pnls: &[Decimal], initial_capital: Decimal) {
        let mut equity = initial_capital;
        let mut peak = initial_capital;
        let mut max_dd = 0.0f64;

        for pnl in pnls {
            equity += pnl;
            if equity > peak {
                peak = equity;
            }
            if peak > Decimal::ZERO {
                let dd = ((peak - equity) / peak).to_f64().unwrap_or(0.0);
                if dd > max_dd {
                    max_dd = dd;
                }
            }
        }

        metrics.max_realized_drawdown = max_dd;
    }
}

impl std::fmt::Display for LadderMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Closed Lots:   {} ({} won / {} lost)",
            self.closed_lots, self.winning_lots, self.losing_lots
        )?;
        writeln!(f, "Win Rate:      {:.1}%", self.win_rate * 100.0)?;
        writeln!(f, "Realized P&L:  ${:.2}", self.total_pnl)?;
        writeln!(f, "Avg Win:       ${:.2}", self.avg_win)?;
        writeln!(f, "Avg Loss:      ${:.2}", self.avg_loss)?;
        writeln!(f, "Profit Factor: {:.2}", self.profit_factor)?;
        writeln!(f, "Best / Worst:  ${:.2} / ${:.2}", self.best_lot, self.worst_lot)?;
        writeln!(
            f,
            "Lot Return:    {:.2}% ± {:.2}%",
            self.mean_return * 100.0,
            self.return_std_dev * 100.0
        )?;
        writeln!(f, "Avg Holding:   {:.1} min", self.avg_holding_minutes)?;
        write!(f, "Realized DD:   {:.2}%", self.max_realized_drawdown * 100.0)
    }
}
