//! Performance metrics over closed lots.

mod calculator;

pub use calculator::{LadderMetrics, MetricsCalculator};
