//! Performance statistics over trades and equity curves.

mod calculator;

pub use calculator::{max_drawdown, profit_factor, MetricsCalculator, PerformanceStats};
