//! Calculator for backtest performance metrics: win rate, profit factor, MDD, Sharpe.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::{EquityPoint, Trade};

/// Aggregate statistics over a non-empty trade list.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceStats {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,

    /// Fraction of trades with positive realized P&L (0.0 to 1.0)
    pub win_rate: f64,

    /// Mean realized P&L of winners
    pub avg_win: Decimal,

    /// Mean loss magnitude of non-winners
    pub avg_loss: Decimal,

    pub profit_factor: f64,
    pub total_pnl: Decimal,
    pub total_fees: Decimal,

    /// Most negative peak-to-trough move (<= 0.0)
    pub max_drawdown: f64,

    /// Mean over standard deviation of per-bar equity returns, not annualized
    pub sharpe_ratio: f64,
}

/// Calculator for performance statistics.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Statistics for a run. Returns `None` when there are no trades, so a
    /// win rate is never computed against a zero denominator.
    pub fn calculate(trades: &[Trade], equity: &[EquityPoint]) -> Option<PerformanceStats> {
        if trades.is_empty() {
            return None;
        }

        let (wins, losses): (Vec<&Trade>, Vec<&Trade>) = trades.iter().partition(|t| t.is_win());

        let avg_win = mean_pnl(&wins);
        let avg_loss = mean_pnl(&losses).abs();

        let curve: Vec<Decimal> = equity.iter().map(|p| p.equity).collect();

        Some(PerformanceStats {
            total_trades: trades.len(),
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate: wins.len() as f64 / trades.len() as f64,
            avg_win,
            avg_loss,
            profit_factor: profit_factor(avg_win, avg_loss),
            total_pnl: trades.iter().map(|t| t.realized_pnl()).sum(),
            total_fees: trades.iter().map(|t| t.fees()).sum(),
            max_drawdown: max_drawdown(&curve),
            sharpe_ratio: per_bar_sharpe(&curve),
        })
    }
}

fn mean_pnl(trades: &[&Trade]) -> Decimal {
    if trades.is_empty() {
        return Decimal::ZERO;
    }
    trades.iter().map(|t| t.realized_pnl()).sum::<Decimal>() / Decimal::from(trades.len())
}

/// Average win over average loss magnitude.
///
/// With no loss to divide by, the average win is reported on its own.
pub fn profit_factor(avg_win: Decimal, avg_loss: Decimal) -> f64 {
    let win = avg_win.to_f64().unwrap_or(0.0);
    if avg_loss.is_zero() {
        return win;
    }
    win / avg_loss.to_f64().unwrap_or(1.0)
}

/// Minimum of `(equity - running_peak) / running_peak`. Zero for a curve that
/// never falls below its peak.
pub fn max_drawdown(curve: &[Decimal]) -> f64 {
    let mut peak = match curve.first() {
        Some(first) => *first,
        None => return 0.0,
    };
    let mut worst = 0.0f64;

    for &equity in curve {
        if equity > peak {
            peak = equity;
        }
        if peak > Decimal::ZERO {
            let dd = ((equity - peak) / peak).to_f64().unwrap_or(0.0);
            if dd < worst {
                worst = dd;
            }
        }
    }

    worst
}

fn per_bar_sharpe(curve: &[Decimal]) -> f64 {
    let returns: Vec<f64> = curve
        .windows(2)
        .filter_map(|w| {
            let prev = w[0].to_f64()?;
            let curr = w[1].to_f64()?;
            (prev > 0.0).then(|| (curr - prev) / prev)
        })
        .collect();

    if returns.len() < 2 {
        return 0.0;
    }

    let mean = returns.iter().mean();
    let std_dev = returns.iter().std_dev();

    if std_dev > 0.0 {
        mean / std_dev
    } else {
        0.0
    }
}
