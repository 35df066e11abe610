//! Backtesting engine: replays a bar series through a signal generator and the
//! position state machine.
//!
//! Per bar, in order:
//! 1. record a mark-to-market equity point
//! 2. resolve exits against the bar's high/low
//! 3. when idle (and nothing closed on this bar), evaluate the window ending
//!    at this bar and attempt an entry at the signal's price

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::metrics::{MetricsCalculator, PerformanceStats};
use crate::models::{Bar, EquityPoint, OpenPosition, Trade};
use crate::strategy::SignalGenerator;
use crate::trading::{ExitFill, PositionSizer, PositionTracker, RiskParams};

/// What a commission rate is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommissionBasis {
    /// `2 * balance * rate` per round trip, regardless of position size
    #[default]
    Balance,
    /// `rate * (entry notional + exit notional)`
    Notional,
}

/// Backtesting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Starting account balance
    pub initial_balance: Decimal,

    /// Commission per side (0.0 to 1.0)
    pub commission_rate: Decimal,

    pub commission_basis: CommissionBasis,

    /// Bars skipped before the first equity point
    pub warmup_bars: usize,

    /// Taken from the traded pair's settings
    #[serde(skip)]
    pub risk: RiskParams,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_balance: dec!(10000),
            commission_rate: dec!(0.0005),  // 0.05% per side
            commission_basis: CommissionBasis::Balance,
            warmup_bars: 50,
            risk: RiskParams::default(),
        }
    }
}

/// Backtest results for a run that produced at least one trade.
#[derive(Debug, Clone)]
pub struct BacktestReport {
    pub strategy_id: String,
    pub initial_balance: Decimal,

    /// Balance after the last closed trade
    pub final_balance: Decimal,

    /// Final balance plus unrealized P&L of any position still open
    pub final_equity: Decimal,

    /// (final_balance - initial_balance) / initial_balance
    pub total_return: f64,

    pub stats: PerformanceStats,

    /// Entries rejected by risk sizing
    pub skipped_entries: usize,

    /// Position still open at the end of the data, not force-closed
    pub open_position: Option<OpenPosition>,

    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,

    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Result of a backtest run. A run without trades is reported as such and
/// carries no performance statistics.
#[derive(Debug, Clone)]
pub enum BacktestOutcome {
    NoTrades {
        strategy_id: String,
        bars_processed: usize,
        skipped_entries: usize,
        open_position: Option<OpenPosition>,
    },
    Completed(Box<BacktestReport>),
}

impl BacktestOutcome {
    pub fn report(&self) -> Option<&BacktestReport> {
        match self {
            BacktestOutcome::Completed(report) => Some(report),
            BacktestOutcome::NoTrades { .. } => None,
        }
    }
}

impl std::fmt::Display for BacktestReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = &self.stats;
        writeln!(f, "\n{:=^60}", " BACKTEST RESULTS ")?;
        writeln!(f)?;
        writeln!(f, "Strategy: {}", self.strategy_id)?;
        writeln!(f, "Period: {} to {}",
            self.start_time.format("%Y-%m-%d %H:%M"),
            self.end_time.format("%Y-%m-%d %H:%M"))?;
        writeln!(f)?;
        writeln!(f, "--- Capital ---")?;
        writeln!(f, "Initial:     ${:.2}", self.initial_balance)?;
        writeln!(f, "Final:       ${:.2}", self.final_balance)?;
        writeln!(f, "Equity:      ${:.2}", self.final_equity)?;
        writeln!(f, "Return:      {:.2}%", self.total_return * 100.0)?;
        writeln!(f, "Fees Paid:   ${:.2}", s.total_fees)?;
        writeln!(f)?;
        writeln!(f, "--- Trades ---")?;
        writeln!(f, "Total:       {} ({} entries skipped)", s.total_trades, self.skipped_entries)?;
        writeln!(f, "Winners:     {} ({:.1}%)", s.winning_trades, s.win_rate * 100.0)?;
        writeln!(f, "Losers:      {}", s.losing_trades)?;
        writeln!(f, "Avg Win:     ${:.2}", s.avg_win)?;
        writeln!(f, "Avg Loss:    ${:.2}", s.avg_loss)?;
        writeln!(f, "Profit Factor: {:.2}", s.profit_factor)?;
        writeln!(f)?;
        writeln!(f, "--- Risk Metrics ---")?;
        writeln!(f, "Max Drawdown: {:.2}%", s.max_drawdown * 100.0)?;
        writeln!(f, "Sharpe (per bar): {:.4}", s.sharpe_ratio)?;
        if let Some(pos) = &self.open_position {
            writeln!(f)?;
            writeln!(f, "Open at end: {} {} @ {} (SL {} / TP {})",
                pos.side.as_str(), pos.quantity, pos.entry_price,
                pos.stop_loss_price, pos.take_profit_price)?;
        }
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

impl std::fmt::Display for BacktestOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BacktestOutcome::Completed(report) => write!(f, "{}", report),
            BacktestOutcome::NoTrades {
                strategy_id,
                bars_processed,
                skipped_entries,
                open_position,
            } => {
                writeln!(f, "\n{:=^60}", " BACKTEST RESULTS ")?;
                writeln!(f)?;
                writeln!(f, "Strategy: {}", strategy_id)?;
                writeln!(f, "No trades over {} bars ({} entries skipped)",
                    bars_processed, skipped_entries)?;
                if let Some(pos) = open_position {
                    writeln!(f, "Open at end: {} {} @ {}",
                        pos.side.as_str(), pos.quantity, pos.entry_price)?;
                }
                writeln!(f, "{:=^60}", "")
            }
        }
    }
}

/// Backtesting engine.
pub struct Backtester {
    config: BacktestConfig,
    sizer: PositionSizer,
}

impl Backtester {
    pub fn new(config: BacktestConfig) -> Self {
        let sizer = PositionSizer::new(config.risk.clone());
        Self { config, sizer }
    }

    /// Round-trip commission for closing `position` at `exit_price`.
    fn commission(&self, position: &OpenPosition, exit_price: Decimal, balance: Decimal) -> Decimal {
        let rate = self.config.commission_rate;
        match self.config.commission_basis {
            CommissionBasis::Balance => balance * rate * dec!(2),
            CommissionBasis::Notional => {
                (position.entry_price + exit_price) * position.quantity * rate
            }
        }
    }

    /// Replay `bars` through `generator`.
    ///
    /// Bars are annotated by the generator first unless already annotated.
    pub fn run(&self, bars: &[Bar], generator: &dyn SignalGenerator) -> BacktestOutcome {
        let mut bars = bars.to_vec();
        generator.add_indicators(&mut bars);

        let start = self.config.warmup_bars.min(bars.len());
        info!(
            strategy = generator.id(),
            bars = bars.len(),
            warmup = start,
            "Starting backtest"
        );

        let mut balance = self.config.initial_balance;
        let mut tracker = PositionTracker::new();
        let mut trades: Vec<Trade> = Vec::new();
        let mut equity_curve: Vec<EquityPoint> = Vec::with_capacity(bars.len() - start);
        let mut skipped = 0usize;

        for i in start..bars.len() {
            let bar = &bars[i];

            // 1. Mark to market
            equity_curve.push(EquityPoint {
                timestamp: bar.timestamp,
                equity: balance + tracker.unrealized_pnl(bar.close),
                reference_price: bar.close,
            });

            // 2. Exit check
            let mut exited = false;
            if let Some(fill) = tracker.check_exit(bar) {
                if let Some(trade) = self.close(&mut tracker, fill, bar, balance) {
                    balance += trade.realized_pnl();
                    debug!(
                        time = %bar.timestamp,
                        reason = trade.exit_reason().as_str(),
                        price = %trade.exit_price(),
                        pnl = %trade.realized_pnl(),
                        balance = %balance,
                        "Closed position"
                    );
                    trades.push(trade);
                    exited = true;
                }
            }

            // 3. Entry, never on the bar that just closed a position
            if exited || tracker.is_open() {
                continue;
            }

            let signal = generator.on_bar(&bars[..=i]);
            if !signal.is_actionable() {
                continue;
            }
            if !signal.is_well_formed() {
                warn!(time = %bar.timestamp, rationale = %signal.rationale, "Malformed signal ignored");
                continue;
            }

            match self.sizer.size(balance, signal.entry_price, signal.stop_loss_price) {
                Ok(quantity) => {
                    tracker.open(&signal, quantity, bar.timestamp);
                    debug!(
                        time = %bar.timestamp,
                        direction = signal.direction.as_str(),
                        entry = %signal.entry_price,
                        sl = %signal.stop_loss_price,
                        tp = %signal.take_profit_price,
                        qty = %quantity,
                        "Opened position"
                    );
                }
                Err(rejection) => {
                    skipped += 1;
                    debug!(time = %bar.timestamp, reason = %rejection, "Entry rejected by sizing");
                }
            }
        }

        let open_position = tracker.position().cloned();

        let Some(stats) = MetricsCalculator::calculate(&trades, &equity_curve) else {
            info!(strategy = generator.id(), "Backtest produced no trades");
            return BacktestOutcome::NoTrades {
                strategy_id: generator.id().to_string(),
                bars_processed: equity_curve.len(),
                skipped_entries: skipped,
                open_position,
            };
        };

        let final_equity = bars
            .last()
            .map(|b| balance + tracker.unrealized_pnl(b.close))
            .unwrap_or(balance);

        let total_return = if self.config.initial_balance > Decimal::ZERO {
            ((balance - self.config.initial_balance) / self.config.initial_balance)
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };

        let start_time = equity_curve.first().map(|p| p.timestamp).unwrap_or_else(Utc::now);
        let end_time = equity_curve.last().map(|p| p.timestamp).unwrap_or(start_time);

        info!(
            trades = stats.total_trades,
            win_rate = stats.win_rate,
            final_balance = %balance,
            "Backtest complete"
        );

        BacktestOutcome::Completed(Box::new(BacktestReport {
            strategy_id: generator.id().to_string(),
            initial_balance: self.config.initial_balance,
            final_balance: balance,
            final_equity,
            total_return,
            stats,
            skipped_entries: skipped,
            open_position,
            trades,
            equity_curve,
            start_time,
            end_time,
        }))
    }

    fn close(
        &self,
        tracker: &mut PositionTracker,
        fill: ExitFill,
        bar: &Bar,
        balance: Decimal,
    ) -> Option<Trade> {
        let fees = self.commission(tracker.position()?, fill.price, balance);
        tracker.close(fill, bar.timestamp, fees, balance)
    }
}

// ============== Historical Data ==============

#[derive(Debug, Deserialize)]
struct CsvBar {
    time: String,
    #[serde(with = "rust_decimal::serde::str")]
    open: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    high: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    low: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    close: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    volume: Decimal,
}

/// Parse an RFC 3339 timestamp or epoch milliseconds.
pub fn parse_bar_time(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        let millis: i64 = raw.parse().context("Invalid epoch milliseconds")?;
        return DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| anyhow!("Epoch milliseconds out of range: {}", raw));
    }
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp: {}", raw))?
        .with_timezone(&Utc))
}

/// Load bars from a `time,open,high,low,close,volume` CSV file, oldest first.
pub fn load_bars_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Bar>> {
    let mut reader = csv::Reader::from_path(&path)
        .with_context(|| format!("Failed to open {:?}", path.as_ref()))?;

    let mut bars = Vec::new();
    for (line, row) in reader.deserialize::<CsvBar>().enumerate() {
        let row = row.with_context(|| format!("Failed to parse bar on row {}", line + 1))?;
        bars.push(Bar::new(
            parse_bar_time(&row.time)?,
            row.open,
            row.high,
            row.low,
            row.close,
            row.volume,
        ));
    }

    bars.sort_by_key(|b| b.timestamp);
    bars.dedup_by_key(|b| b.timestamp);
    Ok(bars)
}
