//! Single-position state machine shared by the simulation driver and the live
//! adapter.
//!
//! IDLE -> OPEN on an actionable signal, OPEN -> IDLE when a bar touches the
//! stop or target. A signal that arrives while OPEN is ignored.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::models::{Bar, ExitReason, OpenPosition, PositionStatus, Side, Signal, Trade};

/// Price and reason at which an open position leaves the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitFill {
    pub price: Decimal,
    pub reason: ExitReason,
}

/// Exit check for one bar.
///
/// When both levels fall inside the bar's range the stop-loss is taken: the
/// intrabar path is unknown, so the adverse outcome is assumed first.
pub fn resolve_exit(position: &OpenPosition, bar: &Bar) -> Option<ExitFill> {
    let (stop_hit, target_hit) = match position.side {
        Side::Long => (
            bar.low <= position.stop_loss_price,
            bar.high >= position.take_profit_price,
        ),
        Side::Short => (
            bar.high >= position.stop_loss_price,
            bar.low <= position.take_profit_price,
        ),
    };

    if stop_hit {
        Some(ExitFill {
            price: position.stop_loss_price,
            reason: ExitReason::StopLoss,
        })
    } else if target_hit {
        Some(ExitFill {
            price: position.take_profit_price,
            reason: ExitReason::TakeProfit,
        })
    } else {
        None
    }
}

/// First bar still trading at or after entry that triggers an exit, with the
/// exit time (never earlier than the entry).
///
/// Bar timestamps are open times, so the bar the entry happened in is checked
/// too. The last bar is taken to last as long as the spacing before it.
pub fn attribute_exit(position: &OpenPosition, bars: &[Bar]) -> Option<(ExitFill, DateTime<Utc>)> {
    bars.iter()
        .enumerate()
        .filter(|&(i, _)| close_time(bars, i).map_or(true, |close| close > position.entry_time))
        .find_map(|(_, b)| {
            resolve_exit(position, b).map(|fill| (fill, b.timestamp.max(position.entry_time)))
        })
}

/// Close time of `bars[i]`: the next bar's open, or one bar spacing after the
/// last open. `None` for a lone bar.
fn close_time(bars: &[Bar], i: usize) -> Option<DateTime<Utc>> {
    match bars.get(i + 1) {
        Some(next) => Some(next.timestamp),
        None if i > 0 => Some(bars[i].timestamp + (bars[i].timestamp - bars[i - 1].timestamp)),
        None => None,
    }
}

/// Tracks at most one open position.
#[derive(Debug, Clone, Default)]
pub struct PositionTracker {
    position: Option<OpenPosition>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> PositionStatus {
        if self.position.is_some() {
            PositionStatus::Open
        } else {
            PositionStatus::Idle
        }
    }

    pub fn is_open(&self) -> bool {
        self.position.is_some()
    }

    pub fn position(&self) -> Option<&OpenPosition> {
        self.position.as_ref()
    }

    /// IDLE -> OPEN. Returns false (and changes nothing) if already open or the
    /// signal carries no direction.
    pub fn open(&mut self, signal: &Signal, quantity: Decimal, entry_time: DateTime<Utc>) -> bool {
        if self.position.is_some() {
            debug!(direction = signal.direction.as_str(), "Entry ignored, position already open");
            return false;
        }
        let Some(side) = signal.direction.side() else {
            return false;
        };

        self.position = Some(OpenPosition {
            side,
            entry_price: signal.entry_price,
            entry_time,
            stop_loss_price: signal.stop_loss_price,
            take_profit_price: signal.take_profit_price,
            quantity,
        });
        true
    }

    /// Exit check against one bar, without changing state.
    pub fn check_exit(&self, bar: &Bar) -> Option<ExitFill> {
        self.position.as_ref().and_then(|p| resolve_exit(p, bar))
    }

    /// OPEN -> IDLE, emitting the trade. `fees` are deducted from gross P&L.
    pub fn close(
        &mut self,
        fill: ExitFill,
        exit_time: DateTime<Utc>,
        fees: Decimal,
        balance_before: Decimal,
    ) -> Option<Trade> {
        let position = self.position.take()?;
        let realized_pnl = position.pnl_at(fill.price) - fees;

        Some(Trade::new(
            position.entry_time,
            exit_time,
            position.side,
            position.entry_price,
            fill.price,
            position.quantity,
            realized_pnl,
            fees,
            balance_before,
            fill.reason,
        ))
    }

    /// Drop local state without emitting a trade. Returns what was held.
    pub fn force_idle(&mut self) -> Option<OpenPosition> {
        self.position.take()
    }

    /// Overwrite local state with a position reported by the exchange.
    pub fn adopt(&mut self, position: OpenPosition) {
        self.position = Some(position);
    }

    /// Mark-to-market P&L of the open position (zero when idle).
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.position
            .as_ref()
            .map(|p| p.pnl_at(price))
            .unwrap_or(Decimal::ZERO)
    }
}
