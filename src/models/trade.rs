//! Completed round-trip trade record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    /// Closed by an operator command (live only)
    Manual,
    /// Exchange reported flat without a level being touched (live only)
    Reconciled,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::Manual => "MANUAL",
            ExitReason::Reconciled => "RECONCILED",
        }
    }
}

/// Immutable record of one completed round trip.
///
/// Fields are private; a trade is built once at close and only read afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    entry_time: DateTime<Utc>,
    exit_time: DateTime<Utc>,
    side: Side,
    entry_price: Decimal,
    exit_price: Decimal,
    quantity: Decimal,
    realized_pnl: Decimal,
    pnl_percent: Decimal,
    fees: Decimal,
    exit_reason: ExitReason,
}

impl Trade {
    /// Build a trade record. `pnl_percent` is `realized_pnl` over the balance
    /// held before the close.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entry_time: DateTime<Utc>,
        exit_time: DateTime<Utc>,
        side: Side,
        entry_price: Decimal,
        exit_price: Decimal,
        quantity: Decimal,
        realized_pnl: Decimal,
        fees: Decimal,
        balance_before: Decimal,
        exit_reason: ExitReason,
    ) -> Self {
        let pnl_percent = if balance_before > Decimal::ZERO {
            realized_pnl / balance_before
        } else {
            Decimal::ZERO
        };

        Self {
            entry_time,
            exit_time,
            side,
            entry_price,
            exit_price,
            quantity,
            realized_pnl,
            pnl_percent,
            fees,
            exit_reason,
        }
    }

    pub fn entry_time(&self) -> DateTime<Utc> {
        self.entry_time
    }

    pub fn exit_time(&self) -> DateTime<Utc> {
        self.exit_time
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn entry_price(&self) -> Decimal {
        self.entry_price
    }

    pub fn exit_price(&self) -> Decimal {
        self.exit_price
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    /// Net of fees.
    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn pnl_percent(&self) -> Decimal {
        self.pnl_percent
    }

    pub fn fees(&self) -> Decimal {
        self.fees
    }

    pub fn exit_reason(&self) -> ExitReason {
        self.exit_reason
    }

    pub fn is_win(&self) -> bool {
        self.realized_pnl > Decimal::ZERO
    }
}
