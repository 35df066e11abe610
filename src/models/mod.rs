//! Data models for bars, signals, positions, trades, and equity points.

mod bar;
mod equity;
mod position;
mod signal;
mod trade;

pub use bar::{Bar, Indicators};
pub use equity::EquityPoint;
pub use position::{OpenPosition, PositionStatus, Side};
pub use signal::{Direction, Signal};
pub use trade::{ExitReason, Trade};
