//! Trading logic: risk sizing and the position state machine.

mod config;
mod position_sizer;
mod position_tracker;

pub use config::RiskParams;
pub use position_sizer::{size, PositionSizer, SizingRejection};
pub use position_tracker::{attribute_exit, resolve_exit, ExitFill, PositionTracker};
