//! Directional signal produced by a signal generator.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;

/// Direction of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
    None,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
            Direction::None => "NONE",
        }
    }

    /// Position side this direction opens, if any.
    pub fn side(&self) -> Option<Side> {
        match self {
            Direction::Long => Some(Side::Long),
            Direction::Short => Some(Side::Short),
            Direction::None => None,
        }
    }
}

/// Output of a signal generator for one bar window.
///
/// `stop_loss_price` and `take_profit_price` only carry meaning when
/// `direction != None`. For LONG, stop < entry < target; SHORT is the reverse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub direction: Direction,
    pub entry_price: Decimal,
    pub stop_loss_price: Decimal,
    pub take_profit_price: Decimal,
    pub rationale: String,
}

impl Signal {
    /// A signal with no direction.
    pub fn none(entry_price: Decimal, rationale: impl Into<String>) -> Self {
        Self {
            direction: Direction::None,
            entry_price,
            stop_loss_price: Decimal::ZERO,
            take_profit_price: Decimal::ZERO,
            rationale: rationale.into(),
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.direction != Direction::None
    }

    /// Check the price-ordering invariant for directional signals.
    pub fn is_well_formed(&self) -> bool {
        match self.direction {
            Direction::Long => {
                self.stop_loss_price < self.entry_price && self.entry_price < self.take_profit_price
            }
            Direction::Short => {
                self.take_profit_price < self.entry_price && self.entry_price < self.stop_loss_price
            }
            Direction::None => true,
        }
    }
}
