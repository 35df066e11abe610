//! Risk configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Risk budget and exchange constraints used to size every entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskParams {
    /// Fraction of balance lost if the stop is hit (0.0 to 1.0)
    pub risk_fraction: Decimal,

    /// Maximum notional as a multiple of balance
    pub leverage: u32,

    /// Minimum order notional accepted by the exchange, in quote currency
    pub min_notional: Decimal,

    /// Decimal places the exchange accepts for quantity (None = unrounded)
    pub quantity_precision: Option<u32>,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            risk_fraction: dec!(0.02),  // 2% of balance per trade
            leverage: 20,               // 20x cap
            min_notional: dec!(110),    // Binance floor is 100, keep margin
            quantity_precision: None,
        }
    }
}

impl RiskParams {
    pub fn leverage_cap(&self) -> Decimal {
        Decimal::from(self.leverage)
    }
}
