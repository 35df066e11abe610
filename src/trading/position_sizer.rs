//! Risk-budget position sizing with exchange notional and leverage clamps.

use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

use super::RiskParams;

/// Why an entry could not be sized. Every variant means "skip this entry".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SizingRejection {
    #[error("stop price equals entry price")]
    ZeroStopDistance,

    #[error("balance {0} is not positive")]
    NonPositiveBalance(Decimal),

    #[error("minimum notional {min_notional} exceeds leverage cap {cap}")]
    LeverageCapExceeded { min_notional: Decimal, cap: Decimal },

    #[error("quantity rounds to zero at {0} decimal places")]
    BelowPrecision(u32),
}

/// Size an entry so that hitting the stop loses `balance * risk_fraction`.
///
/// Clamps are applied in order: the quantity is raised to meet `min_notional`,
/// then capped at `balance * leverage_cap` notional. A floor that itself
/// breaches the cap is rejected rather than traded at excess leverage.
pub fn size(
    balance: Decimal,
    entry_price: Decimal,
    stop_loss_price: Decimal,
    risk_fraction: Decimal,
    leverage_cap: Decimal,
    min_notional: Decimal,
) -> Result<Decimal, SizingRejection> {
    let distance = (entry_price - stop_loss_price).abs();
    if distance.is_zero() || entry_price <= Decimal::ZERO {
        return Err(SizingRejection::ZeroStopDistance);
    }
    if balance <= Decimal::ZERO {
        return Err(SizingRejection::NonPositiveBalance(balance));
    }

    let mut quantity = balance * risk_fraction / distance;
    let cap = balance * leverage_cap;

    // (a) notional floor
    if quantity * entry_price < min_notional {
        if min_notional > cap {
            return Err(SizingRejection::LeverageCapExceeded { min_notional, cap });
        }
        quantity = min_notional / entry_price;
    }

    // (b) leverage cap
    if quantity * entry_price > cap {
        quantity = cap / entry_price;
    }

    Ok(quantity)
}

/// Sizer bound to one account's risk parameters.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    params: RiskParams,
}

impl PositionSizer {
    pub fn new(params: RiskParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &RiskParams {
        &self.params
    }

    /// Unrounded quantity, as used by the simulation driver.
    pub fn size(
        &self,
        balance: Decimal,
        entry_price: Decimal,
        stop_loss_price: Decimal,
    ) -> Result<Decimal, SizingRejection> {
        size(
            balance,
            entry_price,
            stop_loss_price,
            self.params.risk_fraction,
            self.params.leverage_cap(),
            self.params.min_notional,
        )
    }

    /// Quantity rounded to the exchange's precision, for order submission.
    ///
    /// Rounds down, except when that would leave the notional under
    /// `min_notional`: then it rounds up and the leverage cap is checked again.
    pub fn size_for_order(
        &self,
        balance: Decimal,
        entry_price: Decimal,
        stop_loss_price: Decimal,
    ) -> Result<Decimal, SizingRejection> {
        let quantity = self.size(balance, entry_price, stop_loss_price)?;
        let Some(dp) = self.params.quantity_precision else {
            return Ok(quantity);
        };

        let mut rounded = quantity.round_dp_with_strategy(dp, RoundingStrategy::ToZero);
        if rounded * entry_price < self.params.min_notional {
            rounded = quantity.round_dp_with_strategy(dp, RoundingStrategy::AwayFromZero);
            let cap = balance * self.params.leverage_cap();
            if rounded * entry_price > cap {
                return Err(SizingRejection::LeverageCapExceeded {
                    min_notional: self.params.min_notional,
                    cap,
                });
            }
        }
        if rounded.is_zero() {
            return Err(SizingRejection::BelowPrecision(dp));
        }
        Ok(rounded)
    }
}
