//! Signal generation: the generator contract, rule sets, and the registry that
//! selects one by configuration.

mod registry;
mod trend;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::indicators::IndicatorPeriods;
use crate::models::{Bar, Signal};

pub use registry::StrategyRegistry;
pub use trend::{TrendFollower, TrendParams};

/// A rule set that turns a bar window into a signal.
///
/// `on_bar` must be pure: the same window always yields the same signal.
pub trait SignalGenerator: Send + Sync {
    /// Registry identifier.
    fn id(&self) -> &'static str;

    /// Minimum window length before any directional signal can be produced.
    fn min_bars(&self) -> usize;

    /// Annotate raw bars with the indicator fields this rule set reads.
    fn add_indicators(&self, bars: &mut [Bar]);

    /// Evaluate the window ending at the current (last) bar.
    fn on_bar(&self, window: &[Bar]) -> Signal;
}

/// Strategy selection and parameter overrides, as found in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategySettings {
    /// Registry id, e.g. `trend_follow`
    pub id: String,

    pub adx_threshold: Option<Decimal>,
    pub sl_atr_mult: Option<Decimal>,
    pub tp_atr_mult: Option<Decimal>,
    pub min_bars: Option<usize>,
    pub periods: Option<IndicatorPeriods>,

    /// Route directional signals through the advisory filter
    pub use_advisor: bool,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            id: "trend_follow".to_string(),
            adx_threshold: None,
            sl_atr_mult: None,
            tp_atr_mult: None,
            min_bars: None,
            periods: None,
            use_advisor: false,
        }
    }
}
