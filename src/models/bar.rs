//! OHLCV bar annotated with the indicator fields the signal rules read.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Indicator values attached to a bar once every input series is warmed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indicators {
    /// Value compared against the trend reference (the close for the trend rule set)
    pub trend_value: Decimal,

    /// Trend filter line, e.g. a 50-period EMA
    pub trend_reference: Decimal,

    /// Fast momentum line (MACD line)
    pub momentum_fast: Decimal,

    /// Momentum signal line (MACD signal)
    pub momentum_signal: Decimal,

    /// Volatility range used for stop/target distances (ATR)
    pub volatility_range: Decimal,

    /// Trend strength (ADX)
    pub directional_strength: Decimal,
}

/// A single time-indexed OHLCV record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,

    /// `None` until every indicator feeding the rules has enough history
    #[serde(default)]
    pub indicators: Option<Indicators>,
}

impl Bar {
    /// Create an un-annotated bar.
    pub fn new(
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            indicators: None,
        }
    }
}
