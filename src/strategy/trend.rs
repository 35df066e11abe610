//! Trend-following rule set: trend filter + momentum confirmation, gated by
//! trend strength, with volatility-scaled stop and target.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::indicators::{self, IndicatorPeriods};
use crate::models::{Bar, Direction, Signal};

use super::{SignalGenerator, StrategySettings};

/// Parameters of the trend rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendParams {
    /// Minimum ADX on the confirmation bar
    pub adx_threshold: Decimal,

    /// Stop distance in ATR multiples
    pub sl_atr_mult: Decimal,

    /// Target distance in ATR multiples
    pub tp_atr_mult: Decimal,

    /// Bars required before evaluating
    pub min_bars: usize,

    pub periods: IndicatorPeriods,
}

impl Default for TrendParams {
    fn default() -> Self {
        Self {
            adx_threshold: dec!(15),
            sl_atr_mult: dec!(2.0),
            tp_atr_mult: dec!(3.0),
            min_bars: 55,
            periods: IndicatorPeriods::default(),
        }
    }
}

impl TrendParams {
    /// Wide-target preset: same entries, 8x ATR target.
    pub fn aggressive() -> Self {
        Self {
            tp_atr_mult: dec!(8.0),
            ..Self::default()
        }
    }

    /// Apply explicit overrides from config on top of a preset.
    pub fn with_overrides(mut self, settings: &StrategySettings) -> Self {
        if let Some(v) = settings.adx_threshold {
            self.adx_threshold = v;
        }
        if let Some(v) = settings.sl_atr_mult {
            self.sl_atr_mult = v;
        }
        if let Some(v) = settings.tp_atr_mult {
            self.tp_atr_mult = v;
        }
        if let Some(v) = settings.min_bars {
            self.min_bars = v;
        }
        if let Some(p) = settings.periods {
            self.periods = p;
        }
        self
    }
}

/// Trend follower.
///
/// Decides on the second-to-last (closed, confirmed) bar and prices off the
/// last bar's close, so no indicator value from an unfinished bar is read.
pub struct TrendFollower {
    id: &'static str,
    params: TrendParams,
}

impl TrendFollower {
    pub fn new(id: &'static str, params: TrendParams) -> Self {
        Self { id, params }
    }

    pub fn params(&self) -> &TrendParams {
        &self.params
    }
}

impl SignalGenerator for TrendFollower {
    fn id(&self) -> &'static str {
        self.id
    }

    fn min_bars(&self) -> usize {
        // Confirmation bar must itself be past the indicator warm-up
        self.params.min_bars.max(self.params.periods.warmup() + 2)
    }

    fn add_indicators(&self, bars: &mut [Bar]) {
        if bars.iter().any(|b| b.indicators.is_some()) {
            return;
        }
        indicators::annotate(bars, &self.params.periods);
    }

    fn on_bar(&self, window: &[Bar]) -> Signal {
        let Some(current) = window.last() else {
            return Signal::none(Decimal::ZERO, "no data");
        };
        let price = current.close;

        if window.len() < self.min_bars() {
            return Signal::none(
                price,
                format!("warming up ({}/{} bars)", window.len(), self.min_bars()),
            );
        }

        let confirm = &window[window.len() - 2];
        let Some(ind) = confirm.indicators else {
            return Signal::none(price, "indicators not ready");
        };

        let mut rationale = format!("ADX:{:.1}", ind.directional_strength);

        if ind.directional_strength <= self.params.adx_threshold {
            return Signal::none(price, rationale);
        }

        let trend_long = ind.trend_value > ind.trend_reference;
        let trend_short = ind.trend_value < ind.trend_reference;
        let momentum_bull = ind.momentum_fast > ind.momentum_signal;
        let momentum_bear = ind.momentum_fast < ind.momentum_signal;

        let stop_distance = ind.volatility_range * self.params.sl_atr_mult;
        let target_distance = ind.volatility_range * self.params.tp_atr_mult;

        let signal = if trend_long && momentum_bull {
            rationale.push_str(" | trend+momentum bull");
            Signal {
                direction: Direction::Long,
                entry_price: price,
                stop_loss_price: price - stop_distance,
                take_profit_price: price + target_distance,
                rationale,
            }
        } else if trend_short && momentum_bear {
            rationale.push_str(" | trend+momentum bear");
            Signal {
                direction: Direction::Short,
                entry_price: price,
                stop_loss_price: price + stop_distance,
                take_profit_price: price - target_distance,
                rationale,
            }
        } else {
            return Signal::none(price, rationale);
        };

        // Zero volatility collapses stop/target onto the entry
        if !signal.is_well_formed() {
            return Signal::none(price, format!("{} | degenerate levels", signal.rationale));
        }

        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Indicators;
    use chrono::{Duration, TimeZone, Utc};

    fn bars(n: usize) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                Bar::new(
                    start + Duration::hours(i as i64),
                    dec!(100),
                    dec!(101),
                    dec!(99),
                    dec!(100),
                    dec!(10),
                )
            })
            .collect()
    }

    fn indicators(trend_value: Decimal, adx: Decimal, fast: Decimal) -> Indicators {
        Indicators {
            trend_value,
            trend_reference: dec!(100),
            momentum_fast: fast,
            momentum_signal: dec!(0),
            volatility_range: dec!(2),
            directional_strength: adx,
        }
    }

    fn follower() -> TrendFollower {
        TrendFollower::new("trend_follow", TrendParams::default())
    }

    #[test]
    fn test_short_window_returns_none() {
        let strategy = follower();
        for n in 0..strategy.min_bars() {
            let window = bars(n);
            assert_eq!(strategy.on_bar(&window).direction, Direction::None);
        }
    }

    #[test]
    fn test_long_uses_confirmation_bar_and_current_close() {
        let strategy = follower();
        let mut window = bars(60);
        let len = window.len();
        window[len - 2].indicators = Some(indicators(dec!(105), dec!(25), dec!(1)));
        window[len - 1].close = dec!(110);
        // Last bar's own indicators must be ignored
        window[len - 1].indicators = Some(indicators(dec!(90), dec!(5), dec!(-1)));

        let signal = strategy.on_bar(&window);
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.entry_price, dec!(110));
        assert_eq!(signal.stop_loss_price, dec!(106));
        assert_eq!(signal.take_profit_price, dec!(116));
        assert!(signal.rationale.starts_with("ADX:25.0"));
    }

    #[test]
    fn test_short_signal_mirrors_levels() {
        let strategy = follower();
        let mut window = bars(60);
        let len = window.len();
        window[len - 2].indicators = Some(indicators(dec!(95), dec!(30), dec!(-1)));

        let signal = strategy.on_bar(&window);
        assert_eq!(signal.direction, Direction::Short);
        assert_eq!(signal.stop_loss_price, dec!(104));
        assert_eq!(signal.take_profit_price, dec!(94));
        assert!(signal.is_well_formed());
    }

    #[test]
    fn test_weak_trend_is_filtered() {
        let strategy = follower();
        let mut window = bars(60);
        let len = window.len();
        window[len - 2].indicators = Some(indicators(dec!(105), dec!(15), dec!(1)));

        assert_eq!(strategy.on_bar(&window).direction, Direction::None);
    }

    #[test]
    fn test_on_bar_is_idempotent() {
        let strategy = follower();
        let mut window = bars(60);
        let len = window.len();
        window[len - 2].indicators = Some(indicators(dec!(105), dec!(40), dec!(1)));

        assert_eq!(strategy.on_bar(&window), strategy.on_bar(&window));
    }

    #[test]
    fn test_overrides_apply_on_top_of_preset() {
        let settings = StrategySettings {
            sl_atr_mult: Some(dec!(1.5)),
            ..Default::default()
        };
        let params = TrendParams::aggressive().with_overrides(&settings);
        assert_eq!(params.sl_atr_mult, dec!(1.5));
        assert_eq!(params.tp_atr_mult, dec!(8.0));
    }
}
