//! Indicator annotation for raw OHLCV bars.
//!
//! EMA:  k = 2/(n+1), seeded with the SMA of the first n values.
//! Wilder smoothing (ATR, ADX): k = 1/n, seeded the same way.
//! MACD: EMA(fast) - EMA(slow), signal = EMA(signal) of the MACD line.
//! ADX:  Wilder-smoothed DX, where DX = 100 * |+DI - -DI| / (+DI + -DI).
//!
//! Every series is `None` until warmed up; a bar receives `Indicators` only when
//! all of them are available.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::{Bar, Indicators};

/// Rounding applied to intermediate values to keep Decimal scale bounded.
const SCALE: u32 = 12;

/// Periods for the trend rule set's indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorPeriods {
    pub trend_ema: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub atr: usize,
    pub adx: usize,
}

impl Default for IndicatorPeriods {
    fn default() -> Self {
        Self {
            trend_ema: 50,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            atr: 14,
            adx: 14,
        }
    }
}

impl IndicatorPeriods {
    /// Index of the first bar on which every indicator is valid.
    pub fn warmup(&self) -> usize {
        let ema = self.trend_ema.saturating_sub(1);
        let macd = self.macd_slow.max(self.macd_fast).saturating_sub(1)
            + self.macd_signal.saturating_sub(1);
        let atr = self.atr;
        let adx = 2 * self.adx.saturating_sub(1) + 1;
        ema.max(macd).max(atr).max(adx)
    }
}

/// Annotate bars in place. Bars past the warm-up get `Some(Indicators)`.
pub fn annotate(bars: &mut [Bar], periods: &IndicatorPeriods) {
    let closes: Vec<Option<Decimal>> = bars.iter().map(|b| Some(b.close)).collect();

    let trend = ema(&closes, periods.trend_ema);
    let (macd_line, macd_signal) = macd(
        &closes,
        periods.macd_fast,
        periods.macd_slow,
        periods.macd_signal,
    );
    let atr_series = atr(bars, periods.atr);
    let adx_series = adx(bars, periods.adx);

    for (i, bar) in bars.iter_mut().enumerate() {
        let row = (trend[i], macd_line[i], macd_signal[i], atr_series[i], adx_series[i]);
        bar.indicators = match row {
            (Some(reference), Some(fast), Some(signal), Some(range), Some(strength)) => {
                Some(Indicators {
                    trend_value: bar.close,
                    trend_reference: reference,
                    momentum_fast: fast,
                    momentum_signal: signal,
                    volatility_range: range,
                    directional_strength: strength,
                })
            }
            _ => None,
        };
    }
}

/// Recursive smoothing with factor `k`, seeded by the SMA of the first
/// `period` consecutive valid inputs.
fn smooth(values: &[Option<Decimal>], period: usize, k: Decimal) -> Vec<Option<Decimal>> {
    let mut out = vec![None; values.len()];
    if period == 0 {
        return out;
    }

    let mut run = 0usize;
    let mut sum = Decimal::ZERO;
    let mut current: Option<Decimal> = None;

    for (i, value) in values.iter().enumerate() {
        let Some(v) = *value else {
            run = 0;
            sum = Decimal::ZERO;
            current = None;
            continue;
        };

        current = match current {
            Some(prev) => Some((v * k + prev * (Decimal::ONE - k)).round_dp(SCALE)),
            None => {
                run += 1;
                sum += v;
                if run == period {
                    Some((sum / Decimal::from(period as u64)).round_dp(SCALE))
                } else {
                    None
                }
            }
        };
        out[i] = current;
    }

    out
}

/// Exponential moving average.
pub fn ema(values: &[Option<Decimal>], period: usize) -> Vec<Option<Decimal>> {
    let k = dec!(2) / Decimal::from(period as u64 + 1);
    smooth(values, period, k)
}

/// Wilder's moving average (RMA).
pub fn wilder(values: &[Option<Decimal>], period: usize) -> Vec<Option<Decimal>> {
    if period == 0 {
        return vec![None; values.len()];
    }
    let k = Decimal::ONE / Decimal::from(period as u64);
    smooth(values, period, k)
}

/// MACD line and signal line.
pub fn macd(
    closes: &[Option<Decimal>],
    fast: usize,
    slow: usize,
    signal: usize,
) -> (Vec<Option<Decimal>>, Vec<Option<Decimal>>) {
    let fast_ema = ema(closes, fast);
    let slow_ema = ema(closes, slow);

    let line: Vec<Option<Decimal>> = fast_ema
        .iter()
        .zip(&slow_ema)
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(*f - *s),
            _ => None,
        })
        .collect();

    let signal_line = ema(&line, signal);
    (line, signal_line)
}

/// True range; undefined on the first bar (no previous close).
fn true_range(bars: &[Bar]) -> Vec<Option<Decimal>> {
    let mut out = Vec::with_capacity(bars.len());
    for (i, bar) in bars.iter().enumerate() {
        if i == 0 {
            out.push(None);
            continue;
        }
        let prev_close = bars[i - 1].close;
        let tr = (bar.high - bar.low)
            .max((bar.high - prev_close).abs())
            .max((bar.low - prev_close).abs());
        out.push(Some(tr));
    }
    out
}

/// Average true range with Wilder smoothing.
pub fn atr(bars: &[Bar], period: usize) -> Vec<Option<Decimal>> {
    wilder(&true_range(bars), period)
}

/// Average directional index with Wilder smoothing.
pub fn adx(bars: &[Bar], period: usize) -> Vec<Option<Decimal>> {
    let mut plus_dm = Vec::with_capacity(bars.len());
    let mut minus_dm = Vec::with_capacity(bars.len());

    for (i, bar) in bars.iter().enumerate() {
        if i == 0 {
            plus_dm.push(None);
            minus_dm.push(None);
            continue;
        }
        let up = bar.high - bars[i - 1].high;
        let down = bars[i - 1].low - bar.low;
        plus_dm.push(Some(if up > down && up > Decimal::ZERO { up } else { Decimal::ZERO }));
        minus_dm.push(Some(if down > up && down > Decimal::ZERO { down } else { Decimal::ZERO }));
    }

    let atr_series = atr(bars, period);
    let plus_sm = wilder(&plus_dm, period);
    let minus_sm = wilder(&minus_dm, period);

    let hundred = dec!(100);
    let dx: Vec<Option<Decimal>> = (0..bars.len())
        .map(|i| match (atr_series[i], plus_sm[i], minus_sm[i]) {
            (Some(range), Some(p), Some(m)) if range > Decimal::ZERO => {
                let plus_di = hundred * p / range;
                let minus_di = hundred * m / range;
                let total = plus_di + minus_di;
                if total.is_zero() {
                    Some(Decimal::ZERO)
                } else {
                    Some((hundred * (plus_di - minus_di).abs() / total).round_dp(SCALE))
                }
            }
            (Some(_), Some(_), Some(_)) => Some(Decimal::ZERO),
            _ => None,
        })
        .collect();

    wilder(&dx, period)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn make_bars(closes: &[Decimal]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                Bar::new(
                    start + Duration::minutes(15 * i as i64),
                    c,
                    c + dec!(1),
                    c - dec!(1),
                    c,
                    dec!(100),
                )
            })
            .collect()
    }

    #[test]
    fn test_ema_seed_and_recursion() {
        let values: Vec<Option<Decimal>> = [dec!(10), dec!(20), dec!(30), dec!(40)]
            .into_iter()
            .map(Some)
            .collect();
        let out = ema(&values, 3);

        assert_eq!(out[0], None);
        assert_eq!(out[1], None);
        assert_eq!(out[2], Some(dec!(20)));
        // k = 0.5: 40 * 0.5 + 20 * 0.5
        assert_eq!(out[3], Some(dec!(30)));
    }

    #[test]
    fn test_atr_constant_range() {
        let bars = make_bars(&[dec!(100); 20]);
        let out = atr(&bars, 14);

        assert!(out[13].is_none());
        assert_eq!(out[14], Some(dec!(2)));
        assert_eq!(out[19], Some(dec!(2)));
    }

    #[test]
    fn test_adx_strong_uptrend() {
        let closes: Vec<Decimal> = (0..60).map(|i| dec!(100) + Decimal::from(i * 2)).collect();
        let bars = make_bars(&closes);
        let out = adx(&bars, 14);

        let last = out[59].expect("adx warmed up");
        assert!(last > dec!(90), "adx was {}", last);
    }

    #[test]
    fn test_annotate_warmup_boundary() {
        let closes: Vec<Decimal> = (0..80).map(|i| dec!(100) + Decimal::from(i)).collect();
        let mut bars = make_bars(&closes);
        let periods = IndicatorPeriods::default();
        annotate(&mut bars, &periods);

        let warmup = periods.warmup();
        assert_eq!(warmup, 49);
        assert!(bars[warmup - 1].indicators.is_none());

        let ind = bars[warmup].indicators.expect("annotated");
        assert_eq!(ind.trend_value, bars[warmup].close);
        assert!(ind.trend_value > ind.trend_reference);
        assert!(ind.volatility_range > Decimal::ZERO);
    }
}
