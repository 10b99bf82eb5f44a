//! MACD computation over kline closes.
//!
//! Used by the REST adapter to fill in [`MacdSnapshot`] for a market snapshot.

use rust_decimal::Decimal;

use super::traits::{MacdSnapshot, MacdTrend};

/// Exponential moving average, seeded with the SMA of the first `period` values.
pub fn ema(values: &[Decimal], period: usize) -> Vec<Option<Decimal>> {
    let mut result = Vec::with_capacity(values.len());

    if values.is_empty() || period == 0 {
        return result;
    }

    let multiplier = Decimal::TWO / Decimal::from(period as u64 + 1);
    let mut ema_value: Option<Decimal> = None;

    for (i, &value) in values.iter().enumerate() {
        if i + 1 < period {
            result.push(None);
        } else if i + 1 == period {
            let sum: Decimal = values[..period].iter().copied().sum();
            ema_value = Some(sum / Decimal::from(period as u64));
            result.push(ema_value);
        } else if let Some(prev) = ema_value {
            let next = (value - prev) * multiplier + prev;
            ema_value = Some(next);
            result.push(Some(next));
        }
    }

    result
}

/// Latest MACD values, or `None` when there are not enough closes.
pub fn macd(closes: &[Decimal], fast: usize, slow: usize, signal: usize) -> Option<MacdSnapshot> {
    let fast_ema = ema(closes, fast);
    let slow_ema = ema(closes, slow);

    let line: Vec<Decimal> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .filter_map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(*f - *s),
            _ => None,
        })
        .collect();

    let signal_series = ema(&line, signal);
    let signal_value = signal_series.last().copied().flatten()?;
    let line_value = *line.last()?;
    let histogram = line_value - signal_value;

    let trend = if histogram > Decimal::ZERO && line_value > signal_value {
        MacdTrend::Bullish
    } else if histogram < Decimal::ZERO {
        MacdTrend::Bearish
    } else {
        MacdTrend::Neutral
    };

    Some(MacdSnapshot {
        line: line_value.round_dp(8),
        signal: signal_value.round_dp(8),
        histogram: histogram.round_dp(8),
        trend,
    })
}
