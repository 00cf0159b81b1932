//! Volatility indicators: True Range, ATR.

use super::check_period;
use crate::error::DataError;
use crate::models::PriceBar;

/// True range of one bar. Without a previous close it is just `high - low`.
#[inline]
pub fn true_range(high: f64, low: f64, prev_close: Option<f64>) -> f64 {
    let hl = high - low;
    match prev_close {
        Some(pc) => hl.max((high - pc).abs()).max((low - pc).abs()),
        None => hl,
    }
}

/// Average True Range: EWM of true range with `alpha = 2/(period+1)`,
/// seeded with the first bar's range.
pub fn compute_atr(bars: &[PriceBar], period: usize) -> Result<Vec<f64>, DataError> {
    check_period("ATR", bars.len(), period)?;

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut atr = Vec::with_capacity(bars.len());
    let mut prev_close = None;
    let mut prev_atr = 0.0;

    for (i, bar) in bars.iter().enumerate() {
        let tr = true_range(bar.high, bar.low, prev_close);
        prev_atr = if i == 0 {
            tr
        } else {
            alpha * tr + (1.0 - alpha) * prev_atr
        };
        atr.push(prev_atr);
        prev_close = Some(bar.close);
    }

    Ok(atr)
}
