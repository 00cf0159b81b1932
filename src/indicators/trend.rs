//! Trend indicators: EMA.

use super::check_period;
use crate::error::DataError;

/// Exponential moving average, `alpha = 2/(period+1)`, seeded with the first value.
pub fn compute_ema(values: &[f64], period: usize) -> Result<Vec<f64>, DataError> {
    check_period("EMA", values.len(), period)?;

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut ema = Vec::with_capacity(values.len());
    let mut prev = values[0];
    ema.push(prev);

    for value in &values[1..] {
        prev = alpha * value + (1.0 - alpha) * prev;
        ema.push(prev);
    }

    Ok(ema)
}
