//! Momentum oscillators: RSI.

use super::check_period;
use crate::error::DataError;

/// Relative Strength Index with Wilder smoothing.
///
/// Average gain and loss are exponentially smoothed with `alpha = 1/period`,
/// seeded with the first price change. The first element is always `None`
/// because it has no prior close to diff against.
///
/// Flat prices (no gains, no losses) give 50; gains without losses give 100.
pub fn compute_rsi(closes: &[f64], period: usize) -> Result<Vec<Option<f64>>, DataError> {
    check_period("RSI", closes.len(), period)?;

    let alpha = 1.0 / period as f64;
    let mut values = Vec::with_capacity(closes.len());
    values.push(None);

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;

    for (i, pair) in closes.windows(2).enumerate() {
        let delta = pair[1] - pair[0];
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        if i == 0 {
            avg_gain = gain;
            avg_loss = loss;
        } else {
            avg_gain = alpha * gain + (1.0 - alpha) * avg_gain;
            avg_loss = alpha * loss + (1.0 - alpha) * avg_loss;
        }

        values.push(Some(rsi_from_averages(avg_gain, avg_loss)));
    }

    Ok(values)
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return if avg_gain == 0.0 { 50.0 } else { 100.0 };
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}
