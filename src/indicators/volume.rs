//! Volume confirmation.

use crate::models::PriceBar;

/// Ratio of the last bar's volume to the mean volume of the `lookback` bars
/// before it. `None` without enough history or when the feed has no volume.
pub fn volume_ratio(bars: &[PriceBar], lookback: usize) -> Option<f64> {
    if lookback == 0 || bars.len() < lookback + 1 {
        return None;
    }

    let (history, last) = bars.split_at(bars.len() - 1);
    let window = &history[history.len() - lookback..];
    let mean = window.iter().map(|b| b.volume).sum::<f64>() / lookback as f64;

    if mean <= 0.0 {
        return None;
    }

    Some(last[0].volume / mean)
}
