//! Technical indicators over bar and price sequences.
//!
//! Every function is pure: it never mutates its input and returns bit-identical
//! output for identical input. Output series are aligned 1:1 with the input.

mod momentum;
mod trend;
mod volatility;
mod volume;

pub use momentum::compute_rsi;
pub use trend::compute_ema;
pub use volatility::{compute_atr, true_range};
pub use volume::volume_ratio;

use crate::error::DataError;

/// Shared argument checks: non-zero period, non-empty input, enough history.
pub(crate) fn check_period(indicator: &'static str, len: usize, period: usize) -> Result<(), DataError> {
    if period == 0 {
        return Err(DataError::InvalidPeriod { indicator, period });
    }
    if len == 0 {
        return Err(DataError::EmptySeries);
    }
    if len < period {
        return Err(DataError::InsufficientHistory {
            indicator,
            have: len,
            need: period,
        });
    }
    Ok(())
}
