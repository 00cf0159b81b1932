//! Three-EMA trend filter gating which directions may be entered.

use std::fmt;

use serde::Serialize;

use super::config::TrendFilterConfig;
use crate::indicators::compute_ema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Sideways,
    /// Not enough history to read the slow EMA
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendStrength {
    Strong,
    Weak,
    Neutral,
}

/// Trend reading for the latest bar. Ephemeral, recomputed every tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendState {
    pub direction: TrendDirection,
    pub strength: TrendStrength,
    pub allow_buy: bool,
    pub allow_sell: bool,
    /// Last (fast, medium, slow) EMA values when available
    pub emas: Option<(f64, f64, f64)>,
}

impl TrendState {
    /// No opinion: both directions allowed.
    pub fn neutral() -> Self {
        Self {
            direction: TrendDirection::Neutral,
            strength: TrendStrength::Neutral,
            allow_buy: true,
            allow_sell: true,
            emas: None,
        }
    }
}

impl fmt::Display for TrendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?} (buy: {}, sell: {})",
            self.direction, self.strength, self.allow_buy, self.allow_sell
        )
    }
}

#[derive(Debug, Clone)]
pub struct TrendFilter {
    fast_period: usize,
    medium_period: usize,
    slow_period: usize,
    strength_threshold: f64,
}

impl TrendFilter {
    pub fn new(fast_period: usize, medium_period: usize, slow_period: usize, strength_threshold: f64) -> Self {
        Self {
            fast_period,
            medium_period,
            slow_period,
            strength_threshold,
        }
    }

    pub fn from_config(config: &TrendFilterConfig) -> Self {
        Self::new(
            config.fast_period,
            config.medium_period,
            config.slow_period,
            config.strength_threshold,
        )
    }

    /// Classify the trend at the last close.
    pub fn evaluate(&self, closes: &[f64]) -> TrendState {
        let Some(&price) = closes.last() else {
            return TrendState::neutral();
        };

        let last = |period| compute_ema(closes, period).ok().and_then(|ema| ema.last().copied());
        let (Some(fast), Some(medium), Some(slow)) =
            (last(self.fast_period), last(self.medium_period), last(self.slow_period))
        else {
            return TrendState::neutral();
        };

        let emas = Some((fast, medium, slow));

        if fast > medium && medium > slow && price > fast {
            let strong = slow > 0.0 && (fast - slow) / slow > self.strength_threshold;
            return TrendState {
                direction: TrendDirection::Up,
                strength: if strong { TrendStrength::Strong } else { TrendStrength::Weak },
                allow_buy: true,
                allow_sell: !strong,
                emas,
            };
        }

        if fast < medium && medium < slow && price < fast {
            let strong = slow > 0.0 && (slow - fast) / slow > self.strength_threshold;
            return TrendState {
                direction: TrendDirection::Down,
                strength: if strong { TrendStrength::Strong } else { TrendStrength::Weak },
                allow_buy: !strong,
                allow_sell: true,
                emas,
            };
        }

        TrendState {
            direction: TrendDirection::Sideways,
            strength: TrendStrength::Neutral,
            allow_buy: true,
            allow_sell: true,
            emas,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> TrendFilter {
        TrendFilter::new(20, 50, 200, 0.002)
    }

    #[test]
    fn test_rising_prices_are_uptrend() {
        let closes: Vec<f64> = (0..300).map(|i| 100.0 + i as f64).collect();
        let state = filter().evaluate(&closes);

        assert_eq!(state.direction, TrendDirection::Up);
        assert_eq!(state.strength, TrendStrength::Strong);
        assert!(state.allow_buy);
        assert!(!state.allow_sell);
    }

    #[test]
    fn test_falling_prices_block_buys() {
        let closes: Vec<f64> = (0..300).map(|i| 500.0 - i as f64).collect();
        let state = filter().evaluate(&closes);

        assert_eq!(state.direction, TrendDirection::Down);
        assert!(!state.allow_buy);
        assert!(state.allow_sell);
    }

    #[test]
    fn test_weak_trend_allows_both() {
        // Gap between fast and slow EMA stays well below a 5% threshold
        let closes: Vec<f64> = (0..300).map(|i| 100.0 + i as f64 * 0.001).collect();
        let state = TrendFilter::new(20, 50, 200, 0.05).evaluate(&closes);

        assert_eq!(state.direction, TrendDirection::Up);
        assert_eq!(state.strength, TrendStrength::Weak);
        assert!(state.allow_buy && state.allow_sell);
    }

    #[test]
    fn test_flat_prices_are_sideways() {
        let state = filter().evaluate(&[1.1; 250]);
        assert_eq!(state.direction, TrendDirection::Sideways);
        assert!(state.allow_buy && state.allow_sell);
    }

    #[test]
    fn test_short_history_is_neutral() {
        let closes: Vec<f64> = (0..100).map(|i| 100.0 + i as f64).collect();
        assert_eq!(filter().evaluate(&closes), TrendState::neutral());
        assert_eq!(filter().evaluate(&[]), TrendState::neutral());
    }
}
