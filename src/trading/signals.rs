//! RSI entry/exit signal generation.

use serde::Serialize;

use super::config::{MomentumConfig, RsiConfig};
use super::trend_filter::TrendState;
use crate::error::ConfigError;

/// Entry signal for one RSI sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntrySignal {
    Buy,
    Sell,
    None,
}

/// Optional confirmations for the momentum-filtered entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct Confirmation<'a> {
    /// Current trend reading; `None` skips the trend gate
    pub trend: Option<&'a TrendState>,
    /// Current bar volume relative to its recent average
    pub volume_ratio: Option<f64>,
    /// Required volume ratio; `None` skips the volume gate
    pub min_volume_ratio: Option<f64>,
}

impl Confirmation<'_> {
    fn allows_buy(&self) -> bool {
        self.trend.map_or(true, |t| t.allow_buy) && self.volume_ok()
    }

    fn allows_sell(&self) -> bool {
        self.trend.map_or(true, |t| t.allow_sell) && self.volume_ok()
    }

    fn volume_ok(&self) -> bool {
        match self.min_volume_ratio {
            None => true,
            // Missing volume data never confirms
            Some(min) => self.volume_ratio.is_some_and(|ratio| ratio >= min),
        }
    }
}

/// Current signal levels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalSummary {
    pub oversold: f64,
    pub overbought: f64,
    pub exit_level: f64,
    pub momentum_enabled: bool,
}

/// Converts RSI readings into entry and exit decisions.
#[derive(Debug, Clone)]
pub struct SignalGenerator {
    oversold: f64,
    overbought: f64,
    exit_level: f64,
    momentum: Option<MomentumConfig>,
}

impl SignalGenerator {
    pub fn new(oversold: f64, overbought: f64, exit_level: f64) -> Result<Self, ConfigError> {
        check_levels(oversold, overbought, exit_level)?;
        Ok(Self {
            oversold,
            overbought,
            exit_level,
            momentum: None,
        })
    }

    pub fn from_config(rsi: &RsiConfig, momentum: &MomentumConfig) -> Result<Self, ConfigError> {
        let generator = Self::new(rsi.oversold, rsi.overbought, rsi.exit_level)?;
        Ok(if momentum.enabled {
            generator.with_momentum(momentum.clone())
        } else {
            generator
        })
    }

    /// Use momentum-filtered entries in [`SignalGenerator::entry`].
    pub fn with_momentum(mut self, momentum: MomentumConfig) -> Self {
        self.momentum = Some(momentum);
        self
    }

    pub fn should_enter_buy(&self, rsi: f64) -> bool {
        rsi < self.oversold
    }

    pub fn should_enter_sell(&self, rsi: f64) -> bool {
        rsi > self.overbought
    }

    pub fn should_exit_buy(&self, rsi: f64) -> bool {
        rsi > self.exit_level
    }

    pub fn should_exit_sell(&self, rsi: f64) -> bool {
        rsi < self.exit_level
    }

    /// Oversold and turning up: still inside the reversal zone and rising by
    /// at least the momentum threshold since the previous bar.
    pub fn should_enter_buy_momentum(&self, rsi: f64, prev_rsi: Option<f64>, confirm: &Confirmation<'_>) -> bool {
        let Some(prev) = prev_rsi else {
            return false;
        };
        let (threshold, offset) = self.momentum_params();

        self.should_enter_buy(rsi)
            && rsi >= self.oversold - offset
            && rsi - prev >= threshold
            && confirm.allows_buy()
    }

    /// Mirror of [`Self::should_enter_buy_momentum`] for the overbought side.
    pub fn should_enter_sell_momentum(&self, rsi: f64, prev_rsi: Option<f64>, confirm: &Confirmation<'_>) -> bool {
        let Some(prev) = prev_rsi else {
            return false;
        };
        let (threshold, offset) = self.momentum_params();

        self.should_enter_sell(rsi)
            && rsi <= self.overbought + offset
            && prev - rsi >= threshold
            && confirm.allows_sell()
    }

    /// Entry decision for the latest bar using the configured variant.
    ///
    /// The plain variant ignores `confirm`; the trend gate is applied by the
    /// caller in that case.
    pub fn entry(&self, rsi: f64, prev_rsi: Option<f64>, confirm: &Confirmation<'_>) -> EntrySignal {
        if self.momentum.is_some() {
            if self.should_enter_buy_momentum(rsi, prev_rsi, confirm) {
                EntrySignal::Buy
            } else if self.should_enter_sell_momentum(rsi, prev_rsi, confirm) {
                EntrySignal::Sell
            } else {
                EntrySignal::None
            }
        } else {
            self.classify(rsi)
        }
    }

    /// Plain entry signal for every sample of an RSI series.
    pub fn entry_signals(&self, rsi: &[Option<f64>]) -> Vec<EntrySignal> {
        rsi.iter()
            .map(|sample| sample.map_or(EntrySignal::None, |value| self.classify(value)))
            .collect()
    }

    /// Replace the levels. Nothing changes if the new levels are invalid.
    pub fn update_levels(&mut self, oversold: f64, overbought: f64, exit_level: f64) -> Result<(), ConfigError> {
        check_levels(oversold, overbought, exit_level)?;
        self.oversold = oversold;
        self.overbought = overbought;
        self.exit_level = exit_level;
        Ok(())
    }

    pub fn summary(&self) -> SignalSummary {
        SignalSummary {
            oversold: self.oversold,
            overbought: self.overbought,
            exit_level: self.exit_level,
            momentum_enabled: self.uses_momentum(),
        }
    }

    pub fn uses_momentum(&self) -> bool {
        self.momentum.is_some()
    }

    fn classify(&self, rsi: f64) -> EntrySignal {
        if self.should_enter_buy(rsi) {
            EntrySignal::Buy
        } else if self.should_enter_sell(rsi) {
            EntrySignal::Sell
        } else {
            EntrySignal::None
        }
    }

    fn momentum_params(&self) -> (f64, f64) {
        let defaults = MomentumConfig::default();
        let m = self.momentum.as_ref().unwrap_or(&defaults);
        (m.threshold, m.extreme_offset)
    }
}

fn check_levels(oversold: f64, overbought: f64, exit_level: f64) -> Result<(), ConfigError> {
    for (name, value) in [
        ("oversold", oversold),
        ("overbought", overbought),
        ("exit_level", exit_level),
    ] {
        if !(0.0..=100.0).contains(&value) {
            return Err(ConfigError::LevelOutOfRange { name, value });
        }
    }
    if oversold >= overbought {
        return Err(ConfigError::InvalidRsiLevels { oversold, overbought });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::trend_filter::{TrendDirection, TrendStrength};

    fn generator() -> SignalGenerator {
        SignalGenerator::new(30.0, 70.0, 50.0).unwrap()
    }

    fn momentum_generator() -> SignalGenerator {
        generator().with_momentum(MomentumConfig {
            enabled: true,
            ..Default::default()
        })
    }

    #[test]
    fn test_basic_levels() {
        let g = generator();
        assert!(g.should_enter_buy(29.9));
        assert!(!g.should_enter_buy(30.0));
        assert!(g.should_enter_sell(70.1));
        assert!(!g.should_enter_sell(70.0));
        assert!(g.should_exit_buy(50.1));
        assert!(g.should_exit_sell(49.9));
        assert!(!g.should_exit_buy(50.0) && !g.should_exit_sell(50.0));
    }

    #[test]
    fn test_rejects_inverted_levels() {
        assert!(matches!(
            SignalGenerator::new(70.0, 30.0, 50.0),
            Err(ConfigError::InvalidRsiLevels { .. })
        ));
        assert!(matches!(
            SignalGenerator::new(30.0, 30.0, 50.0),
            Err(ConfigError::InvalidRsiLevels { .. })
        ));
        assert!(matches!(
            SignalGenerator::new(-1.0, 70.0, 50.0),
            Err(ConfigError::LevelOutOfRange { .. })
        ));
    }

    #[test]
    fn test_update_levels_keeps_old_on_error() {
        let mut g = generator();
        assert!(g.update_levels(80.0, 20.0, 50.0).is_err());
        assert_eq!(g.summary().oversold, 30.0);

        g.update_levels(25.0, 75.0, 50.0).unwrap();
        assert_eq!(g.summary().overbought, 75.0);
        assert!(!g.summary().momentum_enabled);
    }

    #[test]
    fn test_momentum_requires_previous_rsi() {
        let g = momentum_generator();
        let confirm = Confirmation::default();
        assert!(!g.should_enter_buy_momentum(25.0, None, &confirm));
        assert!(!g.should_enter_sell_momentum(75.0, None, &confirm));
        assert_eq!(g.entry(25.0, None, &confirm), EntrySignal::None);
    }

    #[test]
    fn test_momentum_buy_needs_recovery() {
        let g = momentum_generator();
        let confirm = Confirmation::default();

        // Turning up by 3 points from 22
        assert!(g.should_enter_buy_momentum(25.0, Some(22.0), &confirm));
        // Still falling
        assert!(!g.should_enter_buy_momentum(25.0, Some(27.0), &confirm));
        // Rising, but less than the threshold
        assert!(!g.should_enter_buy_momentum(25.0, Some(24.0), &confirm));
        // Past the secondary extreme (30 - 10)
        assert!(!g.should_enter_buy_momentum(15.0, Some(10.0), &confirm));
    }

    #[test]
    fn test_momentum_sell_mirrors_buy() {
        let g = momentum_generator();
        let confirm = Confirmation::default();

        assert!(g.should_enter_sell_momentum(75.0, Some(78.0), &confirm));
        assert!(!g.should_enter_sell_momentum(75.0, Some(73.0), &confirm));
        assert!(!g.should_enter_sell_momentum(85.0, Some(90.0), &confirm));
        assert_eq!(g.entry(75.0, Some(78.0), &confirm), EntrySignal::Sell);
    }

    #[test]
    fn test_momentum_confirmations() {
        let g = momentum_generator();
        let down = TrendState {
            direction: TrendDirection::Down,
            strength: TrendStrength::Strong,
            allow_buy: false,
            allow_sell: true,
            emas: None,
        };

        let trend_blocked = Confirmation {
            trend: Some(&down),
            ..Default::default()
        };
        assert!(!g.should_enter_buy_momentum(25.0, Some(22.0), &trend_blocked));

        let low_volume = Confirmation {
            volume_ratio: Some(0.8),
            min_volume_ratio: Some(1.0),
            ..Default::default()
        };
        assert!(!g.should_enter_buy_momentum(25.0, Some(22.0), &low_volume));

        let no_volume = Confirmation {
            min_volume_ratio: Some(1.0),
            ..Default::default()
        };
        assert!(!g.should_enter_buy_momentum(25.0, Some(22.0), &no_volume));

        let high_volume = Confirmation {
            volume_ratio: Some(1.4),
            min_volume_ratio: Some(1.0),
            ..Default::default()
        };
        assert!(g.should_enter_buy_momentum(25.0, Some(22.0), &high_volume));
    }

    #[test]
    fn test_entry_signals_over_series() {
        let g = generator();
        let signals = g.entry_signals(&[None, Some(25.0), Some(50.0), Some(75.0)]);
        assert_eq!(
            signals,
            vec![EntrySignal::None, EntrySignal::Buy, EntrySignal::None, EntrySignal::Sell]
        );
    }
}
