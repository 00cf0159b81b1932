//! Trading configuration.
//!
//! Every section has documented defaults; a JSON file may override any subset
//! of keys. [`TradingConfig::validate`] is the single place configuration
//! errors are raised, and it runs before the bot starts.

use std::path::Path;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::trailing_stop::{TrailingPreset, TrailingStopParams};
use crate::error::ConfigError;
use crate::models::Timeframe;

/// Top-level configuration consumed by the trading core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Instrument to trade (broker symbol)
    pub symbol: String,

    /// Bar timeframe polled from the broker
    pub timeframe: Timeframe,

    /// Number of bars fetched per tick
    pub bars_count: usize,

    /// Seconds between polls
    pub poll_interval_secs: u64,

    /// Tag attached to every order so the broker can attribute it
    pub magic_number: u64,

    pub rsi: RsiConfig,
    pub atr: AtrConfig,
    pub momentum: MomentumConfig,
    pub trend_filter: TrendFilterConfig,
    pub trailing_stops: TrailingStopConfig,
    pub risk: RiskConfig,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbol: "EURUSD".to_string(),
            timeframe: Timeframe::M15,
            bars_count: 250,
            poll_interval_secs: 5,
            magic_number: 12345,
            rsi: RsiConfig::default(),
            atr: AtrConfig::default(),
            momentum: MomentumConfig::default(),
            trend_filter: TrendFilterConfig::default(),
            trailing_stops: TrailingStopConfig::default(),
            risk: RiskConfig::default(),
        }
    }
}

/// RSI signal levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RsiConfig {
    pub period: usize,
    /// Buy below this level
    pub oversold: f64,
    /// Sell above this level
    pub overbought: f64,
    /// Exit level for the RSI exit fallback
    pub exit_level: f64,
}

impl Default for RsiConfig {
    fn default() -> Self {
        Self {
            period: 14,
            oversold: 30.0,
            overbought: 70.0,
            exit_level: 50.0,
        }
    }
}

/// ATR period and the stop multiplier used when trailing stops are off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AtrConfig {
    pub period: usize,
    pub stop_multiplier: Decimal,
}

impl Default for AtrConfig {
    fn default() -> Self {
        Self {
            period: 14,
            stop_multiplier: dec!(2.0),
        }
    }
}

/// Momentum-filtered entry variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentumConfig {
    pub enabled: bool,
    /// Minimum RSI change from the previous bar toward the exit level
    pub threshold: f64,
    /// Distance beyond oversold/overbought where the reversal zone ends
    pub extreme_offset: f64,
    /// Require above-average volume on the signal bar
    pub volume_confirmation: bool,
    pub volume_lookback: usize,
    pub min_volume_ratio: f64,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 2.0,
            extreme_offset: 10.0,
            volume_confirmation: false,
            volume_lookback: 20,
            min_volume_ratio: 1.0,
        }
    }
}

/// Three-EMA trend filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendFilterConfig {
    pub enabled: bool,
    pub fast_period: usize,
    pub medium_period: usize,
    pub slow_period: usize,
    /// Relative fast/slow EMA gap above which a trend counts as strong
    pub strength_threshold: f64,
}

impl Default for TrendFilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fast_period: 20,
            medium_period: 50,
            slow_period: 200,
            strength_threshold: 0.002,
        }
    }
}

/// Trailing stop strategy selection. Per-stage values override the preset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingStopConfig {
    pub enabled: bool,
    /// Preset name: A (pure trailing), B (time based), C (aggressive)
    pub strategy: String,
    pub breakeven_trigger: Option<Decimal>,
    pub trail_distance: Option<Decimal>,
    pub hard_stop_distance: Option<Decimal>,
    /// Breakeven stop offset from entry, in ATR
    pub breakeven_buffer: Decimal,
}

impl Default for TrailingStopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: "A".to_string(),
            breakeven_trigger: None,
            trail_distance: None,
            hard_stop_distance: None,
            breakeven_buffer: dec!(0.1),
        }
    }
}

impl TrailingStopConfig {
    /// Resolve the preset and apply overrides.
    pub fn params(&self) -> Result<TrailingStopParams, ConfigError> {
        let preset: TrailingPreset = self.strategy.parse()?;
        let mut params = preset.params();

        if let Some(v) = self.breakeven_trigger {
            params.breakeven_trigger = v;
        }
        if let Some(v) = self.trail_distance {
            params.trail_distance = v;
        }
        if let Some(v) = self.hard_stop_distance {
            params.hard_stop_distance = v;
        }
        params.breakeven_buffer = self.breakeven_buffer;

        Ok(params)
    }
}

/// Per-trade and portfolio risk limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Percent of balance risked per trade
    pub risk_per_trade_percent: Decimal,
    /// Hard cap on the per-trade risk percent
    pub max_risk_per_trade_percent: Decimal,
    /// Cap on the sum of open risk across all tracked positions
    pub max_total_risk_percent: Decimal,
    /// Maximum notional exposure of one position as percent of balance
    pub max_exposure_percent: Decimal,
    pub min_lot: Decimal,
    /// Optional absolute lot ceiling applied last
    pub max_lot: Option<Decimal>,
    /// Size used when no usable stop distance exists
    pub fallback_lot: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade_percent: dec!(1.0),
            max_risk_per_trade_percent: dec!(2.0),
            max_total_risk_percent: dec!(6.0),
            max_exposure_percent: dec!(1000),
            min_lot: dec!(0.01),
            max_lot: None,
            fallback_lot: dec!(0.1),
        }
    }
}

impl TradingConfig {
    /// Load from a JSON file, or defaults when `path` is `None`. Always validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_json(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::invalid("symbol", "must not be empty"));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::invalid("poll_interval_secs", "must be > 0"));
        }

        for (name, value) in [
            ("rsi.oversold", self.rsi.oversold),
            ("rsi.overbought", self.rsi.overbought),
            ("rsi.exit_level", self.rsi.exit_level),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::LevelOutOfRange { name, value });
            }
        }
        if self.rsi.oversold >= self.rsi.overbought {
            return Err(ConfigError::InvalidRsiLevels {
                oversold: self.rsi.oversold,
                overbought: self.rsi.overbought,
            });
        }

        for (key, period) in [
            ("rsi.period", self.rsi.period),
            ("atr.period", self.atr.period),
            ("trend_filter.fast_period", self.trend_filter.fast_period),
            ("trend_filter.medium_period", self.trend_filter.medium_period),
            ("trend_filter.slow_period", self.trend_filter.slow_period),
        ] {
            if period == 0 {
                return Err(ConfigError::invalid(key, "period must be > 0"));
            }
        }

        let needed = self.min_bars();
        if self.bars_count < needed {
            return Err(ConfigError::invalid(
                "bars_count",
                format!("{} bars cannot cover the longest indicator period {}", self.bars_count, needed),
            ));
        }

        if self.trend_filter.strength_threshold < 0.0 {
            return Err(ConfigError::invalid("trend_filter.strength_threshold", "must be >= 0"));
        }
        if self.momentum.threshold < 0.0 || self.momentum.extreme_offset < 0.0 {
            return Err(ConfigError::invalid("momentum", "threshold and extreme_offset must be >= 0"));
        }

        let params = self.trailing_stops.params()?;
        if params.hard_stop_distance <= Decimal::ZERO || params.trail_distance <= Decimal::ZERO {
            return Err(ConfigError::invalid(
                "trailing_stops",
                "hard_stop_distance and trail_distance must be > 0",
            ));
        }
        if self.atr.stop_multiplier <= Decimal::ZERO {
            return Err(ConfigError::invalid("atr.stop_multiplier", "must be > 0"));
        }

        let risk = &self.risk;
        if risk.risk_per_trade_percent <= Decimal::ZERO {
            return Err(ConfigError::invalid("risk.risk_per_trade_percent", "must be > 0"));
        }
        if risk.max_risk_per_trade_percent <= Decimal::ZERO || risk.max_total_risk_percent <= Decimal::ZERO {
            return Err(ConfigError::invalid("risk", "risk caps must be > 0"));
        }
        if risk.min_lot <= Decimal::ZERO {
            return Err(ConfigError::invalid("risk.min_lot", "must be > 0"));
        }
        if let Some(max_lot) = risk.max_lot {
            if max_lot < risk.min_lot {
                return Err(ConfigError::invalid("risk.max_lot", "must be >= min_lot"));
            }
        }

        Ok(())
    }

    /// Fewest bars needed for every enabled indicator.
    pub fn min_bars(&self) -> usize {
        let mut needed = (self.rsi.period + 1).max(self.atr.period);
        if self.trend_filter.enabled {
            needed = needed.max(self.trend_filter.slow_period);
        }
        needed
    }
}
