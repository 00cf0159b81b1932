//! Trading logic: configuration, signals, trend filter, risk sizing, trailing stops.

mod config;
mod risk;
mod signals;
mod trailing_stop;
mod trend_filter;

pub use config::{
    AtrConfig, MomentumConfig, RiskConfig, RsiConfig, TradingConfig, TrailingStopConfig,
    TrendFilterConfig,
};
pub use risk::{
    calc_fixed_stop_loss, calc_position_size, calc_stop_loss, can_open_position, is_jpy_pair,
    pip_size, risk_reward_ratio, validate_stop_loss, DynamicSizer, RiskCheck, RiskManager,
    SizingDecision, DEFAULT_FALLBACK_LOT,
};
pub use signals::{Confirmation, EntrySignal, SignalGenerator, SignalSummary};
pub use trailing_stop::{
    StopAdjustment, StopReason, StopStatistics, StopUpdate, TrackedPosition, TrailingPreset,
    TrailingStopManager, TrailingStopParams,
};
pub use trend_filter::{TrendDirection, TrendFilter, TrendState, TrendStrength};
