//! Staged trailing stop-loss.
//!
//! Each position moves through three stages:
//!
//! 1. Initial: hard stop `hard_stop_distance` x ATR from entry.
//! 2. Breakeven: once profit reaches `breakeven_trigger` x ATR the stop jumps
//!    to entry plus `breakeven_buffer` x ATR in the trade's favour. One way.
//! 3. Trailing: on every later tick in profit the stop follows the peak (or
//!    trough) at `trail_distance` x ATR, adopted only if strictly tighter.
//!
//! The manager never talks to the broker. [`TrailingStopManager::evaluate`]
//! proposes a stop and [`TrailingStopManager::apply`] commits it once the
//! broker has accepted the modification.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use super::config::TrailingStopConfig;
use crate::error::ConfigError;
use crate::models::{Position, Side};

/// Stage multipliers, all in ATR.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrailingStopParams {
    pub breakeven_trigger: Decimal,
    pub trail_distance: Decimal,
    pub hard_stop_distance: Decimal,
    pub breakeven_buffer: Decimal,
}

impl Default for TrailingStopParams {
    fn default() -> Self {
        TrailingPreset::PureTrailing.params()
    }
}

/// Named parameter sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailingPreset {
    /// A: breakeven at 1.5, trail 1.0, hard stop 2.0
    PureTrailing,
    /// B: breakeven at 2.0, trail 1.5, hard stop 2.5
    TimeBased,
    /// C: breakeven at 0.5, trail 0.25, hard stop 0.5
    Aggressive,
}

impl TrailingPreset {
    pub fn params(&self) -> TrailingStopParams {
        let (breakeven_trigger, trail_distance, hard_stop_distance) = match self {
            Self::PureTrailing => (dec!(1.5), dec!(1.0), dec!(2.0)),
            Self::TimeBased => (dec!(2.0), dec!(1.5), dec!(2.5)),
            Self::Aggressive => (dec!(0.5), dec!(0.25), dec!(0.5)),
        };
        TrailingStopParams {
            breakeven_trigger,
            trail_distance,
            hard_stop_distance,
            breakeven_buffer: dec!(0.1),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::PureTrailing => "A",
            Self::TimeBased => "B",
            Self::Aggressive => "C",
        }
    }
}

impl FromStr for TrailingPreset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "a" | "pure_trailing" => Ok(Self::PureTrailing),
            "b" | "time_based" => Ok(Self::TimeBased),
            "c" | "aggressive" => Ok(Self::Aggressive),
            _ => Err(ConfigError::UnknownTrailingStrategy(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StopReason {
    Breakeven,
    Trailing,
    Unchanged,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Breakeven => "BREAKEVEN",
            Self::Trailing => "TRAILING",
            Self::Unchanged => "UNCHANGED",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One committed stop move.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopAdjustment {
    pub old_stop: Decimal,
    pub new_stop: Decimal,
    pub reason: StopReason,
    pub highest_price: Decimal,
    pub lowest_price: Decimal,
    pub at: DateTime<Utc>,
}

/// Shadow record for one broker position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedPosition {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub volume: Decimal,
    pub opened_at: DateTime<Utc>,
    pub highest_price: Decimal,
    pub lowest_price: Decimal,
    pub breakeven_triggered: bool,
    pub initial_stop: Decimal,
    pub current_stop: Decimal,
    pub adjustments: Vec<StopAdjustment>,
}

impl TrackedPosition {
    /// Whether this record describes `position` (same ticket, same open time).
    pub fn matches(&self, position: &Position) -> bool {
        self.ticket == position.ticket && self.opened_at == position.open_time
    }
}

/// Proposed stop for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StopUpdate {
    pub previous_stop: Decimal,
    pub new_stop: Decimal,
    pub reason: StopReason,
}

impl StopUpdate {
    /// The broker needs a modify call for this update.
    pub fn moves_stop(&self) -> bool {
        self.new_stop != self.previous_stop
    }
}

/// Read-only summary of a tracked position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopStatistics {
    pub ticket: u64,
    pub adjustments: usize,
    pub breakeven_triggered: bool,
    pub initial_stop: Decimal,
    pub current_stop: Decimal,
    pub highest_price: Decimal,
    pub lowest_price: Decimal,
    /// Price distance guaranteed if the current stop is hit (negative while at risk)
    pub locked_in: Decimal,
}

#[derive(Debug, Clone)]
pub struct TrailingStopManager {
    params: TrailingStopParams,
}

impl TrailingStopManager {
    pub fn new(params: TrailingStopParams) -> Self {
        Self { params }
    }

    pub fn from_config(config: &TrailingStopConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.params()?))
    }

    pub fn params(&self) -> &TrailingStopParams {
        &self.params
    }

    /// Hard stop for a fresh entry.
    pub fn initial_stop(&self, side: Side, entry: Decimal, atr: Decimal) -> Decimal {
        entry - side.sign() * self.params.hard_stop_distance * atr
    }

    /// Create the tracking record for a newly opened position.
    pub fn initialize(&self, position: &Position, current_price: Decimal, atr: Decimal) -> TrackedPosition {
        let entry = position.entry_price;
        let initial_stop = self.initial_stop(position.side, entry, atr);

        TrackedPosition {
            ticket: position.ticket,
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: entry,
            volume: position.volume,
            opened_at: position.open_time,
            highest_price: entry.max(current_price),
            lowest_price: entry.min(current_price),
            breakeven_triggered: false,
            initial_stop,
            current_stop: initial_stop,
            adjustments: Vec::new(),
        }
    }

    /// Track a position found at the broker with no shadow record.
    ///
    /// The stop the broker already holds is kept when it is tighter than the
    /// computed hard stop. A held stop at or beyond entry means breakeven has
    /// already happened.
    pub fn adopt(&self, position: &Position, current_price: Decimal, atr: Decimal) -> TrackedPosition {
        let mut tracked = self.initialize(position, current_price, atr);

        if let Some(held) = position.stop_loss {
            if position.side.is_better_stop(held, tracked.current_stop) {
                tracked.current_stop = held;
            }
            let at_or_past_entry = (held - tracked.entry_price) * position.side.sign() >= Decimal::ZERO;
            tracked.breakeven_triggered = at_or_past_entry;
        }

        tracked
    }

    /// Update the peak/trough and propose a stop. The stop itself and the
    /// breakeven flag are left untouched until [`Self::apply`].
    pub fn evaluate(&self, pos: &mut TrackedPosition, current_price: Decimal, atr: Decimal) -> StopUpdate {
        let side = pos.side;
        match side {
            Side::Buy => pos.highest_price = pos.highest_price.max(current_price),
            Side::Sell => pos.lowest_price = pos.lowest_price.min(current_price),
        }

        let unchanged = StopUpdate {
            previous_stop: pos.current_stop,
            new_stop: pos.current_stop,
            reason: StopReason::Unchanged,
        };

        if atr <= Decimal::ZERO {
            return unchanged;
        }

        if !pos.breakeven_triggered {
            // Distance from entry in either direction arms breakeven
            let moved = (current_price - pos.entry_price).abs();
            if moved >= self.params.breakeven_trigger * atr {
                let breakeven = pos.entry_price + side.sign() * self.params.breakeven_buffer * atr;
                let new_stop = if side.is_better_stop(breakeven, pos.current_stop) {
                    breakeven
                } else {
                    pos.current_stop
                };
                return StopUpdate {
                    new_stop,
                    reason: StopReason::Breakeven,
                    ..unchanged
                };
            }
            return unchanged;
        }

        if side.is_in_profit(pos.entry_price, current_price) {
            let extreme = match side {
                Side::Buy => pos.highest_price,
                Side::Sell => pos.lowest_price,
            };
            let candidate = extreme - side.sign() * self.params.trail_distance * atr;
            if side.is_better_stop(candidate, pos.current_stop) {
                return StopUpdate {
                    new_stop: candidate,
                    reason: StopReason::Trailing,
                    ..unchanged
                };
            }
        }

        unchanged
    }

    /// Commit an update the broker has accepted.
    pub fn apply(&self, pos: &mut TrackedPosition, update: &StopUpdate, at: DateTime<Utc>) {
        if update.reason == StopReason::Breakeven {
            pos.breakeven_triggered = true;
        }
        if !pos.side.is_better_stop(update.new_stop, pos.current_stop) {
            return;
        }

        pos.adjustments.push(StopAdjustment {
            old_stop: pos.current_stop,
            new_stop: update.new_stop,
            reason: update.reason,
            highest_price: pos.highest_price,
            lowest_price: pos.lowest_price,
            at,
        });
        pos.current_stop = update.new_stop;
    }

    /// Evaluate and commit in one step.
    pub fn update(&self, pos: &mut TrackedPosition, current_price: Decimal, atr: Decimal, at: DateTime<Utc>) -> StopUpdate {
        let update = self.evaluate(pos, current_price, atr);
        self.apply(pos, &update, at);
        update
    }

    pub fn get_statistics(&self, pos: &TrackedPosition) -> StopStatistics {
        StopStatistics {
            ticket: pos.ticket,
            adjustments: pos.adjustments.len(),
            breakeven_triggered: pos.breakeven_triggered,
            initial_stop: pos.initial_stop,
            current_stop: pos.current_stop,
            highest_price: pos.highest_price,
            lowest_price: pos.lowest_price,
            locked_in: (pos.current_stop - pos.entry_price) * pos.side.sign(),
        }
    }
}
