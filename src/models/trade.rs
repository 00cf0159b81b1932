//! Trade direction and closed-trade records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a position or order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    /// Whether `candidate` is a tighter (more protective) stop than `current`.
    pub fn is_better_stop(&self, candidate: Decimal, current: Decimal) -> bool {
        match self {
            Side::Buy => candidate > current,
            Side::Sell => candidate < current,
        }
    }

    /// Whether `price` is beyond `entry` in the profitable direction.
    pub fn is_in_profit(&self, entry: Decimal, price: Decimal) -> bool {
        match self {
            Side::Buy => price > entry,
            Side::Sell => price < entry,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" | "long" => Ok(Side::Buy),
            "sell" | "short" => Ok(Side::Sell),
            other => Err(format!("unknown side '{}', expected buy or sell", other)),
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Broker-side stop-loss hit (initial, breakeven or trailing)
    StopLoss,
    /// RSI exit level reached (only when trailing stops are disabled)
    RsiExit,
    /// Position disappeared from the broker without us closing it
    External,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::RsiExit => "rsi_exit",
            ExitReason::External => "external",
        }
    }
}

/// A completed round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    /// Realized P&L in account currency
    pub pnl: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub exit_reason: ExitReason,
}

impl ClosedTrade {
    pub fn is_win(&self) -> bool {
        self.pnl > Decimal::ZERO
    }

    /// Price move captured in the trade's favour.
    pub fn price_move(&self) -> Decimal {
        (self.exit_price - self.entry_price) * self.side.sign()
    }
}
