//! Broker-side position, fill and symbol records.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::Side;

/// An open position as reported by the broker. The broker owns it; the bot
/// only keeps a parallel tracking record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Broker-assigned ticket
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub entry_price: Decimal,
    /// Stop currently held by the broker, if any
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    pub open_time: DateTime<Utc>,
}

/// Result of a filled market order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub ticket: u64,
    pub fill_price: Decimal,
    pub open_time: DateTime<Utc>,
}

/// Result of closing a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseResult {
    pub close_price: Decimal,
    pub realized_pnl: Decimal,
}

/// Market order request.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub stop_loss: Option<Decimal>,
}

/// Static trading properties of an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolMeta {
    /// Units of base currency per lot
    pub contract_size: Decimal,
    /// Minimum distance between market price and a stop
    #[serde(default)]
    pub min_stop_distance: Decimal,
    /// Smallest price increment quoted
    pub point_size: Decimal,
}

impl Default for SymbolMeta {
    fn default() -> Self {
        Self {
            contract_size: dec!(100000),
            min_stop_distance: Decimal::ZERO,
            point_size: dec!(0.00001),
        }
    }
}
