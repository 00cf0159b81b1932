//! Wire types for the broker bridge HTTP API.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{Position, PriceBar, Side, SymbolMeta};

/// Bar from /bars. `time` is unix seconds at bar open.
#[derive(Debug, Clone, Deserialize)]
pub struct BarResponse {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub tick_volume: f64,
}

impl BarResponse {
    pub fn into_bar(self) -> Option<PriceBar> {
        Some(PriceBar::new(unix_time(self.time)?, self.open, self.high, self.low, self.close).with_volume(self.tick_volume))
    }
}

/// Account summary from /account.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountResponse {
    pub balance: Decimal,
    #[serde(default)]
    pub equity: Decimal,
    #[serde(default)]
    pub currency: String,
}

/// Open position from /positions.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionResponse {
    pub ticket: u64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub side: Side,
    pub volume: Decimal,
    pub price_open: Decimal,
    /// 0 when no stop is set
    #[serde(default)]
    pub sl: Decimal,
    pub time: i64,
    #[serde(default)]
    pub magic: u64,
}

impl PositionResponse {
    pub fn into_position(self) -> Option<Position> {
        Some(Position {
            ticket: self.ticket,
            symbol: self.symbol,
            side: self.side,
            volume: self.volume,
            entry_price: self.price_open,
            stop_loss: (!self.sl.is_zero()).then_some(self.sl),
            open_time: unix_time(self.time)?,
        })
    }
}

/// Body of POST /orders.
#[derive(Debug, Clone, Serialize)]
pub struct OrderBody {
    pub symbol: String,
    #[serde(rename = "type")]
    pub side: Side,
    pub volume: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sl: Option<Decimal>,
    pub magic: u64,
    pub client_order_id: String,
    pub comment: String,
}

/// Fill returned by POST /orders.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    pub ticket: u64,
    pub price: Decimal,
    pub time: i64,
}

/// Body of PUT /positions/{ticket}/sl.
#[derive(Debug, Clone, Serialize)]
pub struct StopLossBody {
    pub sl: Decimal,
}

/// Result of DELETE /positions/{ticket}.
#[derive(Debug, Clone, Deserialize)]
pub struct CloseResponse {
    pub price: Decimal,
    pub profit: Decimal,
}

/// Instrument properties from /symbols/{symbol}.
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolResponse {
    pub trade_contract_size: Decimal,
    /// Minimum stop distance in points
    #[serde(default)]
    pub trade_stops_level: u32,
    pub point: Decimal,
}

impl From<SymbolResponse> for SymbolMeta {
    fn from(s: SymbolResponse) -> Self {
        SymbolMeta {
            contract_size: s.trade_contract_size,
            min_stop_distance: Decimal::from(s.trade_stops_level) * s.point,
            point_size: s.point,
        }
    }
}

/// Error body returned with non-2xx statuses.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

fn unix_time(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}
