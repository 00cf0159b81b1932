//! Data models for bars, positions, trades, and metrics.

mod bar;
mod metrics;
mod position;
mod trade;

pub use bar::{closes, validate_bars, PriceBar, Timeframe};
pub use metrics::SessionMetrics;
pub use position::{CloseResult, OrderFill, OrderRequest, Position, SymbolMeta};
pub use trade::{ClosedTrade, ExitReason, Side};
