//! RSI Retail Trading Bot
//!
//! Trades RSI reversals on a single symbol with ATR-based stops, a staged
//! trailing stop and portfolio-level risk limits.

pub mod api;
pub mod bot;
pub mod db;
pub mod error;
pub mod indicators;
pub mod metrics;
pub mod models;
pub mod replay;
pub mod trading;
