//! Broker gateway: the contract the trading core needs from a broker, an HTTP
//! bridge client and a simulated broker for replays.

mod paper;
mod rest_client;
mod types;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::BrokerError;
use crate::models::{CloseResult, OrderFill, OrderRequest, Position, PriceBar, SymbolMeta, Timeframe};

pub use paper::{load_csv_bars, PaperBroker};
pub use rest_client::RestBroker;

/// Everything the bot asks of a broker.
///
/// Calls are awaited one at a time from the trading loop. A failed call must
/// be treated as not having happened.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Most recent `count` bars, oldest first.
    async fn get_recent_bars(&self, symbol: &str, timeframe: Timeframe, count: usize) -> Result<Vec<PriceBar>, BrokerError>;

    async fn get_account_balance(&self) -> Result<Decimal, BrokerError>;

    /// Open positions on `symbol`.
    async fn get_open_positions(&self, symbol: &str) -> Result<Vec<Position>, BrokerError>;

    /// Market order, optionally with a protective stop.
    async fn place_order(&mut self, order: OrderRequest) -> Result<OrderFill, BrokerError>;

    async fn modify_stop_loss(&mut self, ticket: u64, stop_loss: Decimal) -> Result<(), BrokerError>;

    async fn close_position(&mut self, ticket: u64) -> Result<CloseResult, BrokerError>;

    async fn get_symbol_meta(&self, symbol: &str) -> Result<SymbolMeta, BrokerError>;
}
