//! Simulated broker over recorded bars.
//!
//! One bar becomes visible per [`PaperBroker::advance`]. Market orders fill at
//! the close of the latest visible bar. Protective stops are checked against
//! each newly revealed bar's range and close exactly at the stop price.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};

use super::BrokerGateway;
use crate::error::{BrokerError, DataError};
use crate::models::{
    validate_bars, CloseResult, ClosedTrade, ExitReason, OrderFill, OrderRequest, Position, PriceBar,
    Side, SymbolMeta, Timeframe,
};
use crate::trading::is_jpy_pair;

/// Broker return code for a stop on the wrong side of the market.
const INVALID_STOPS: i64 = 10016;
const INVALID_VOLUME: i64 = 10014;

#[derive(Debug, Deserialize)]
struct CsvBar {
    time: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

/// Parse RFC 3339, `YYYY-MM-DD HH:MM[:SS]` or unix seconds.
fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y.%m.%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Read bars from a CSV file with a `time,open,high,low,close[,volume]` header.
pub fn load_csv_bars(path: &Path) -> Result<Vec<PriceBar>, DataError> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| DataError::Malformed(format!("{}: {}", path.display(), e)))?;

    let mut bars = Vec::new();
    for (index, record) in reader.deserialize::<CsvBar>().enumerate() {
        let row = record.map_err(|e| DataError::Malformed(format!("row {}: {}", index + 1, e)))?;
        let timestamp = parse_time(&row.time)
            .ok_or_else(|| DataError::Malformed(format!("row {}: bad time '{}'", index + 1, row.time)))?;
        bars.push(PriceBar::new(timestamp, row.open, row.high, row.low, row.close).with_volume(row.volume));
    }

    validate_bars(&bars)?;
    Ok(bars)
}

pub struct PaperBroker {
    symbol: String,
    bars: Vec<PriceBar>,
    /// Index of the latest visible bar
    cursor: usize,
    balance: Decimal,
    meta: SymbolMeta,
    positions: Vec<Position>,
    closed: Vec<ClosedTrade>,
    next_ticket: u64,
}

impl PaperBroker {
    /// `bars` must be non-empty and validated; the first `warmup` bars are
    /// visible from the start.
    pub fn new(symbol: impl Into<String>, bars: Vec<PriceBar>, balance: Decimal, meta: SymbolMeta, warmup: usize) -> Result<Self, DataError> {
        validate_bars(&bars)?;
        let cursor = warmup.clamp(1, bars.len()) - 1;

        Ok(Self {
            symbol: symbol.into(),
            bars,
            cursor,
            balance,
            meta,
            positions: Vec::new(),
            closed: Vec::new(),
            next_ticket: 1,
        })
    }

    pub fn from_csv(path: &Path, symbol: impl Into<String>, balance: Decimal, meta: SymbolMeta, warmup: usize) -> Result<Self, DataError> {
        Self::new(symbol, load_csv_bars(path)?, balance, meta, warmup)
    }

    pub fn current_bar(&self) -> &PriceBar {
        &self.bars[self.cursor]
    }

    pub fn has_next(&self) -> bool {
        self.cursor + 1 < self.bars.len()
    }

    /// Reveal the next bar and trigger any stops it crosses. Returns `false`
    /// at the end of the data.
    pub fn advance(&mut self) -> bool {
        if !self.has_next() {
            return false;
        }
        self.cursor += 1;

        let bar = self.bars[self.cursor].clone();
        let (hit, open): (Vec<_>, Vec<_>) = self.positions.drain(..).partition(|p| match (p.side, p.stop_loss) {
            (Side::Buy, Some(stop)) => Decimal::from_f64(bar.low).is_some_and(|low| low <= stop),
            (Side::Sell, Some(stop)) => Decimal::from_f64(bar.high).is_some_and(|high| high >= stop),
            (_, None) => false,
        });
        self.positions = open;

        for position in hit {
            if let Some(stop) = position.stop_loss {
                debug!(ticket = position.ticket, stop = %stop, "Paper stop triggered");
                self.settle(position, stop, bar.timestamp, ExitReason::StopLoss);
            }
        }
        true
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    /// Trades closed so far, in close order.
    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed
    }

    pub fn open_positions(&self) -> &[Position] {
        &self.positions
    }

    /// Close everything at the latest close; used when the data runs out.
    pub fn close_all(&mut self, reason: ExitReason) {
        let price = self.last_price();
        let at = self.current_bar().timestamp;
        for position in std::mem::take(&mut self.positions) {
            self.settle(position, price, at, reason);
        }
    }

    fn last_price(&self) -> Decimal {
        Decimal::from_f64(self.current_bar().close).unwrap_or_default()
    }

    fn pnl(&self, position: &Position, exit: Decimal) -> Decimal {
        let mut pnl = (exit - position.entry_price) * position.side.sign() * position.volume * self.meta.contract_size;
        if is_jpy_pair(&position.symbol) && exit > Decimal::ZERO {
            pnl /= exit;
        }
        pnl.round_dp(2)
    }

    fn settle(&mut self, position: Position, exit: Decimal, at: DateTime<Utc>, reason: ExitReason) -> Decimal {
        let pnl = self.pnl(&position, exit);
        self.balance += pnl;

        info!(
            ticket = position.ticket,
            exit = %exit,
            pnl = %pnl,
            reason = reason.as_str(),
            "Paper position closed"
        );

        self.closed.push(ClosedTrade {
            ticket: position.ticket,
            symbol: position.symbol,
            side: position.side,
            volume: position.volume,
            entry_price: position.entry_price,
            exit_price: exit,
            pnl,
            opened_at: position.open_time,
            closed_at: at,
            exit_reason: reason,
        });
        pnl
    }

    fn check_stop(&self, side: Side, price: Decimal, stop: Decimal) -> Result<(), BrokerError> {
        let distance = (price - stop) * side.sign();
        if distance <= Decimal::ZERO || distance < self.meta.min_stop_distance {
            return Err(BrokerError::rejected(
                INVALID_STOPS,
                format!("Invalid stops: {} {} at market {}", side, stop, price),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerGateway for PaperBroker {
    async fn get_recent_bars(&self, symbol: &str, _timeframe: Timeframe, count: usize) -> Result<Vec<PriceBar>, BrokerError> {
        if symbol != self.symbol {
            return Err(BrokerError::rejected(4301, format!("Unknown symbol {}", symbol)));
        }
        let end = self.cursor + 1;
        let start = end.saturating_sub(count);
        Ok(self.bars[start..end].to_vec())
    }

    async fn get_account_balance(&self) -> Result<Decimal, BrokerError> {
        Ok(self.balance)
    }

    async fn get_open_positions(&self, symbol: &str) -> Result<Vec<Position>, BrokerError> {
        Ok(self.positions.iter().filter(|p| p.symbol == symbol).cloned().collect())
    }

    async fn place_order(&mut self, order: OrderRequest) -> Result<OrderFill, BrokerError> {
        if order.volume <= Decimal::ZERO {
            return Err(BrokerError::rejected(INVALID_VOLUME, "Invalid volume"));
        }

        let price = self.last_price();
        if let Some(stop) = order.stop_loss {
            self.check_stop(order.side, price, stop)?;
        }

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let open_time = self.current_bar().timestamp;

        self.positions.push(Position {
            ticket,
            symbol: order.symbol,
            side: order.side,
            volume: order.volume,
            entry_price: price,
            stop_loss: order.stop_loss,
            open_time,
        });

        Ok(OrderFill {
            ticket,
            fill_price: price,
            open_time,
        })
    }

    async fn modify_stop_loss(&mut self, ticket: u64, stop_loss: Decimal) -> Result<(), BrokerError> {
        let price = self.last_price();
        let side = self
            .positions
            .iter()
            .find(|p| p.ticket == ticket)
            .map(|p| p.side)
            .ok_or(BrokerError::UnknownPosition(ticket))?;
        self.check_stop(side, price, stop_loss)?;

        if let Some(position) = self.positions.iter_mut().find(|p| p.ticket == ticket) {
            position.stop_loss = Some(stop_loss);
        }
        Ok(())
    }

    async fn close_position(&mut self, ticket: u64) -> Result<CloseResult, BrokerError> {
        let index = self
            .positions
            .iter()
            .position(|p| p.ticket == ticket)
            .ok_or(BrokerError::UnknownPosition(ticket))?;
        let position = self.positions.remove(index);

        let price = self.last_price();
        let at = self.current_bar().timestamp;
        // The bot only closes positions itself on RSI exits
        let realized_pnl = self.settle(position, price, at, ExitReason::RsiExit);

        Ok(CloseResult {
            close_price: price,
            realized_pnl,
        })
    }

    async fn get_symbol_meta(&self, _symbol: &str) -> Result<SymbolMeta, BrokerError> {
        Ok(self.meta.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn bars(rows: &[(f64, f64, f64, f64)]) -> Vec<PriceBar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        rows.iter()
            .enumerate()
            .map(|(i, &(o, h, l, c))| PriceBar::new(start + Duration::minutes(15 * i as i64), o, h, l, c))
            .collect()
    }

    fn broker() -> PaperBroker {
        let data = bars(&[
            (1.1000, 1.1010, 1.0990, 1.1000),
            (1.1000, 1.1030, 1.0995, 1.1020),
            (1.1020, 1.1025, 1.0970, 1.0980),
        ]);
        PaperBroker::new("EURUSD", data, dec!(10000), SymbolMeta::default(), 1).unwrap()
    }

    fn order(side: Side, stop: Option<Decimal>) -> OrderRequest {
        OrderRequest {
            symbol: "EURUSD".to_string(),
            side,
            volume: dec!(0.5),
            stop_loss: stop,
        }
    }

    #[tokio::test]
    async fn test_fill_at_close_and_reveal_bars() {
        let mut broker = broker();
        assert_eq!(broker.get_recent_bars("EURUSD", Timeframe::M15, 10).await.unwrap().len(), 1);

        let fill = broker.place_order(order(Side::Buy, Some(dec!(1.0980)))).await.unwrap();
        assert_eq!(fill.fill_price, dec!(1.1));
        assert_eq!(fill.ticket, 1);

        assert!(broker.advance());
        assert_eq!(broker.get_recent_bars("EURUSD", Timeframe::M15, 10).await.unwrap().len(), 2);
        assert_eq!(broker.get_open_positions("EURUSD").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_triggers_on_bar_range() {
        let mut broker = broker();
        broker.place_order(order(Side::Buy, Some(dec!(1.0980)))).await.unwrap();

        broker.advance();
        assert!(broker.closed_trades().is_empty());

        // Third bar's low 1.0970 crosses the stop
        broker.advance();
        assert!(broker.open_positions().is_empty());

        let trade = &broker.closed_trades()[0];
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        assert_eq!(trade.exit_price, dec!(1.0980));
        // -0.0020 x 0.5 x 100000
        assert_eq!(trade.pnl, dec!(-100));
        assert_eq!(broker.balance(), dec!(9900));
        assert!(!broker.advance());
    }

    #[tokio::test]
    async fn test_rejects_stop_on_wrong_side() {
        let mut broker = broker();
        let result = broker.place_order(order(Side::Sell, Some(dec!(1.0990)))).await;
        assert!(matches!(result, Err(BrokerError::Rejected { code: INVALID_STOPS, .. })));

        broker.place_order(order(Side::Sell, Some(dec!(1.1050)))).await.unwrap();
        assert!(broker.modify_stop_loss(1, dec!(1.0950)).await.is_err());
        broker.modify_stop_loss(1, dec!(1.1030)).await.unwrap();
        assert_eq!(broker.open_positions()[0].stop_loss, Some(dec!(1.1030)));
        assert_eq!(broker.modify_stop_loss(9, dec!(1.1030)).await, Err(BrokerError::UnknownPosition(9)));
    }

    #[tokio::test]
    async fn test_close_position_realizes_pnl() {
        let mut broker = broker();
        broker.place_order(order(Side::Sell, None)).await.unwrap();
        broker.advance();

        let result = broker.close_position(1).await.unwrap();
        assert_eq!(result.close_price, dec!(1.102));
        assert_eq!(result.realized_pnl, dec!(-100));
        assert_eq!(broker.closed_trades()[0].exit_reason, ExitReason::RsiExit);
    }

    #[test]
    fn test_parse_time_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 9, 30, 0).unwrap();
        assert_eq!(parse_time("2024-01-02T09:30:00Z"), Some(expected));
        assert_eq!(parse_time("2024-01-02 09:30:00"), Some(expected));
        assert_eq!(parse_time("2024.01.02 09:30"), Some(expected));
        assert_eq!(parse_time(&expected.timestamp().to_string()), Some(expected));
        assert_eq!(parse_time("yesterday"), None);
    }
}
