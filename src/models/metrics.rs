//! Session performance metrics over closed trades.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Performance summary for a trading or replay session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    // === Basic Statistics ===
    /// Number of closed trades
    pub total_trades: u32,

    /// Total realized P&L
    pub total_pnl: Decimal,

    // === Win/Loss Metrics ===
    pub winning_trades: u32,
    pub losing_trades: u32,

    /// Win rate (0.0 to 1.0)
    pub win_rate: f64,

    /// Average profit on winning trades
    pub avg_win: Decimal,

    /// Average loss on losing trades (absolute value)
    pub avg_loss: Decimal,

    /// Gross profit / gross loss
    pub profit_factor: f64,

    /// Expected P&L per trade
    pub expectancy: Decimal,

    // === Risk Metrics ===
    /// Maximum drawdown of the equity curve (0.0 to 1.0)
    pub max_drawdown: f64,

    /// Maximum drawdown in account currency
    pub max_drawdown_amount: Decimal,

    /// Mean / standard deviation of per-trade P&L
    pub sharpe_per_trade: f64,

    /// Trades closed by the protective stop
    pub stopped_out: u32,
}

impl fmt::Display for SessionMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Session Metrics ===")?;
        writeln!(f, "Trades:          {} (W {} / L {})", self.total_trades, self.winning_trades, self.losing_trades)?;
        writeln!(f, "Win Rate:        {:.1}%", self.win_rate * 100.0)?;
        writeln!(f, "Total P&L:       {:.2}", self.total_pnl)?;
        writeln!(f, "Avg Win:         {:.2}", self.avg_win)?;
        writeln!(f, "Avg Loss:        {:.2}", self.avg_loss)?;
        writeln!(f, "Profit Factor:   {:.2}", self.profit_factor)?;
        writeln!(f, "Expectancy:      {:.2}", self.expectancy)?;
        writeln!(f, "Max Drawdown:    {:.2}% ({:.2})", self.max_drawdown * 100.0, self.max_drawdown_amount)?;
        writeln!(f, "Sharpe/Trade:    {:.2}", self.sharpe_per_trade)?;
        writeln!(f, "Stopped Out:     {}", self.stopped_out)?;
        Ok(())
    }
}
