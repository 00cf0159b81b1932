//! Calculator for session performance metrics: drawdown, win rate, Sharpe, etc.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::{ClosedTrade, ExitReason, SessionMetrics};

/// Calculator for computing session performance metrics.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Calculate metrics from closed trades, in close order, starting from
    /// `initial_balance`.
    pub fn calculate(trades: &[ClosedTrade], initial_balance: Decimal) -> SessionMetrics {
        let mut metrics = SessionMetrics::default();

        if trades.is_empty() {
            return metrics;
        }

        metrics.total_trades = trades.len() as u32;
        metrics.stopped_out = trades
            .iter()
            .filter(|t| t.exit_reason == ExitReason::StopLoss)
            .count() as u32;

        let pnls: Vec<Decimal> = trades.iter().map(|t| t.pnl).collect();
        Self::calculate_pnl_metrics(&mut metrics, &pnls);
        Self::calculate_drawdown(&mut metrics, &pnls, initial_balance);
        Self::calculate_sharpe(&mut metrics, &pnls);

        metrics
    }

    /// Calculate P&L-related metrics.
    fn calculate_pnl_metrics(metrics: &mut SessionMetrics, pnls: &[Decimal]) {
        let (wins, losses): (Vec<Decimal>, Vec<Decimal>) =
            pnls.iter().partition(|&&p| p > Decimal::ZERO);

        metrics.winning_trades = wins.len() as u32;
        metrics.losing_trades = losses.iter().filter(|l| **l < Decimal::ZERO).count() as u32;
        metrics.total_pnl = pnls.iter().copied().sum();
        metrics.win_rate = wins.len() as f64 / pnls.len() as f64;

        if !wins.is_empty() {
            metrics.avg_win = wins.iter().copied().sum::<Decimal>() / Decimal::from(wins.len() as u32);
        }

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();

        if metrics.losing_trades > 0 {
            metrics.avg_loss = gross_loss / Decimal::from(metrics.losing_trades);
        }

        if gross_loss > Decimal::ZERO {
            metrics.profit_factor =
                gross_profit.to_f64().unwrap_or(0.0) / gross_loss.to_f64().unwrap_or(1.0);
        }

        metrics.expectancy = metrics.total_pnl / Decimal::from(pnls.len() as u32);
    }

    /// Calculate maximum drawdown of the balance curve.
    fn calculate_drawdown(metrics: &mut SessionMetrics, pnls: &[Decimal], initial_balance: Decimal) {
        let mut equity = initial_balance;
        let mut peak = initial_balance;
        let mut max_dd = Decimal::ZERO;
        let mut max_dd_pct = 0.0f64;

        for pnl in pnls {
            equity += pnl;

            if equity > peak {
                peak = equity;
            }

            if peak > Decimal::ZERO {
                let dd = peak - equity;
                if dd > max_dd {
                    max_dd = dd;
                }

                let dd_pct = dd.to_f64().unwrap_or(0.0) / peak.to_f64().unwrap_or(1.0);
                if dd_pct > max_dd_pct {
                    max_dd_pct = dd_pct;
                }
            }
        }

        metrics.max_drawdown = max_dd_pct;
        metrics.max_drawdown_amount = max_dd;
    }

    /// Per-trade Sharpe ratio (no annualization, zero risk-free rate).
    fn calculate_sharpe(metrics: &mut SessionMetrics, pnls: &[Decimal]) {
        if pnls.len() < 2 {
            return;
        }

        let returns: Vec<f64> = pnls.iter().filter_map(|p| p.to_f64()).collect();
        let mean = returns.iter().mean();
        let std_dev = returns.iter().std_dev();

        if std_dev > 0.0 {
            metrics.sharpe_per_trade = mean / std_dev;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn trade(pnl: Decimal, reason: ExitReason) -> ClosedTrade {
        ClosedTrade {
            ticket: 1,
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume: dec!(0.10),
            entry_price: dec!(1.1000),
            exit_price: dec!(1.1000),
            pnl,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
            exit_reason: reason,
        }
    }

    #[test]
    fn test_calculate_pnl_metrics() {
        let trades = vec![
            trade(dec!(100), ExitReason::StopLoss),
            trade(dec!(-50), ExitReason::StopLoss),
            trade(dec!(200), ExitReason::RsiExit),
            trade(dec!(-30), ExitReason::StopLoss),
            trade(dec!(150), ExitReason::StopLoss),
        ];

        let metrics = MetricsCalculator::calculate(&trades, dec!(10000));

        assert_eq!(metrics.winning_trades, 3);
        assert_eq!(metrics.losing_trades, 2);
        assert_eq!(metrics.total_pnl, dec!(370));
        assert_eq!(metrics.avg_loss, dec!(40));
        assert_eq!(metrics.stopped_out, 4);
        assert!((metrics.win_rate - 0.6).abs() < 0.001);
        assert!((metrics.profit_factor - 450.0 / 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_calculate_drawdown() {
        let trades: Vec<_> = [dec!(100), dec!(-300), dec!(-100), dec!(500)]
            .into_iter()
            .map(|p| trade(p, ExitReason::StopLoss))
            .collect();

        // Equity: 1100 (peak) -> 800 -> 700 -> 1200
        let metrics = MetricsCalculator::calculate(&trades, dec!(1000));

        assert_eq!(metrics.max_drawdown_amount, dec!(400));
        assert!((metrics.max_drawdown - 400.0 / 1100.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_session() {
        let metrics = MetricsCalculator::calculate(&[], dec!(1000));
        assert_eq!(metrics.total_trades, 0);
        assert_eq!(metrics.sharpe_per_trade, 0.0);
    }
}
