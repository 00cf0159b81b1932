//! Replay a recorded bar file through the live bot logic.
//!
//! The bot runs unchanged against a [`PaperBroker`]: each step reveals one
//! bar (triggering stops it crosses) and runs one tick. Whatever is still open
//! when the data runs out is closed at the last close.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

use crate::api::PaperBroker;
use crate::bot::{Bot, TickEvent, TickOutcome};
use crate::db::Journal;
use crate::indicators::compute_rsi;
use crate::metrics::MetricsCalculator;
use crate::models::{closes, ClosedTrade, ExitReason, PriceBar, SessionMetrics, SymbolMeta};
use crate::trading::{EntrySignal, SignalGenerator, TradingConfig};

/// Replay settings.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Starting account balance
    pub initial_balance: Decimal,

    /// Instrument properties used for fills and P&L
    pub meta: SymbolMeta,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            initial_balance: dec!(10000),
            meta: SymbolMeta::default(),
        }
    }
}

/// Outcome of a replay.
#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub symbol: String,
    pub first_bar: DateTime<Utc>,
    pub last_bar: DateTime<Utc>,
    /// Bars processed by the bot (warmup excluded)
    pub bars: usize,
    /// Bars whose RSI crossed an entry level, before any filters
    pub signal_bars: usize,
    pub initial_balance: Decimal,
    pub final_balance: Decimal,
    pub stop_moves: usize,
    pub stop_rejections: usize,
    pub entries_rejected: usize,
    pub tick_errors: usize,
    pub trades: Vec<ClosedTrade>,
    pub metrics: SessionMetrics,
}

impl ReplayReport {
    pub fn return_percent(&self) -> Decimal {
        if self.initial_balance.is_zero() {
            return Decimal::ZERO;
        }
        (self.final_balance - self.initial_balance) / self.initial_balance * dec!(100)
    }
}

impl fmt::Display for ReplayReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n{:=^60}", " REPLAY RESULTS ")?;
        writeln!(f)?;
        writeln!(f, "Symbol:          {}", self.symbol)?;
        writeln!(
            f,
            "Period:          {} -> {}",
            self.first_bar.format("%Y-%m-%d %H:%M"),
            self.last_bar.format("%Y-%m-%d %H:%M")
        )?;
        writeln!(f, "Bars:            {} ({} with a raw RSI signal)", self.bars, self.signal_bars)?;
        writeln!(f, "Initial Balance: {:.2}", self.initial_balance)?;
        writeln!(f, "Final Balance:   {:.2}", self.final_balance)?;
        writeln!(f, "Return:          {:.2}%", self.return_percent())?;
        writeln!(f, "Stop Moves:      {} ({} rejected)", self.stop_moves, self.stop_rejections)?;
        writeln!(f, "Risk Rejections: {}", self.entries_rejected)?;
        if self.tick_errors > 0 {
            writeln!(f, "Tick Errors:     {}", self.tick_errors)?;
        }
        writeln!(f)?;
        write!(f, "{}", self.metrics)?;
        writeln!(f, "{}", "=".repeat(60))?;
        Ok(())
    }
}

/// Replay `bars` through a bot configured with `config`.
pub async fn run_replay(
    config: TradingConfig,
    bars: Vec<PriceBar>,
    replay: &ReplayConfig,
    journal: Option<Journal>,
) -> Result<ReplayReport> {
    let warmup = config.min_bars();
    if bars.len() <= warmup {
        anyhow::bail!("need more than {} bars to replay, got {}", warmup, bars.len());
    }

    let signals = SignalGenerator::from_config(&config.rsi, &config.momentum).context("Invalid RSI levels")?;
    let rsi = compute_rsi(&closes(&bars), config.rsi.period).context("Failed to compute RSI")?;
    let signal_bars = signals
        .entry_signals(&rsi[warmup - 1..])
        .into_iter()
        .filter(|s| *s != EntrySignal::None)
        .count();

    let symbol = config.symbol.clone();
    let first_bar = bars[0].timestamp;
    let broker = PaperBroker::new(&symbol, bars, replay.initial_balance, replay.meta.clone(), warmup)
        .context("Invalid bar data")?;

    let mut bot = Bot::new(config, broker).context("Invalid trading configuration")?;
    if let Some(journal) = journal {
        journal.mark_started(&symbol, false).await.context("Failed to journal replay start")?;
        bot = bot.with_journal(journal);
    }

    info!(symbol = %symbol, warmup, balance = %replay.initial_balance, "Starting replay");

    let mut processed = 0;
    let mut stop_moves = 0;
    let mut stop_rejections = 0;
    let mut entries_rejected = 0;
    let mut tick_errors = 0;

    loop {
        match bot.tick().await {
            Ok(TickOutcome::Processed(summary)) => {
                processed += 1;
                for event in &summary.events {
                    match event {
                        TickEvent::StopMoved { .. } => stop_moves += 1,
                        TickEvent::StopRejected { .. } => stop_rejections += 1,
                        TickEvent::EntryRejected { .. } => entries_rejected += 1,
                        _ => {}
                    }
                }
            }
            Ok(TickOutcome::NoNewBar) => {}
            Err(e) => {
                tick_errors += 1;
                warn!(error = %e, "Replay tick failed");
            }
        }

        if !bot.broker_mut().advance() {
            break;
        }
    }

    let broker = bot.broker_mut();
    broker.close_all(ExitReason::External);
    let last_bar = broker.current_bar().timestamp;
    let final_balance = broker.balance();
    let trades = broker.closed_trades().to_vec();

    let metrics = MetricsCalculator::calculate(&trades, replay.initial_balance);

    info!(
        bars = processed,
        trades = trades.len(),
        final_balance = %final_balance,
        "Replay complete"
    );

    Ok(ReplayReport {
        symbol,
        first_bar,
        last_bar,
        bars: processed,
        signal_bars,
        initial_balance: replay.initial_balance,
        final_balance,
        stop_moves,
        stop_rejections,
        entries_rejected,
        tick_errors,
        trades,
        metrics,
    })
}

/// Load a bar file and replay it.
pub async fn replay_file(
    path: &Path,
    config: TradingConfig,
    replay: &ReplayConfig,
    journal: Option<Journal>,
) -> Result<ReplayReport> {
    let bars = crate::api::load_csv_bars(path)
        .with_context(|| format!("Failed to load bars from {}", path.display()))?;
    run_replay(config, bars, replay, journal).await
}
