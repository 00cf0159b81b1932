//! Bot runner: the polling loop that ties indicators, signals, risk and
//! trailing stops to a broker.
//!
//! One tick per new bar:
//! 1. Fetch recent bars and skip if the newest bar was already processed
//! 2. Recompute RSI, ATR and trend (a data error keeps the previous values)
//! 3. Reconcile the shadow book with the broker's open positions
//! 4. Move trailing stops, or check RSI exits when trailing is disabled
//! 5. Consider an entry when the symbol has no open position
//!
//! Broker failures never advance shadow state: a rejected stop modification
//! leaves the tracked stop where it was and is retried on the next bar.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::BrokerGateway;
use crate::db::Journal;
use crate::error::{BrokerError, ConfigError, DataError, RiskRejection, TickError};
use crate::indicators::{compute_atr, compute_rsi, volume_ratio};
use crate::models::{closes, validate_bars, ExitReason, OrderRequest, Position, PriceBar, Side, SymbolMeta};
use crate::trading::{
    calc_stop_loss, validate_stop_loss, Confirmation, DynamicSizer, EntrySignal, RiskManager,
    SignalGenerator, StopReason, TrackedPosition, TradingConfig, TrailingStopManager, TrendFilter,
    TrendState,
};

/// Longest delay between retries after transient broker failures.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Indicator values for the latest processed bar.
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorSnapshot {
    pub bar_time: DateTime<Utc>,
    pub close: f64,
    pub rsi: f64,
    pub prev_rsi: Option<f64>,
    pub atr: f64,
    pub trend: TrendState,
    pub volume_ratio: Option<f64>,
}

/// Something the bot did (or declined to do) during a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickEvent {
    Opened {
        ticket: u64,
        side: Side,
        volume: Decimal,
        price: Decimal,
        stop: Decimal,
    },
    Adopted {
        ticket: u64,
        stop: Decimal,
    },
    StopMoved {
        ticket: u64,
        old_stop: Decimal,
        new_stop: Decimal,
        reason: StopReason,
    },
    StopRejected {
        ticket: u64,
        error: BrokerError,
    },
    Closed {
        ticket: u64,
        reason: ExitReason,
        pnl: Option<Decimal>,
    },
    CloseFailed {
        ticket: u64,
        error: BrokerError,
    },
    TrendBlocked {
        side: Side,
    },
    /// Initial stop on the wrong side of the market or inside the broker's minimum distance
    StopTooClose {
        side: Side,
        stop: Decimal,
    },
    EntryRejected {
        side: Side,
        reason: RiskRejection,
    },
    OrderFailed {
        side: Side,
        error: BrokerError,
    },
    /// Action skipped because the bot runs in dry-run mode
    DryRun {
        action: String,
    },
}

#[derive(Debug, Clone)]
pub struct TickSummary {
    pub bar_time: DateTime<Utc>,
    pub indicators: IndicatorSnapshot,
    pub events: Vec<TickEvent>,
}

#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// The newest bar was already processed
    NoNewBar,
    Processed(TickSummary),
}

fn to_decimal(value: f64, what: &str) -> Result<Decimal, DataError> {
    Decimal::from_f64(value).ok_or_else(|| DataError::Malformed(format!("{} {} is not representable", what, value)))
}

/// Round to the instrument's quoted precision.
fn round_to_point(price: Decimal, point: Decimal) -> Decimal {
    if point.is_zero() {
        price
    } else {
        price.round_dp(point.normalize().scale())
    }
}

/// Whether `bar` traded through the record's current stop.
fn stop_crossed(record: &TrackedPosition, bar: &PriceBar) -> bool {
    let Some(stop) = record.current_stop.to_f64() else {
        return false;
    };
    match record.side {
        Side::Buy => bar.low <= stop,
        Side::Sell => bar.high >= stop,
    }
}

/// Main bot runner.
pub struct Bot<B: BrokerGateway> {
    config: TradingConfig,
    broker: B,
    journal: Option<Journal>,
    dry_run: bool,

    signals: SignalGenerator,
    trend_filter: TrendFilter,
    trailing: TrailingStopManager,
    sizer: DynamicSizer,
    risk: RiskManager,

    // Runtime state, owned by the loop
    positions: HashMap<u64, TrackedPosition>,
    last_bar_time: Option<DateTime<Utc>>,
    snapshot: Option<IndicatorSnapshot>,
    symbol_meta: Option<SymbolMeta>,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl<B: BrokerGateway> Bot<B> {
    /// Validate `config` and build the trading components.
    pub fn new(config: TradingConfig, broker: B) -> Result<Self, ConfigError> {
        config.validate()?;

        let signals = SignalGenerator::from_config(&config.rsi, &config.momentum)?;
        let trend_filter = TrendFilter::from_config(&config.trend_filter);
        let trailing = TrailingStopManager::from_config(&config.trailing_stops)?;
        let sizer = DynamicSizer::new(config.risk.clone());
        let risk = RiskManager::new(config.risk.max_total_risk_percent);

        Ok(Self {
            config,
            broker,
            journal: None,
            dry_run: false,
            signals,
            trend_filter,
            trailing,
            sizer,
            risk,
            positions: HashMap::new(),
            last_bar_time: None,
            snapshot: None,
            symbol_meta: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Log intended orders, stop moves and closes instead of sending them.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    /// Shadow records keyed by broker ticket.
    pub fn positions(&self) -> &HashMap<u64, TrackedPosition> {
        &self.positions
    }

    pub fn snapshot(&self) -> Option<&IndicatorSnapshot> {
        self.snapshot.as_ref()
    }

    /// Poll until shutdown. Per-tick failures are logged and never end the loop;
    /// transient broker failures add an exponential backoff delay.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        info!(
            symbol = %self.config.symbol,
            timeframe = %self.config.timeframe,
            dry_run = self.dry_run,
            momentum = self.signals.uses_momentum(),
            poll_interval = self.config.poll_interval_secs,
            "Starting trading loop"
        );

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.mark_started(&self.config.symbol, self.dry_run).await {
                warn!(error = %e, "Failed to journal start");
            }
        }

        let poll = Duration::from_secs(self.config.poll_interval_secs);
        let mut poll_interval = interval(poll);
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut retry = ExponentialBackoff {
            initial_interval: poll,
            max_interval: MAX_BACKOFF,
            max_elapsed_time: None,
            ..Default::default()
        };
        retry.reset();

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        while !self.shutdown.load(Ordering::SeqCst) {
            poll_interval.tick().await;

            match self.tick().await {
                Ok(TickOutcome::NoNewBar) => {
                    retry.reset();
                }
                Ok(TickOutcome::Processed(summary)) => {
                    retry.reset();
                    for event in &summary.events {
                        debug!(?event, "Tick event");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Error in bot tick");
                    if e.is_transient() {
                        if let Some(delay) = retry.next_backoff() {
                            warn!(delay_secs = delay.as_secs_f64(), "Backing off before next poll");
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        info!(tracked = self.positions.len(), "Trading loop stopped");
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.mark_stopped().await {
                warn!(error = %e, "Failed to journal stop");
            }
        }

        Ok(())
    }

    /// Process the newest bar, if there is one.
    pub async fn tick(&mut self) -> Result<TickOutcome, TickError> {
        let symbol = self.config.symbol.clone();
        let bars = self
            .broker
            .get_recent_bars(&symbol, self.config.timeframe, self.config.bars_count)
            .await?;

        let last_bar = bars.last().cloned().ok_or(DataError::EmptySeries)?;
        if self.last_bar_time == Some(last_bar.timestamp) {
            return Ok(TickOutcome::NoNewBar);
        }

        let snapshot = match self.compute_indicators(&bars) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, bar = %last_bar.timestamp, "Indicator computation failed, keeping previous values");
                return Err(e.into());
            }
        };

        info!(
            bar = %snapshot.bar_time,
            close = snapshot.close,
            rsi = %format!("{:.2}", snapshot.rsi),
            atr = snapshot.atr,
            trend = %snapshot.trend,
            "New bar"
        );

        let price = to_decimal(snapshot.close, "close")?;
        let atr = to_decimal(snapshot.atr, "ATR")?;
        self.snapshot = Some(snapshot.clone());

        let meta = self.symbol_meta(&symbol).await?;
        let price = round_to_point(price, meta.point_size);
        let positions = self.broker.get_open_positions(&symbol).await?;

        // Everything above is safe to retry on the next poll
        self.last_bar_time = Some(last_bar.timestamp);

        let at = last_bar.timestamp;
        let mut events = Vec::new();
        self.reconcile(&positions, &last_bar, price, atr, &meta, &mut events).await;

        for position in &positions {
            if self.config.trailing_stops.enabled {
                self.manage_stop(position.ticket, price, atr, &meta, at, &mut events).await;
            } else {
                self.check_rsi_exit(position, &snapshot, price, at, &mut events).await;
            }
        }

        if positions.is_empty() {
            self.try_entry(&snapshot, price, atr, &meta, at, &mut events).await?;
        }

        self.journal_tick(at, &meta).await;

        debug!(events = events.len(), tracked = self.positions.len(), "Tick complete");

        Ok(TickOutcome::Processed(TickSummary {
            bar_time: at,
            indicators: snapshot,
            events,
        }))
    }

    fn compute_indicators(&self, bars: &[PriceBar]) -> Result<IndicatorSnapshot, DataError> {
        validate_bars(bars)?;
        let closes = closes(bars);
        let last = closes.len() - 1;

        let rsi = compute_rsi(&closes, self.config.rsi.period)?;
        let current_rsi = rsi[last].ok_or(DataError::InsufficientHistory {
            indicator: "RSI",
            have: closes.len(),
            need: 2,
        })?;
        let prev_rsi = last.checked_sub(1).and_then(|i| rsi[i]);

        let atr = compute_atr(bars, self.config.atr.period)?;

        let trend = if self.config.trend_filter.enabled {
            self.trend_filter.evaluate(&closes)
        } else {
            TrendState::neutral()
        };

        Ok(IndicatorSnapshot {
            bar_time: bars[last].timestamp,
            close: closes[last],
            rsi: current_rsi,
            prev_rsi,
            atr: atr[last],
            trend,
            volume_ratio: volume_ratio(bars, self.config.momentum.volume_lookback),
        })
    }

    async fn symbol_meta(&mut self, symbol: &str) -> Result<SymbolMeta, BrokerError> {
        if let Some(meta) = &self.symbol_meta {
            return Ok(meta.clone());
        }
        let meta = self.broker.get_symbol_meta(symbol).await?;
        info!(
            symbol,
            contract_size = %meta.contract_size,
            min_stop_distance = %meta.min_stop_distance,
            "Loaded symbol properties"
        );
        self.symbol_meta = Some(meta.clone());
        Ok(meta)
    }

    /// Drop records whose position is gone and adopt positions we do not track.
    ///
    /// A ticket whose open time differs from its record is a different
    /// position: the old record is dropped and a fresh one adopted.
    async fn reconcile(
        &mut self,
        positions: &[Position],
        bar: &PriceBar,
        price: Decimal,
        atr: Decimal,
        meta: &SymbolMeta,
        events: &mut Vec<TickEvent>,
    ) {
        let stale: Vec<u64> = self
            .positions
            .values()
            .filter(|record| !positions.iter().any(|p| record.matches(p)))
            .map(|record| record.ticket)
            .collect();

        for ticket in stale {
            let Some(record) = self.positions.remove(&ticket) else {
                continue;
            };
            let reason = if stop_crossed(&record, bar) {
                ExitReason::StopLoss
            } else {
                ExitReason::External
            };
            let stats = self.trailing.get_statistics(&record);
            info!(
                ticket,
                reason = reason.as_str(),
                stop = %stats.current_stop,
                adjustments = stats.adjustments,
                breakeven = stats.breakeven_triggered,
                locked_in = %stats.locked_in,
                "Position closed at broker"
            );
            self.journal_close(&record, None, None, reason, bar.timestamp).await;
            events.push(TickEvent::Closed {
                ticket,
                reason,
                pnl: None,
            });
        }

        for position in positions {
            if self.positions.contains_key(&position.ticket) {
                continue;
            }

            let mut record = self.trailing.adopt(position, price, atr);
            record.initial_stop = round_to_point(record.initial_stop, meta.point_size);
            if position.stop_loss != Some(record.current_stop) {
                record.current_stop = round_to_point(record.current_stop, meta.point_size);
            }

            info!(
                ticket = position.ticket,
                side = %position.side,
                entry = %position.entry_price,
                held_stop = ?position.stop_loss,
                stop = %record.current_stop,
                "Adopted untracked position"
            );
            self.journal_open(&record).await;
            events.push(TickEvent::Adopted {
                ticket: position.ticket,
                stop: record.current_stop,
            });
            self.positions.insert(position.ticket, record);

            if self.config.trailing_stops.enabled {
                self.sync_stop(position.ticket, position.stop_loss, price, meta, events).await;
            }
        }
    }

    /// Make the broker hold the tracked stop. If it refuses, or the stop is not
    /// placeable at `price`, the shadow record falls back to whatever the broker holds.
    async fn sync_stop(
        &mut self,
        ticket: u64,
        held: Option<Decimal>,
        price: Decimal,
        meta: &SymbolMeta,
        events: &mut Vec<TickEvent>,
    ) {
        let Some((side, target)) = self.positions.get(&ticket).map(|r| (r.side, r.current_stop)) else {
            return;
        };
        if held == Some(target) {
            return;
        }
        if !validate_stop_loss(price, target, side, meta.min_stop_distance) {
            warn!(ticket, stop = %target, price = %price, "Tracked stop not placeable, keeping broker stop");
            if let (Some(held), Some(record)) = (held, self.positions.get_mut(&ticket)) {
                record.current_stop = held;
            }
            return;
        }
        if self.dry_run {
            events.push(TickEvent::DryRun {
                action: format!("set stop of {} to {}", ticket, target),
            });
            return;
        }

        match self.broker.modify_stop_loss(ticket, target).await {
            Ok(()) => {
                info!(ticket, stop = %target, "Protective stop set");
            }
            Err(e) => {
                warn!(ticket, stop = %target, error = %e, "Failed to set protective stop");
                if let (Some(held), Some(record)) = (held, self.positions.get_mut(&ticket)) {
                    record.current_stop = held;
                }
                events.push(TickEvent::StopRejected { ticket, error: e });
            }
        }
    }

    /// Advance the trailing stop of `ticket`, committing only after the broker
    /// accepts the modification.
    async fn manage_stop(
        &mut self,
        ticket: u64,
        price: Decimal,
        atr: Decimal,
        meta: &SymbolMeta,
        at: DateTime<Utc>,
        events: &mut Vec<TickEvent>,
    ) {
        let Some(record) = self.positions.get_mut(&ticket) else {
            return;
        };

        let mut update = self.trailing.evaluate(record, price, atr);
        if update.reason == StopReason::Unchanged {
            return;
        }
        update.new_stop = round_to_point(update.new_stop, meta.point_size);

        if !record.side.is_better_stop(update.new_stop, record.current_stop) {
            // Breakeven reached without a tighter stop only flips the flag
            self.trailing.apply(record, &update, at);
            return;
        }

        // The stop must sit on the loss side of the market and clear the broker minimum
        if !validate_stop_loss(price, update.new_stop, record.side, meta.min_stop_distance) {
            debug!(
                ticket,
                stop = %update.new_stop,
                price = %price,
                min_distance = %meta.min_stop_distance,
                "Stop not placeable at current price, retrying next bar"
            );
            return;
        }

        if self.dry_run {
            info!(ticket, stop = %update.new_stop, reason = %update.reason, "[DRY RUN] Would move stop");
            events.push(TickEvent::DryRun {
                action: format!("move stop of {} to {} ({})", ticket, update.new_stop, update.reason),
            });
            return;
        }

        if let Err(e) = self.broker.modify_stop_loss(ticket, update.new_stop).await {
            warn!(ticket, stop = %update.new_stop, error = %e, "Stop modification rejected");
            events.push(TickEvent::StopRejected { ticket, error: e });
            return;
        }

        let Some(record) = self.positions.get_mut(&ticket) else {
            return;
        };
        let old_stop = record.current_stop;
        self.trailing.apply(record, &update, at);
        let adjustment = record.adjustments.last().cloned();

        info!(
            ticket,
            old_stop = %old_stop,
            new_stop = %update.new_stop,
            reason = %update.reason,
            "Stop moved"
        );
        if let (Some(journal), Some(adjustment)) = (&self.journal, adjustment) {
            if let Err(e) = journal.record_stop_adjustment(ticket, &adjustment).await {
                warn!(error = %e, "Failed to journal stop adjustment");
            }
        }
        events.push(TickEvent::StopMoved {
            ticket,
            old_stop,
            new_stop: update.new_stop,
            reason: update.reason,
        });
    }

    /// RSI exit, used only while trailing stops are disabled.
    async fn check_rsi_exit(
        &mut self,
        position: &Position,
        snapshot: &IndicatorSnapshot,
        price: Decimal,
        at: DateTime<Utc>,
        events: &mut Vec<TickEvent>,
    ) {
        let exit = match position.side {
            Side::Buy => self.signals.should_exit_buy(snapshot.rsi),
            Side::Sell => self.signals.should_exit_sell(snapshot.rsi),
        };
        if !exit {
            return;
        }

        if self.dry_run {
            info!(ticket = position.ticket, rsi = snapshot.rsi, "[DRY RUN] Would close on RSI exit");
            events.push(TickEvent::DryRun {
                action: format!("close {} at {}", position.ticket, price),
            });
            return;
        }

        match self.broker.close_position(position.ticket).await {
            Ok(result) => {
                info!(
                    ticket = position.ticket,
                    price = %result.close_price,
                    pnl = %result.realized_pnl,
                    rsi = snapshot.rsi,
                    "Closed on RSI exit"
                );
                if let Some(record) = self.positions.remove(&position.ticket) {
                    let stats = self.trailing.get_statistics(&record);
                    debug!(
                        ticket = stats.ticket,
                        adjustments = stats.adjustments,
                        breakeven = stats.breakeven_triggered,
                        initial_stop = %stats.initial_stop,
                        "Dropped tracked position"
                    );
                    self.journal_close(
                        &record,
                        Some(result.close_price),
                        Some(result.realized_pnl),
                        ExitReason::RsiExit,
                        at,
                    )
                    .await;
                }
                events.push(TickEvent::Closed {
                    ticket: position.ticket,
                    reason: ExitReason::RsiExit,
                    pnl: Some(result.realized_pnl),
                });
            }
            Err(e) => {
                warn!(ticket = position.ticket, error = %e, "Close rejected");
                events.push(TickEvent::CloseFailed {
                    ticket: position.ticket,
                    error: e,
                });
            }
        }
    }

    /// Signal, size, check the portfolio budget, then place the order.
    async fn try_entry(
        &mut self,
        snapshot: &IndicatorSnapshot,
        price: Decimal,
        atr: Decimal,
        meta: &SymbolMeta,
        at: DateTime<Utc>,
        events: &mut Vec<TickEvent>,
    ) -> Result<(), TickError> {
        let trend = self.config.trend_filter.enabled.then_some(&snapshot.trend);
        let momentum = &self.config.momentum;
        let confirm = Confirmation {
            trend,
            volume_ratio: snapshot.volume_ratio,
            min_volume_ratio: momentum.volume_confirmation.then_some(momentum.min_volume_ratio),
        };

        let side = match self.signals.entry(snapshot.rsi, snapshot.prev_rsi, &confirm) {
            EntrySignal::Buy => Side::Buy,
            EntrySignal::Sell => Side::Sell,
            EntrySignal::None => return Ok(()),
        };

        if let Some(trend) = trend {
            let allowed = match side {
                Side::Buy => trend.allow_buy,
                Side::Sell => trend.allow_sell,
            };
            if !allowed {
                info!(side = %side, trend = %trend, "Entry blocked by trend filter");
                events.push(TickEvent::TrendBlocked { side });
                return Ok(());
            }
        }

        let symbol = self.config.symbol.clone();
        let balance = self.broker.get_account_balance().await?;

        let stop = if self.config.trailing_stops.enabled {
            self.trailing.initial_stop(side, price, atr)
        } else {
            calc_stop_loss(price, atr, self.config.atr.stop_multiplier, side)
        };
        let stop = round_to_point(stop, meta.point_size);
        if !validate_stop_loss(price, stop, side, meta.min_stop_distance) {
            warn!(
                side = %side,
                stop = %stop,
                min_distance = %meta.min_stop_distance,
                "Initial stop too close to market, entry skipped"
            );
            events.push(TickEvent::StopTooClose { side, stop });
            return Ok(());
        }
        let stop_distance = (price - stop).abs();

        let sizing = self.sizer.size(&symbol, balance, price, stop_distance, meta.contract_size);
        let current_risk = self.risk.portfolio_risk(self.positions.values(), meta.contract_size, balance);
        let proposed_risk = RiskManager::risk_percent(
            RiskManager::position_risk(&symbol, side, price, stop, sizing.lots, meta.contract_size),
            balance,
        );

        let check = self.risk.can_open_position(current_risk, proposed_risk);
        if let Some(rejection) = check.rejection() {
            info!(side = %side, reason = %rejection, "Entry rejected by portfolio risk limit");
            events.push(TickEvent::EntryRejected {
                side,
                reason: rejection,
            });
            return Ok(());
        }

        info!(
            side = %side,
            rsi = %format!("{:.2}", snapshot.rsi),
            price = %price,
            stop = %stop,
            lots = %sizing.lots,
            risk_percent = %sizing.effective_risk_percent,
            portfolio_risk = %current_risk,
            "Entry signal"
        );

        if self.dry_run {
            events.push(TickEvent::DryRun {
                action: format!("{} {} {} at {} stop {}", side, sizing.lots, symbol, price, stop),
            });
            return Ok(());
        }

        let order = OrderRequest {
            symbol: symbol.clone(),
            side,
            volume: sizing.lots,
            stop_loss: Some(stop),
        };
        let fill = match self.broker.place_order(order).await {
            Ok(fill) => fill,
            Err(e) => {
                // Never resubmitted: a lost acknowledgement could mean a duplicate fill
                warn!(side = %side, error = %e, "Order rejected");
                events.push(TickEvent::OrderFailed { side, error: e });
                return Ok(());
            }
        };

        let position = Position {
            ticket: fill.ticket,
            symbol,
            side,
            volume: sizing.lots,
            entry_price: fill.fill_price,
            stop_loss: Some(stop),
            open_time: fill.open_time,
        };
        let mut record = self.trailing.initialize(&position, price, atr);
        if self.config.trailing_stops.enabled {
            record.initial_stop = round_to_point(record.initial_stop, meta.point_size);
        } else {
            record.initial_stop = stop;
        }
        record.current_stop = record.initial_stop;

        info!(
            ticket = fill.ticket,
            side = %side,
            fill = %fill.fill_price,
            volume = %sizing.lots,
            stop = %record.current_stop,
            at = %at,
            "Position opened"
        );
        self.journal_open(&record).await;
        events.push(TickEvent::Opened {
            ticket: fill.ticket,
            side,
            volume: sizing.lots,
            price: fill.fill_price,
            stop: record.current_stop,
        });
        self.positions.insert(fill.ticket, record);

        // Slippage moves the hard stop with the fill price
        if self.config.trailing_stops.enabled {
            self.sync_stop(fill.ticket, Some(stop), price, meta, events).await;
        }

        Ok(())
    }

    async fn journal_open(&self, record: &TrackedPosition) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record_open(record).await {
                warn!(ticket = record.ticket, error = %e, "Failed to journal trade open");
            }
        }
    }

    async fn journal_close(
        &self,
        record: &TrackedPosition,
        exit_price: Option<Decimal>,
        pnl: Option<Decimal>,
        reason: ExitReason,
        at: DateTime<Utc>,
    ) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record_close(record, exit_price, pnl, reason, at).await {
                warn!(ticket = record.ticket, error = %e, "Failed to journal trade close");
            }
        }
    }

    async fn journal_tick(&self, at: DateTime<Utc>, meta: &SymbolMeta) {
        let Some(journal) = &self.journal else {
            return;
        };

        if let Err(e) = journal.record_tick(at).await {
            warn!(error = %e, "Failed to journal tick");
        }

        match self.broker.get_account_balance().await {
            Ok(balance) => {
                let open_risk = self.risk.portfolio_risk(self.positions.values(), meta.contract_size, balance);
                if let Err(e) = journal.record_equity(at, balance, self.positions.len(), open_risk).await {
                    warn!(error = %e, "Failed to journal equity");
                }
            }
            Err(e) => warn!(error = %e, "Balance unavailable for equity snapshot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CloseResult, OrderFill, Timeframe};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use rust_decimal_macros::dec;

    /// In-memory broker driven by the test.
    #[derive(Default)]
    struct ScriptedBroker {
        bars: Vec<PriceBar>,
        balance: Decimal,
        positions: Vec<Position>,
        orders: Vec<OrderRequest>,
        modifies: Vec<(u64, Decimal)>,
        closes: Vec<u64>,
        fail_bars: bool,
        fail_modify: bool,
        next_ticket: u64,
        meta: SymbolMeta,
    }

    impl ScriptedBroker {
        fn last_close(&self) -> Decimal {
            Decimal::from_f64(self.bars.last().unwrap().close).unwrap().round_dp(5)
        }
    }

    #[async_trait]
    impl BrokerGateway for ScriptedBroker {
        async fn get_recent_bars(&self, _symbol: &str, _timeframe: Timeframe, count: usize) -> Result<Vec<PriceBar>, BrokerError> {
            if self.fail_bars {
                return Err(BrokerError::Connection("terminal offline".to_string()));
            }
            let start = self.bars.len().saturating_sub(count);
            Ok(self.bars[start..].to_vec())
        }

        async fn get_account_balance(&self) -> Result<Decimal, BrokerError> {
            Ok(self.balance)
        }

        async fn get_open_positions(&self, _symbol: &str) -> Result<Vec<Position>, BrokerError> {
            Ok(self.positions.clone())
        }

        async fn place_order(&mut self, order: OrderRequest) -> Result<OrderFill, BrokerError> {
            self.next_ticket += 1;
            let fill = OrderFill {
                ticket: self.next_ticket,
                fill_price: self.last_close(),
                open_time: self.bars.last().unwrap().timestamp,
            };
            self.positions.push(Position {
                ticket: fill.ticket,
                symbol: order.symbol.clone(),
                side: order.side,
                volume: order.volume,
                entry_price: fill.fill_price,
                stop_loss: order.stop_loss,
                open_time: fill.open_time,
            });
            self.orders.push(order);
            Ok(fill)
        }

        async fn modify_stop_loss(&mut self, ticket: u64, stop_loss: Decimal) -> Result<(), BrokerError> {
            self.modifies.push((ticket, stop_loss));
            if self.fail_modify {
                return Err(BrokerError::rejected(10016, "Invalid stops"));
            }
            let position = self
                .positions
                .iter_mut()
                .find(|p| p.ticket == ticket)
                .ok_or(BrokerError::UnknownPosition(ticket))?;
            position.stop_loss = Some(stop_loss);
            Ok(())
        }

        async fn close_position(&mut self, ticket: u64) -> Result<CloseResult, BrokerError> {
            self.closes.push(ticket);
            self.positions.retain(|p| p.ticket != ticket);
            Ok(CloseResult {
                close_price: self.last_close(),
                realized_pnl: dec!(42),
            })
        }

        async fn get_symbol_meta(&self, _symbol: &str) -> Result<SymbolMeta, BrokerError> {
            Ok(self.meta.clone())
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
    }

    fn bar(i: usize, close: f64) -> PriceBar {
        PriceBar::new(
            start() + ChronoDuration::minutes(15 * i as i64),
            close,
            close + 0.0005,
            close - 0.0005,
            close,
        )
    }

    /// `n` bars moving `step` per bar from 1.1000.
    fn trending(n: usize, step: f64) -> Vec<PriceBar> {
        (0..n).map(|i| bar(i, 1.1000 + step * i as f64)).collect()
    }

    fn config() -> TradingConfig {
        let mut config = TradingConfig::default();
        config.bars_count = 30;
        config.rsi.period = 3;
        config.atr.period = 3;
        config.trend_filter.enabled = false;
        config
    }

    fn broker(bars: Vec<PriceBar>) -> ScriptedBroker {
        ScriptedBroker {
            bars,
            balance: dec!(10000),
            ..Default::default()
        }
    }

    fn held(ticket: u64, side: Side, entry: Decimal, stop: Option<Decimal>) -> Position {
        Position {
            ticket,
            symbol: "EURUSD".to_string(),
            side,
            volume: dec!(0.5),
            entry_price: entry,
            stop_loss: stop,
            open_time: start(),
        }
    }

    fn push_bar(bot: &mut Bot<ScriptedBroker>, close: f64) {
        let bars = &mut bot.broker_mut().bars;
        let i = bars.len();
        bars.push(bar(i, close));
    }

    async fn processed(bot: &mut Bot<ScriptedBroker>) -> TickSummary {
        match tokio_test::assert_ok!(bot.tick().await) {
            TickOutcome::Processed(summary) => summary,
            TickOutcome::NoNewBar => panic!("expected a new bar"),
        }
    }

    #[tokio::test]
    async fn test_oversold_opens_buy_with_hard_stop() {
        let mut bot = Bot::new(config(), broker(trending(20, -0.001))).unwrap();
        let summary = processed(&mut bot).await;

        assert!(summary.indicators.rsi < 30.0);
        let order = &bot.broker().orders[0];
        assert_eq!(order.side, Side::Buy);
        let stop = order.stop_loss.unwrap();
        assert!(stop < dec!(1.081));

        let record = &bot.positions()[&1];
        assert_eq!(record.current_stop, stop);
        assert_eq!(record.initial_stop, stop);
        assert!(bot.broker().modifies.is_empty());
        assert!(summary.events.iter().any(|e| matches!(e, TickEvent::Opened { ticket: 1, side: Side::Buy, .. })));
    }

    #[tokio::test]
    async fn test_same_bar_is_not_processed_twice() {
        let mut bot = Bot::new(config(), broker(trending(20, 0.001))).unwrap();
        processed(&mut bot).await;
        assert!(matches!(bot.tick().await.unwrap(), TickOutcome::NoNewBar));

        push_bar(&mut bot, 1.1200);
        processed(&mut bot).await;
    }

    #[tokio::test]
    async fn test_rejected_modify_keeps_stop() {
        let mut scripted = broker(trending(20, 0.001));
        scripted.positions.push(held(5, Side::Buy, dec!(1.0900), Some(dec!(1.0850))));
        scripted.fail_modify = true;

        let mut bot = Bot::new(config(), scripted).unwrap();
        let summary = processed(&mut bot).await;

        let record = &bot.positions()[&5];
        assert_eq!(record.current_stop, dec!(1.0850));
        assert!(!record.breakeven_triggered);
        assert!(record.adjustments.is_empty());
        assert!(summary.events.iter().any(|e| matches!(e, TickEvent::StopRejected { ticket: 5, .. })));

        bot.broker_mut().fail_modify = false;
        push_bar(&mut bot, 1.1200);
        let summary = processed(&mut bot).await;

        let record = &bot.positions()[&5];
        assert!(record.breakeven_triggered);
        assert!(record.current_stop > dec!(1.0900));
        assert_eq!(bot.broker().positions[0].stop_loss, Some(record.current_stop));
        assert!(summary.events.iter().any(|e| matches!(
            e,
            TickEvent::StopMoved { ticket: 5, reason: StopReason::Breakeven, .. }
        )));
    }

    #[tokio::test]
    async fn test_stop_inside_min_distance_waits_for_room() {
        let mut scripted = broker(trending(20, 0.001));
        scripted.meta.min_stop_distance = dec!(0.0050);
        scripted.positions.push(held(5, Side::Buy, dec!(1.1150), Some(dec!(1.1130))));

        let mut bot = Bot::new(config(), scripted).unwrap();
        let summary = processed(&mut bot).await;

        // Breakeven is due but would sit 0.00385 under a 1.1190 close
        let record = &bot.positions()[&5];
        assert!(bot.broker().modifies.is_empty());
        assert_eq!(record.current_stop, dec!(1.1130));
        assert!(!record.breakeven_triggered);
        assert!(record.adjustments.is_empty());
        assert!(!summary.events.iter().any(|e| matches!(e, TickEvent::StopMoved { .. })));

        push_bar(&mut bot, 1.1220);
        let summary = processed(&mut bot).await;

        let record = &bot.positions()[&5];
        assert_eq!(bot.broker().modifies.len(), 1);
        assert!(record.breakeven_triggered);
        assert!(record.current_stop > dec!(1.1150));
        assert_eq!(bot.broker().positions[0].stop_loss, Some(record.current_stop));
        assert!(summary.events.iter().any(|e| matches!(
            e,
            TickEvent::StopMoved { ticket: 5, reason: StopReason::Breakeven, .. }
        )));
    }

    #[tokio::test]
    async fn test_adverse_breakeven_is_not_sent_above_market() {
        let mut scripted = broker(trending(20, 0.001));
        scripted.positions.push(held(5, Side::Buy, dec!(1.1250), Some(dec!(1.1150))));

        let mut bot = Bot::new(config(), scripted).unwrap();
        processed(&mut bot).await;

        // Entry is 0.006 above the close, so breakeven would land above the market
        let record = &bot.positions()[&5];
        assert!(bot.broker().modifies.is_empty());
        assert_eq!(record.current_stop, dec!(1.1150));
        assert!(!record.breakeven_triggered);
    }

    #[tokio::test]
    async fn test_initial_stop_inside_min_distance_skips_entry() {
        let mut scripted = broker(trending(20, -0.001));
        scripted.meta.min_stop_distance = dec!(0.0100);

        let mut bot = Bot::new(config(), scripted).unwrap();
        let summary = processed(&mut bot).await;

        assert!(bot.broker().orders.is_empty());
        assert!(bot.positions().is_empty());
        assert!(summary
            .events
            .iter()
            .any(|e| matches!(e, TickEvent::StopTooClose { side: Side::Buy, .. })));
    }

    #[tokio::test]
    async fn test_rsi_exit_only_without_trailing() {
        let mut config = config();
        config.trailing_stops.enabled = false;

        let mut scripted = broker(trending(20, 0.001));
        scripted.positions.push(held(5, Side::Buy, dec!(1.0900), Some(dec!(1.0850))));

        let mut bot = Bot::new(config, scripted).unwrap();
        let summary = processed(&mut bot).await;

        assert_eq!(bot.broker().closes, vec![5]);
        assert!(bot.broker().modifies.is_empty());
        assert!(bot.positions().is_empty());
        assert!(summary.events.contains(&TickEvent::Closed {
            ticket: 5,
            reason: ExitReason::RsiExit,
            pnl: Some(dec!(42)),
        }));
    }

    #[tokio::test]
    async fn test_trailing_owns_exits() {
        let mut scripted = broker(trending(20, 0.001));
        scripted.positions.push(held(5, Side::Buy, dec!(1.0900), Some(dec!(1.0850))));

        let mut bot = Bot::new(config(), scripted).unwrap();
        processed(&mut bot).await;

        assert!(bot.broker().closes.is_empty());
        assert!(bot.positions().contains_key(&5));
    }

    #[tokio::test]
    async fn test_position_closed_at_broker_drops_record() {
        let mut scripted = broker(trending(20, 0.001));
        scripted.positions.push(held(5, Side::Buy, dec!(1.0900), Some(dec!(1.0850))));

        let mut bot = Bot::new(config(), scripted).unwrap();
        processed(&mut bot).await;
        let stop = bot.positions()[&5].current_stop.to_f64().unwrap();

        bot.broker_mut().positions.clear();
        push_bar(&mut bot, stop - 0.0010);
        let summary = processed(&mut bot).await;

        assert!(!bot.positions().contains_key(&5));
        assert!(summary.events.iter().any(|e| matches!(
            e,
            TickEvent::Closed { ticket: 5, reason: ExitReason::StopLoss, pnl: None }
        )));
    }

    #[tokio::test]
    async fn test_reused_ticket_gets_fresh_record() {
        let mut scripted = broker(trending(20, 0.001));
        scripted.positions.push(held(5, Side::Buy, dec!(1.0900), None));

        let mut bot = Bot::new(config(), scripted).unwrap();
        processed(&mut bot).await;

        let mut reused = held(5, Side::Sell, dec!(1.1200), None);
        reused.open_time = start() + ChronoDuration::hours(6);
        bot.broker_mut().positions = vec![reused.clone()];
        push_bar(&mut bot, 1.1190);
        let summary = processed(&mut bot).await;

        let record = &bot.positions()[&5];
        assert_eq!(record.side, Side::Sell);
        assert_eq!(record.opened_at, reused.open_time);
        assert!(record.adjustments.is_empty());
        assert!(summary.events.iter().any(|e| matches!(e, TickEvent::Closed { ticket: 5, .. })));
        assert!(summary.events.iter().any(|e| matches!(e, TickEvent::Adopted { ticket: 5, .. })));
    }

    #[tokio::test]
    async fn test_portfolio_limit_rejects_entry() {
        let mut config = config();
        config.risk.max_total_risk_percent = dec!(0.5);

        let mut bot = Bot::new(config, broker(trending(20, -0.001))).unwrap();
        let summary = processed(&mut bot).await;

        assert!(bot.broker().orders.is_empty());
        assert!(bot.positions().is_empty());
        let rejection = summary
            .events
            .iter()
            .find_map(|e| match e {
                TickEvent::EntryRejected { reason, .. } => Some(reason.clone()),
                _ => None,
            })
            .unwrap();
        assert!(rejection.proposed_risk_percent > dec!(0.5));
    }

    #[tokio::test]
    async fn test_trend_filter_blocks_counter_trend_entry() {
        let mut config = config();
        config.trend_filter = crate::trading::TrendFilterConfig {
            enabled: true,
            fast_period: 2,
            medium_period: 3,
            slow_period: 4,
            strength_threshold: 0.0001,
        };

        let mut bot = Bot::new(config, broker(trending(20, -0.001))).unwrap();
        let summary = processed(&mut bot).await;

        assert!(!summary.indicators.trend.allow_buy);
        assert!(bot.broker().orders.is_empty());
        assert!(summary.events.contains(&TickEvent::TrendBlocked { side: Side::Buy }));
    }

    #[tokio::test]
    async fn test_dry_run_sends_nothing() {
        let mut bot = Bot::new(config(), broker(trending(20, -0.001))).unwrap().with_dry_run(true);
        let summary = processed(&mut bot).await;

        assert!(bot.broker().orders.is_empty());
        assert!(summary.events.iter().any(|e| matches!(e, TickEvent::DryRun { .. })));
    }

    #[tokio::test]
    async fn test_bad_bar_keeps_previous_indicators() {
        let mut bot = Bot::new(config(), broker(trending(20, 0.001))).unwrap();
        processed(&mut bot).await;
        let before = bot.snapshot().unwrap().bar_time;

        let bars = &mut bot.broker_mut().bars;
        let mut broken = bar(bars.len(), 1.1200);
        broken.low = broken.high + 0.0010;
        bars.push(broken);

        let result = bot.tick().await;
        assert!(matches!(result, Err(TickError::Data(DataError::InvalidBar { .. }))));
        assert_eq!(bot.snapshot().unwrap().bar_time, before);
    }

    #[tokio::test]
    async fn test_broker_outage_is_transient() {
        let mut scripted = broker(trending(20, 0.001));
        scripted.fail_bars = true;

        let mut bot = Bot::new(config(), scripted).unwrap();
        let err = tokio_test::assert_err!(bot.tick().await);
        assert!(err.is_transient());
        assert!(bot.snapshot().is_none());
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let mut config = config();
        config.trailing_stops.strategy = "X".to_string();
        assert!(matches!(
            Bot::new(config, broker(Vec::new())),
            Err(ConfigError::UnknownTrailingStrategy(_))
        ));
    }
}
