//! Command-line entry point for the RSI trading bot.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rsi_trader::api::RestBroker;
use rsi_trader::bot::Bot;
use rsi_trader::db::Journal;
use rsi_trader::models::{Side, SymbolMeta};
use rsi_trader::replay::{self, ReplayConfig};
use rsi_trader::trading::{
    calc_fixed_stop_loss, calc_position_size, calc_stop_loss, pip_size, risk_reward_ratio, validate_stop_loss,
    DynamicSizer, SignalGenerator, TradingConfig,
};

/// RSI trading bot CLI.
#[derive(Parser)]
#[command(name = "rsi-trader")]
#[command(about = "RSI reversal trading bot with staged trailing stops", long_about = None)]
struct Cli {
    /// Trading configuration file (JSON); defaults are used when omitted
    #[arg(short, long, env = "RSI_TRADER_CONFIG")]
    config: Option<PathBuf>,

    /// Journal database URL
    #[arg(short, long, default_value = "sqlite:./rsi_trader.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trade live against the broker bridge
    Run {
        /// Base URL of the broker bridge
        #[arg(long, env = "BROKER_URL")]
        broker_url: String,

        /// Bearer token for the broker bridge
        #[arg(long, env = "BROKER_TOKEN", hide_env_values = true)]
        broker_token: Option<String>,

        /// Dry run (log intended actions, send nothing)
        #[arg(long)]
        dry_run: bool,
    },

    /// Replay a CSV bar file through the bot with simulated fills
    Replay {
        /// Bar file with columns time,open,high,low,close[,volume]
        file: PathBuf,

        /// Starting balance for the simulation
        #[arg(short, long, default_value = "10000")]
        initial_balance: Decimal,

        /// Units per lot
        #[arg(long, default_value = "100000")]
        contract_size: Decimal,

        /// Also write the replay to the journal database
        #[arg(long)]
        journal: bool,
    },

    /// Show the effective configuration
    Config,

    /// Show bot status and journal statistics
    Status,

    /// Calculate a position size without trading
    Size {
        /// Account balance
        #[arg(short, long)]
        balance: Decimal,

        /// Entry price
        #[arg(short, long)]
        entry: Decimal,

        /// Position side (buy or sell)
        #[arg(long, default_value = "buy")]
        side: Side,

        /// Stop-loss price
        #[arg(short, long, conflicts_with_all = ["atr", "stop_pips"])]
        stop: Option<Decimal>,

        /// Stop distance in pips from entry
        #[arg(long, conflicts_with = "atr")]
        stop_pips: Option<Decimal>,

        /// ATR; the stop distance becomes ATR x the configured multiplier
        #[arg(short, long)]
        atr: Option<Decimal>,

        /// Take-profit price, reported as a risk/reward ratio
        #[arg(short, long)]
        take_profit: Option<Decimal>,

        /// Plain fixed-fraction sizing without the exposure cap
        #[arg(long)]
        fixed: bool,

        /// Symbol (defaults to the configured one)
        #[arg(long)]
        symbol: Option<String>,

        /// Units per lot
        #[arg(long, default_value = "100000")]
        contract_size: Decimal,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins when set
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(log_level).into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = TradingConfig::load(cli.config.as_deref()).context("Failed to load trading configuration")?;

    match cli.command {
        Commands::Run {
            broker_url,
            broker_token,
            dry_run,
        } => {
            info!(url = %broker_url, symbol = %config.symbol, "Connecting to broker bridge");

            let broker = RestBroker::new(&broker_url, broker_token, config.magic_number)?;
            let journal = Journal::new(&cli.database).await?;

            println!("\n=== RSI Trading Bot ===");
            println!("Symbol:      {} ({})", config.symbol, config.timeframe);
            println!("RSI:         {} [{} / {}] exit {}", config.rsi.period, config.rsi.oversold, config.rsi.overbought, config.rsi.exit_level);
            println!(
                "Exits:       {}",
                if config.trailing_stops.enabled {
                    format!("trailing stop, strategy {}", config.trailing_stops.strategy)
                } else {
                    "RSI exit level".to_string()
                }
            );
            println!("Mode:        {}", if dry_run { "DRY RUN (no orders sent)" } else { "LIVE TRADING" });
            println!("\nPress Ctrl+C to stop.\n");

            let mut bot = Bot::new(config, broker)?
                .with_journal(journal)
                .with_dry_run(dry_run);
            bot.run().await?;
        }

        Commands::Replay {
            file,
            initial_balance,
            contract_size,
            journal,
        } => {
            let replay = ReplayConfig {
                initial_balance,
                meta: SymbolMeta {
                    contract_size,
                    ..SymbolMeta::default()
                },
            };
            let journal = if journal {
                Some(Journal::new(&cli.database).await?)
            } else {
                None
            };

            let report = replay::replay_file(&file, config, &replay, journal).await?;
            println!("{}", report);
        }

        Commands::Config => {
            let params = config.trailing_stops.params()?;
            let signals = SignalGenerator::from_config(&config.rsi, &config.momentum)?.summary();
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!("\nSignals:");
            println!("  Buy below:          {}", signals.oversold);
            println!("  Sell above:         {}", signals.overbought);
            println!("  Exit level:         {}", signals.exit_level);
            println!("  Momentum filter:    {}", if signals.momentum_enabled { "on" } else { "off" });
            println!("\nTrailing stop (effective, x ATR):");
            println!("  Breakeven trigger:  {}", params.breakeven_trigger);
            println!("  Breakeven buffer:   {}", params.breakeven_buffer);
            println!("  Trail distance:     {}", params.trail_distance);
            println!("  Hard stop:          {}", params.hard_stop_distance);
            println!("Minimum bars:         {}", config.min_bars());
        }

        Commands::Status => {
            let journal = Journal::new(&cli.database).await?;

            println!("\n=== Bot Status ===");
            match journal.run_state().await? {
                Some(state) => {
                    println!("Symbol:       {}", state.symbol);
                    println!("Running:      {}", if state.is_running { "yes" } else { "no" });
                    println!("Dry run:      {}", if state.dry_run { "yes" } else { "no" });
                    println!("Ticks:        {}", state.ticks);
                    println!("Last tick:    {}", state.last_tick_at.as_deref().unwrap_or("-"));
                    println!("Started:      {}", state.started_at);
                }
                None => println!("The bot has not been run yet."),
            }

            let summary = journal.summary().await?;
            println!("\n--- Journal ---");
            println!("Open trades:      {}", summary.open_trades);
            println!("Closed trades:    {} ({} winning)", summary.closed_trades, summary.winning_trades);
            println!("Total P&L:        {:.2}", summary.total_pnl);
            println!("Stop adjustments: {}", summary.stop_adjustments);
            if let Some(balance) = summary.last_balance {
                println!("Last balance:     {:.2}", balance);
            }
            println!("Max drawdown:     {:.2}%", summary.max_drawdown * 100.0);

            let trades = journal.recent_trades(10).await?;
            if !trades.is_empty() {
                println!("\n{:<10} {:<8} {:<5} {:>6} {:>10} {:>10} {:>10} {:<12}", "TICKET", "SYMBOL", "SIDE", "LOTS", "ENTRY", "EXIT", "P&L", "REASON");
                println!("{}", "-".repeat(78));
                for t in trades {
                    println!(
                        "{:<10} {:<8} {:<5} {:>6.2} {:>10.5} {:>10} {:>10} {:<12}",
                        t.ticket,
                        t.symbol,
                        t.side,
                        t.volume,
                        t.entry_price,
                        t.exit_price.map(|p| format!("{:.5}", p)).unwrap_or_else(|| "open".to_string()),
                        t.pnl.map(|p| format!("{:.2}", p)).unwrap_or_else(|| "-".to_string()),
                        t.exit_reason.as_deref().unwrap_or("-"),
                    );
                }
            }
        }

        Commands::Size {
            balance,
            entry,
            side,
            stop,
            stop_pips,
            atr,
            take_profit,
            fixed,
            symbol,
            contract_size,
        } => {
            let symbol = symbol.unwrap_or_else(|| config.symbol.clone());
            let stop = match (stop, stop_pips, atr) {
                (Some(stop), _, _) => stop,
                (None, Some(pips), _) => calc_fixed_stop_loss(entry, pips, side, pip_size(&symbol)),
                (None, None, Some(atr)) => calc_stop_loss(entry, atr, config.atr.stop_multiplier, side),
                (None, None, None) => anyhow::bail!("one of --stop, --stop-pips or --atr is required"),
            };
            if !validate_stop_loss(entry, stop, side, Decimal::ZERO) {
                anyhow::bail!("stop {} is not on the losing side of a {} at {}", stop, side, entry);
            }
            let stop_distance = (entry - stop).abs();

            println!("\n=== Position Size: {} {} ===", side, symbol);
            println!("Stop:            {} (distance {})", stop, stop_distance);
            if let Some(tp) = take_profit {
                match risk_reward_ratio(entry, stop, tp) {
                    Some(rr) => println!("Risk/reward:     1:{:.2}", rr),
                    None => println!("Risk/reward:     -"),
                }
            }

            if fixed {
                let max_lot = config.risk.max_lot.unwrap_or(Decimal::MAX);
                let lots = calc_position_size(
                    balance,
                    config.risk.risk_per_trade_percent,
                    stop_distance,
                    contract_size,
                    config.risk.min_lot,
                    max_lot,
                );
                println!("Risk:            {}% = {:.2}", config.risk.risk_per_trade_percent, balance * config.risk.risk_per_trade_percent / Decimal::ONE_HUNDRED);
                println!("Lots:            {} (fixed fraction)", lots);
                return Ok(());
            }

            let sizer = DynamicSizer::new(config.risk.clone());
            let decision = sizer.size(&symbol, balance, entry, stop_distance, contract_size);

            println!("Pips:            {:.1}", decision.stop_pips);
            println!("Pip value/lot:   {:.2}", decision.pip_value);
            println!(
                "Risk:            {}%{} = {:.2}",
                decision.effective_risk_percent,
                if decision.risk_capped { " (capped)" } else { "" },
                decision.risk_amount
            );
            println!("Exposure cap:    {:.2} lots", decision.dynamic_max_lots);
            println!("Lots:            {}{}", decision.lots, if decision.fallback { " (fallback)" } else { "" });
        }
    }

    Ok(())
}
