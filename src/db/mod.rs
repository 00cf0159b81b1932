//! SQLite trade journal.
//!
//! Append-mostly audit log of what the bot did:
//! - Opened and closed trades
//! - Every committed stop adjustment
//! - Balance snapshots per processed bar
//! - Run state (started/stopped, last tick)
//!
//! The journal is never read back into the shadow position book; a restart
//! re-adopts positions from the broker instead.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::ExitReason;
use crate::trading::{StopAdjustment, TrackedPosition};

pub struct Journal {
    pool: SqlitePool,
}

/// Stored trade row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTrade {
    pub ticket: i64,
    pub symbol: String,
    pub side: String,
    pub volume: f64,
    pub entry_price: f64,
    pub initial_stop: f64,
    pub exit_price: Option<f64>,
    pub pnl: Option<f64>,
    pub exit_reason: Option<String>,
    pub opened_at: String,
    pub closed_at: Option<String>,
}

/// Bot run state.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunState {
    pub symbol: String,
    pub is_running: bool,
    pub dry_run: bool,
    pub ticks: i64,
    pub last_tick_at: Option<String>,
    pub started_at: String,
    pub updated_at: String,
}

/// Aggregates for the `status` command.
#[derive(Debug, Clone, Default)]
pub struct JournalSummary {
    pub open_trades: i64,
    pub closed_trades: i64,
    pub winning_trades: i64,
    pub total_pnl: f64,
    pub stop_adjustments: i64,
    pub last_balance: Option<f64>,
    pub max_drawdown: f64,
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

impl Journal {
    /// Open (creating if needed) the journal at `database_url`.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every in-memory connection is its own database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let journal = Self { pool };
        journal.run_migrations().await?;

        Ok(journal)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                symbol TEXT NOT NULL,
                is_running INTEGER NOT NULL DEFAULT 0,
                dry_run INTEGER NOT NULL DEFAULT 0,
                ticks INTEGER NOT NULL DEFAULT 0,
                last_tick_at TEXT,
                started_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Ticket plus open time identifies a position; brokers may reuse tickets
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticket INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                volume REAL NOT NULL,
                entry_price REAL NOT NULL,
                initial_stop REAL NOT NULL,
                exit_price REAL,
                pnl REAL,
                exit_reason TEXT,
                opened_at TEXT NOT NULL,
                closed_at TEXT,
                UNIQUE(ticket, opened_at)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stop_adjustments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticket INTEGER NOT NULL,
                old_stop REAL NOT NULL,
                new_stop REAL NOT NULL,
                reason TEXT NOT NULL,
                highest_price REAL NOT NULL,
                lowest_price REAL NOT NULL,
                adjusted_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS equity (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                balance REAL NOT NULL,
                open_positions INTEGER NOT NULL,
                open_risk_percent REAL NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_open ON trades(closed_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Run State ====================

    pub async fn mark_started(&self, symbol: &str, dry_run: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_state (id, symbol, is_running, dry_run, ticks, started_at, updated_at)
            VALUES (1, ?, 1, ?, 0, datetime('now'), datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                symbol = excluded.symbol,
                is_running = 1,
                dry_run = excluded.dry_run,
                ticks = 0,
                started_at = datetime('now'),
                updated_at = datetime('now')
            "#,
        )
        .bind(symbol)
        .bind(dry_run)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_tick(&self, bar_time: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE run_state SET ticks = ticks + 1, last_tick_at = ?, updated_at = datetime('now') WHERE id = 1",
        )
        .bind(bar_time.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_stopped(&self) -> Result<()> {
        sqlx::query("UPDATE run_state SET is_running = 0, updated_at = datetime('now') WHERE id = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn run_state(&self) -> Result<Option<RunState>> {
        sqlx::query_as::<_, RunState>(
            "SELECT symbol, is_running, dry_run, ticks, last_tick_at, started_at, updated_at FROM run_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read run state")
    }

    // ==================== Trades ====================

    pub async fn record_open(&self, position: &TrackedPosition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO trades (ticket, symbol, side, volume, entry_price, initial_stop, opened_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(position.ticket as i64)
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(to_f64(position.volume))
        .bind(to_f64(position.entry_price))
        .bind(to_f64(position.initial_stop))
        .bind(position.opened_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Close the journal row of `position`. Exit price and P&L are unknown
    /// when the broker closed the position on its own.
    pub async fn record_close(
        &self,
        position: &TrackedPosition,
        exit_price: Option<Decimal>,
        pnl: Option<Decimal>,
        reason: ExitReason,
        closed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trades SET
                exit_price = ?,
                pnl = ?,
                exit_reason = ?,
                closed_at = ?
            WHERE ticket = ? AND opened_at = ? AND closed_at IS NULL
            "#,
        )
        .bind(exit_price.map(to_f64))
        .bind(pnl.map(to_f64))
        .bind(reason.as_str())
        .bind(closed_at.to_rfc3339())
        .bind(position.ticket as i64)
        .bind(position.opened_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_trades(&self, limit: i64) -> Result<Vec<StoredTrade>> {
        sqlx::query_as::<_, StoredTrade>(
            r#"
            SELECT ticket, symbol, side, volume, entry_price, initial_stop, exit_price, pnl,
                   exit_reason, opened_at, closed_at
            FROM trades ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to read trades")
    }

    pub async fn record_stop_adjustment(&self, ticket: u64, adjustment: &StopAdjustment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stop_adjustments (ticket, old_stop, new_stop, reason, highest_price, lowest_price, adjusted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ticket as i64)
        .bind(to_f64(adjustment.old_stop))
        .bind(to_f64(adjustment.new_stop))
        .bind(adjustment.reason.as_str())
        .bind(to_f64(adjustment.highest_price))
        .bind(to_f64(adjustment.lowest_price))
        .bind(adjustment.at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Equity ====================

    pub async fn record_equity(
        &self,
        at: DateTime<Utc>,
        balance: Decimal,
        open_positions: usize,
        open_risk_percent: Decimal,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO equity (timestamp, balance, open_positions, open_risk_percent) VALUES (?, ?, ?, ?)",
        )
        .bind(at.to_rfc3339())
        .bind(to_f64(balance))
        .bind(open_positions as i64)
        .bind(to_f64(open_risk_percent))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Max drawdown (0.0 to 1.0) of the recorded balance curve.
    pub async fn max_drawdown(&self) -> Result<f64> {
        let balances: Vec<f64> = sqlx::query_scalar("SELECT balance FROM equity ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut peak = 0.0f64;
        let mut max_dd = 0.0f64;
        for balance in balances {
            peak = peak.max(balance);
            if peak > 0.0 {
                max_dd = max_dd.max((peak - balance) / peak);
            }
        }

        Ok(max_dd)
    }

    pub async fn summary(&self) -> Result<JournalSummary> {
        let (open_trades, closed_trades, winning_trades, total_pnl): (i64, i64, i64, f64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN closed_at IS NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN closed_at IS NOT NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN pnl > 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(pnl), 0.0)
            FROM trades
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let stop_adjustments: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stop_adjustments")
            .fetch_one(&self.pool)
            .await?;

        let last_balance: Option<f64> = sqlx::query_scalar("SELECT balance FROM equity ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(JournalSummary {
            open_trades,
            closed_trades,
            winning_trades,
            total_pnl,
            stop_adjustments,
            last_balance,
            max_drawdown: self.max_drawdown().await?,
        })
    }
}
