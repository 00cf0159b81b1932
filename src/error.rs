//! Error taxonomy for the trading core.
//!
//! Data and broker errors are per-tick and recoverable: the loop logs them and
//! polls again. Configuration errors are fatal and only raised at start-up.
//! Portfolio-cap rejections are not errors at all; they travel as
//! [`RiskRejection`] values so the caller can report why an entry was skipped.

use std::path::PathBuf;

use rust_decimal::Decimal;

/// Bad or insufficient market data.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DataError {
    #[error("price series is empty")]
    EmptySeries,

    #[error("{indicator} period must be > 0, got {period}")]
    InvalidPeriod { indicator: &'static str, period: usize },

    #[error("{indicator} requires at least {need} data points, have {have}")]
    InsufficientHistory {
        indicator: &'static str,
        have: usize,
        need: usize,
    },

    #[error("invalid bar at index {index}: {reason}")]
    InvalidBar { index: usize, reason: String },

    #[error("malformed bar data: {0}")]
    Malformed(String),
}

/// Invalid configuration. Never recovered from.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("RSI oversold level {oversold} must be below overbought level {overbought}")]
    InvalidRsiLevels { oversold: f64, overbought: f64 },

    #[error("{name} must be within 0..=100, got {value}")]
    LevelOutOfRange { name: &'static str, value: f64 },

    #[error("unknown trailing stop strategy '{0}' (available: A, B, C)")]
    UnknownTrailingStrategy(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("failed to read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key,
            reason: reason.into(),
        }
    }
}

/// Failure reported by (or while talking to) the broker.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    #[error("request rejected by broker (code {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("broker request timed out")]
    Timeout,

    #[error("unknown position ticket {0}")]
    UnknownPosition(u64),

    #[error("unexpected broker response: {0}")]
    Protocol(String),
}

impl BrokerError {
    pub fn rejected(code: i64, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }

    /// Whether the failure is about reaching the broker rather than the request itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout)
    }
}

/// Why a proposed entry was refused by the portfolio risk budget.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskRejection {
    pub current_risk_percent: Decimal,
    pub proposed_risk_percent: Decimal,
    pub max_total_risk_percent: Decimal,
    pub reason: String,
}

impl std::fmt::Display for RiskRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Anything that can abort the work of one tick.
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl TickError {
    pub fn is_transient(&self) -> bool {
        match self {
            TickError::Broker(e) => e.is_transient(),
            TickError::Data(_) => false,
        }
    }
}
