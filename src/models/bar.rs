//! Price bars and chart timeframes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DataError;

/// One OHLC bar. Immutable once formed; sequences are ordered oldest to newest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    /// Bar open time
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Tick volume; zero when the feed does not provide it
    #[serde(default)]
    pub volume: f64,
}

impl PriceBar {
    pub fn new(timestamp: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume: 0.0,
        }
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = volume;
        self
    }

    /// Check OHLC consistency of a single bar.
    pub fn check(&self) -> Result<(), String> {
        let fields = [self.open, self.high, self.low, self.close];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err("non-finite price".to_string());
        }
        if fields.iter().any(|v| *v < 0.0) {
            return Err("negative price".to_string());
        }
        if self.high < self.low {
            return Err(format!("high {} < low {}", self.high, self.low));
        }
        if self.high < self.open.max(self.close) {
            return Err(format!("high {} below open/close", self.high));
        }
        if self.low > self.open.min(self.close) {
            return Err(format!("low {} above open/close", self.low));
        }
        Ok(())
    }
}

/// Validate a bar sequence: non-empty, consistent OHLC, strictly increasing time.
pub fn validate_bars(bars: &[PriceBar]) -> Result<(), DataError> {
    if bars.is_empty() {
        return Err(DataError::EmptySeries);
    }

    for (index, bar) in bars.iter().enumerate() {
        bar.check()
            .map_err(|reason| DataError::InvalidBar { index, reason })?;

        if index > 0 && bar.timestamp <= bars[index - 1].timestamp {
            return Err(DataError::InvalidBar {
                index,
                reason: "timestamps out of order".to_string(),
            });
        }
    }

    Ok(())
}

/// Extract close prices.
pub fn closes(bars: &[PriceBar]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

/// Chart timeframe of the polled bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
        }
    }

    /// Bar length in seconds.
    pub fn seconds(&self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "M1" => Ok(Timeframe::M1),
            "M5" => Ok(Timeframe::M5),
            "M15" => Ok(Timeframe::M15),
            "M30" => Ok(Timeframe::M30),
            "H1" => Ok(Timeframe::H1),
            "H4" => Ok(Timeframe::H4),
            "D1" => Ok(Timeframe::D1),
            other => Err(format!("unknown timeframe '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(minute: u32, open: f64, high: f64, low: f64, close: f64) -> PriceBar {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap();
        PriceBar::new(ts, open, high, low, close)
    }

    #[test]
    fn test_validate_accepts_consistent_bars() {
        let bars = vec![
            bar(0, 1.1000, 1.1010, 1.0990, 1.1005),
            bar(1, 1.1005, 1.1020, 1.1000, 1.1015),
        ];
        assert!(validate_bars(&bars).is_ok());
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert_eq!(validate_bars(&[]), Err(DataError::EmptySeries));
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let bars = vec![bar(0, 1.1, 1.0, 1.2, 1.1)];
        assert!(matches!(
            validate_bars(&bars),
            Err(DataError::InvalidBar { index: 0, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_unordered_timestamps() {
        let bars = vec![
            bar(5, 1.1, 1.1, 1.1, 1.1),
            bar(4, 1.1, 1.1, 1.1, 1.1),
        ];
        let err = validate_bars(&bars).unwrap_err();
        assert!(matches!(err, DataError::InvalidBar { index: 1, .. }));
    }

    #[test]
    fn test_timeframe_parse() {
        assert_eq!("h1".parse::<Timeframe>().unwrap(), Timeframe::H1);
        assert_eq!(Timeframe::M15.seconds(), 900);
        assert!("W1".parse::<Timeframe>().is_err());
    }
}
