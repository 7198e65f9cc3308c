use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const MINUTE_MS: i64 = 60_000;

/// Candle timeframes the engine can serve. Only `OneMin` is ever persisted;
/// everything else is derived on demand by aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    OneMin,
    FiveMin,
    FifteenMin,
    OneHour,
    FourHour,
    OneDay,
}

impl Timeframe {
    /// Returns the duration of this timeframe in minutes
    pub fn to_minutes(&self) -> i64 {
        match self {
            Timeframe::OneMin => 1,
            Timeframe::FiveMin => 5,
            Timeframe::FifteenMin => 15,
            Timeframe::OneHour => 60,
            Timeframe::FourHour => 240,
            Timeframe::OneDay => 1440,
        }
    }

    /// Bucket width in milliseconds
    pub fn interval_ms(&self) -> i64 {
        self.to_minutes() * MINUTE_MS
    }

    /// Returns the bucket start (in ms) of the bucket containing `timestamp_ms`.
    /// Buckets are aligned to epoch, so daily buckets start at midnight UTC.
    pub fn bucket_start(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms - timestamp_ms.rem_euclid(self.interval_ms())
    }

    /// Checks whether a timestamp sits exactly on a bucket boundary
    pub fn is_bucket_start(&self, timestamp_ms: i64) -> bool {
        timestamp_ms.rem_euclid(self.interval_ms()) == 0
    }

    /// Timestamp of the last 1-minute slot inside the bucket starting at
    /// `bucket_start_ms`. If a bar exists at this slot the bucket is
    /// internally complete.
    pub fn last_slot(&self, bucket_start_ms: i64) -> i64 {
        bucket_start_ms + self.interval_ms() - MINUTE_MS
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMin => "1m",
            Timeframe::FiveMin => "5m",
            Timeframe::FifteenMin => "15m",
            Timeframe::OneHour => "1h",
            Timeframe::FourHour => "4h",
            Timeframe::OneDay => "1d",
        }
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "1m" | "1min" => Ok(Timeframe::OneMin),
            "5m" | "5min" => Ok(Timeframe::FiveMin),
            "15m" | "15min" => Ok(Timeframe::FifteenMin),
            "1h" | "60m" => Ok(Timeframe::OneHour),
            "4h" | "240m" => Ok(Timeframe::FourHour),
            "1d" | "1440m" => Ok(Timeframe::OneDay),
            _ => Err(anyhow!(
                "Invalid timeframe: '{}'. Valid options: 1m, 5m, 15m, 1h, 4h, 1d",
                s
            )),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_ms() {
        assert_eq!(Timeframe::OneMin.interval_ms(), 60_000);
        assert_eq!(Timeframe::FiveMin.interval_ms(), 300_000);
        assert_eq!(Timeframe::OneDay.interval_ms(), 86_400_000);
    }

    #[test]
    fn test_bucket_start() {
        let tf = Timeframe::FiveMin;
        // 2024-01-01 00:00:00 UTC = 1704067200000 ms
        let base = 1704067200000i64;

        assert_eq!(tf.bucket_start(base), base);
        assert_eq!(tf.bucket_start(base + 3 * 60 * 1000), base);
        assert_eq!(tf.bucket_start(base + 5 * 60 * 1000), base + 5 * 60 * 1000);
        assert_eq!(tf.bucket_start(base + 7 * 60 * 1000), base + 5 * 60 * 1000);
    }

    #[test]
    fn test_is_bucket_start() {
        let tf = Timeframe::FiveMin;
        let base = 1704067200000i64;

        assert!(tf.is_bucket_start(base));
        assert!(tf.is_bucket_start(base + 5 * 60 * 1000));
        assert!(!tf.is_bucket_start(base + 3 * 60 * 1000));
    }

    #[test]
    fn test_last_slot() {
        let tf = Timeframe::FiveMin;
        let base = 1704067200000i64;
        // Last 1m slot of the [00:00, 00:05) bucket is 00:04
        assert_eq!(tf.last_slot(base), base + 4 * 60 * 1000);
    }

    #[test]
    fn test_from_str() {
        assert_eq!(Timeframe::from_str("1m").unwrap(), Timeframe::OneMin);
        assert_eq!(Timeframe::from_str("5Min").unwrap(), Timeframe::FiveMin);
        assert_eq!(Timeframe::from_str("1h").unwrap(), Timeframe::OneHour);
        assert_eq!(Timeframe::from_str("1d").unwrap(), Timeframe::OneDay);
        assert!(Timeframe::from_str("invalid").is_err());
    }
}
