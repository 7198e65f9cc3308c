use crate::domain::market::Timeframe;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a candle's data came from. Aggregated candles carry the tag of
/// their last contributing 1-minute bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandleSource {
    Cache,
    Historical,
    Live,
    TradeBuilt,
}

impl fmt::Display for CandleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandleSource::Cache => write!(f, "cache"),
            CandleSource::Historical => write!(f, "historical"),
            CandleSource::Live => write!(f, "live"),
            CandleSource::TradeBuilt => write!(f, "trade"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub instrument: String,
    pub timeframe: Timeframe,
    /// Bucket start, epoch ms UTC. Always an exact multiple of the
    /// timeframe's interval.
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
    pub is_closed: bool,
    pub source: CandleSource,
}

impl Candle {
    /// A candle is persistable only if it actually contains traded volume.
    /// Zero-volume candles can still be rendered but never hit the store.
    pub fn is_valid(&self) -> bool {
        self.volume > 0
    }

    /// End boundary (exclusive) of this candle's bucket
    pub fn end_boundary(&self) -> i64 {
        self.timestamp + self.timeframe.interval_ms()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
    Unknown,
}

impl TradeSide {
    pub fn from_flag(c: char) -> Self {
        match c {
            'B' | 'b' => TradeSide::Buy,
            'A' | 'a' | 'S' | 's' => TradeSide::Sell,
            _ => TradeSide::Unknown,
        }
    }
}

/// A single trade tick from the live feed. Ephemeral: consumed immediately
/// by the session candle builder, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub instrument: String,
    pub timestamp: i64,
    pub price: Decimal,
    pub size: u64,
    pub side: TradeSide,
}

/// Emitted to subscribers as candles close or accumulate.
#[derive(Debug, Clone, PartialEq)]
pub enum CandleEvent {
    /// The bucket ended; this candle will not change again.
    Closed(Candle),
    /// Live-updating partial candle for a still-open bucket.
    Open(Candle),
}

impl CandleEvent {
    pub fn candle(&self) -> &Candle {
        match self {
            CandleEvent::Closed(c) | CandleEvent::Open(c) => c,
        }
    }
}
