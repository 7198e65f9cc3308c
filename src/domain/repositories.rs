//! Repository traits for the durable 1-minute candle cache.
//!
//! Only 1-minute rows are ever stored; higher timeframes are derived on
//! demand by the aggregator. Implementations must serialize writers
//! internally so concurrent sessions can call `put_batch` without
//! application-level locking.

use crate::domain::market::Candle;
use anyhow::Result;
use async_trait::async_trait;

/// Scope for an administrative purge. All fields `None` wipes the table.
#[derive(Debug, Clone, Default)]
pub struct PurgeFilter {
    pub instrument: Option<String>,
    /// Inclusive lower bound, epoch ms
    pub start: Option<i64>,
    /// Inclusive upper bound, epoch ms
    pub end: Option<i64>,
}

/// Durable key-value cache of 1-minute bars keyed by (instrument, timestamp)
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Fetch 1-minute bars in [start, end] inclusive, ascending by timestamp
    async fn get_range(&self, instrument: &str, start: i64, end: i64) -> Result<Vec<Candle>>;

    /// Upsert a batch of candles. Invalid candles (zero volume) are filtered
    /// out before writing. The write is transactional: all-or-nothing.
    /// Returns the number of rows written.
    async fn put_batch(&self, candles: &[Candle]) -> Result<u64>;

    /// Delete cached rows matching the filter. Returns rows removed.
    async fn purge(&self, filter: &PurgeFilter) -> Result<u64>;
}
