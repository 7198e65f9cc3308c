//! Port interfaces for the upstream data provider.
//!
//! The reconciler is written against these traits so its merge logic can be
//! exercised with in-memory fakes; the real implementations live in
//! `infrastructure::feed`.

use crate::domain::market::Candle;
use anyhow::Result;
use async_trait::async_trait;

/// Request/response source of historical 1-minute bars
#[async_trait]
pub trait HistoricalBarSource: Send + Sync {
    /// Fetch 1-minute bars for [start, end] inclusive. Implementations clamp
    /// `end` to the provider-reported boundary and retry once when the
    /// requested end exceeds available data.
    async fn fetch_range(&self, instrument: &str, start: i64, end: i64) -> Result<Vec<Candle>>;
}

/// Streaming source used transiently to backfill the final segment of a
/// range up to "now". Bounded by an inactivity timeout rather than an
/// explicit deadline.
#[async_trait]
pub trait LiveBarSource: Send + Sync {
    /// Open a connection in minute-bar mode, collect bars from `start`
    /// until the feed goes quiet, then close and return what was collected.
    async fn backfill_bars(&self, instrument: &str, start: i64) -> Result<Vec<Candle>>;
}
