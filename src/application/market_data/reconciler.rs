//! Assembles a complete, gap-free 1-minute series for a requested range by
//! merging the cache, the historical endpoint and a transient live backfill.
//!
//! Failure policy: edge fetches degrade to whatever data is already in hand
//! (logged, not fatal). Only the initial full fetch with an empty cache is
//! allowed to fail the request.

use crate::domain::market::timeframe::MINUTE_MS;
use crate::domain::market::{Candle, Timeframe};
use crate::domain::ports::{HistoricalBarSource, LiveBarSource};
use crate::domain::repositories::CandleStore;
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound of a reconcile request. `Current` means "up to now" and
/// enables the live backfill of the final segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeEnd {
    Current,
    At(i64),
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn CandleStore>,
    historical: Arc<dyn HistoricalBarSource>,
    live: Arc<dyn LiveBarSource>,
    /// Leading cache gaps up to this size are accepted (pre-market quiet)
    early_cushion_ms: i64,
    /// Trailing gap tolerance when the end is `Current`
    late_cushion_ms: i64,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn CandleStore>,
        historical: Arc<dyn HistoricalBarSource>,
        live: Arc<dyn LiveBarSource>,
        early_cushion_ms: i64,
        late_cushion_ms: i64,
    ) -> Self {
        Self {
            store,
            historical,
            live,
            early_cushion_ms,
            late_cushion_ms,
        }
    }

    /// Produce the sorted 1-minute series for [start, end]. New data fetched
    /// along the way is written back to the cache when `save_cache` is set.
    pub async fn reconcile(
        &self,
        instrument: &str,
        start: i64,
        end: RangeEnd,
        use_cache: bool,
        save_cache: bool,
    ) -> Result<Vec<Candle>> {
        self.reconcile_at(
            instrument,
            start,
            end,
            use_cache,
            save_cache,
            Utc::now().timestamp_millis(),
        )
        .await
    }

    /// Same as `reconcile` but with an explicit "now", so cushion behavior
    /// is deterministic under test.
    pub async fn reconcile_at(
        &self,
        instrument: &str,
        start: i64,
        end: RangeEnd,
        use_cache: bool,
        save_cache: bool,
        now_ms: i64,
    ) -> Result<Vec<Candle>> {
        let effective_end = match end {
            RangeEnd::Current => now_ms,
            RangeEnd::At(ts) => ts,
        };

        let mut merged: BTreeMap<i64, Candle> = BTreeMap::new();

        // 1. Cache read
        if use_cache {
            let cached = self
                .store
                .get_range(instrument, start, effective_end)
                .await
                .context("candle cache read failed")?;
            debug!(instrument, cached = cached.len(), "cache read");
            for c in cached {
                merged.insert(c.timestamp, c);
            }
        }

        // 2. Empty cache: the full historical fetch is the one fetch that
        // may fail the request, since without it we have nothing at all.
        if merged.is_empty() {
            let bars = self
                .historical
                .fetch_range(instrument, start, effective_end)
                .await
                .with_context(|| {
                    format!("no cached data and historical fetch failed for {instrument}")
                })?;
            info!(instrument, bars = bars.len(), "full historical fetch");
            self.persist(save_cache, &bars).await;
            for c in bars {
                merged.insert(c.timestamp, c);
            }
        } else {
            // 3. Leading gap beyond the early cushion
            let earliest = *merged.keys().next().expect("merged not empty");
            if earliest - start > self.early_cushion_ms {
                match self
                    .historical
                    .fetch_range(instrument, start, earliest - MINUTE_MS)
                    .await
                {
                    Ok(bars) => {
                        debug!(instrument, bars = bars.len(), "leading gap fetch");
                        self.persist(save_cache, &bars).await;
                        for c in bars {
                            merged.insert(c.timestamp, c);
                        }
                    }
                    Err(e) => {
                        warn!("leading gap fetch failed for {instrument}, skipping: {e:#}");
                    }
                }
            }

            // 4. Trailing gap. With an explicit end we always try; with
            // `Current` only past the late cushion.
            let latest = *merged.keys().next_back().expect("merged not empty");
            let trailing_gap = effective_end - latest;
            let should_fetch = match end {
                RangeEnd::At(_) => trailing_gap > 0,
                RangeEnd::Current => trailing_gap > self.late_cushion_ms,
            };
            if should_fetch {
                match self
                    .historical
                    .fetch_range(instrument, latest + MINUTE_MS, effective_end)
                    .await
                {
                    Ok(bars) => {
                        debug!(instrument, bars = bars.len(), "trailing gap fetch");
                        self.persist(save_cache, &bars).await;
                        for c in bars {
                            merged.insert(c.timestamp, c);
                        }
                    }
                    Err(e) => {
                        warn!("trailing gap fetch failed for {instrument}, skipping: {e:#}");
                    }
                }
            }
        }

        // 5. The historical endpoint trails real time; when the caller wants
        // "current" data (or an explicit end we still haven't reached), fill
        // the final segment from a transient live connection. The late
        // cushion only gates the historical trailing fetch above; a tail
        // short of the current minute always gets the live attempt.
        let latest = merged.keys().next_back().copied();
        let needs_live = match end {
            RangeEnd::Current => {
                latest.is_none_or(|ts| ts < Timeframe::OneMin.bucket_start(now_ms))
            }
            RangeEnd::At(ts) => latest.is_some_and(|latest| latest < ts),
        };
        if needs_live {
            let from = latest
                .map(|ts| ts + MINUTE_MS)
                .unwrap_or_else(|| Timeframe::OneMin.bucket_start(start));
            match self.live.backfill_bars(instrument, from).await {
                Ok(bars) => {
                    info!(instrument, bars = bars.len(), "live backfill");
                    self.persist(save_cache, &bars).await;
                    for c in bars {
                        if c.timestamp <= effective_end {
                            merged.insert(c.timestamp, c);
                        }
                    }
                }
                Err(e) => {
                    warn!("live backfill failed for {instrument}, skipping: {e:#}");
                }
            }
        }

        // 6. BTreeMap iteration is already sorted and de-duplicated by key
        Ok(merged.into_values().collect())
    }

    async fn persist(&self, save_cache: bool, bars: &[Candle]) {
        if !save_cache || bars.is_empty() {
            return;
        }
        if let Err(e) = self.store.put_batch(bars).await {
            // The series is still servable from memory; degrade rather than
            // failing the request over a cache write.
            warn!("candle cache write failed: {e:#}");
        }
    }
}
