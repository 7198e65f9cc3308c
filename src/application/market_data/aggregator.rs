//! Pure aggregation of 1-minute bars into higher timeframes.
//!
//! A bucket is marked closed when either later data proves the bucket ended,
//! or the bucket's last possible 1-minute slot is present (the bucket is
//! internally complete even if the feed has gone quiet at a session
//! boundary). This keeps candles correct across trading halts.

use crate::domain::market::{Candle, Timeframe};
use std::collections::BTreeMap;

/// Aggregate a run of 1-minute bars into `timeframe` candles covering
/// [start, end]. Input need not be sorted; output is sorted by bucket start
/// and filtered to the requested range after aggregation.
pub fn aggregate(
    instrument: &str,
    timeframe: Timeframe,
    start: i64,
    end: i64,
    one_minute_bars: &[Candle],
) -> Vec<Candle> {
    if timeframe == Timeframe::OneMin {
        let mut bars: Vec<Candle> = one_minute_bars
            .iter()
            .filter(|c| c.instrument == instrument && c.timestamp >= start && c.timestamp <= end)
            .cloned()
            .collect();
        bars.sort_by_key(|c| c.timestamp);
        return bars;
    }

    let mut sorted: Vec<&Candle> = one_minute_bars
        .iter()
        .filter(|c| c.instrument == instrument)
        .collect();
    sorted.sort_by_key(|c| c.timestamp);

    let max_timestamp = match sorted.last() {
        Some(c) => c.timestamp,
        None => return Vec::new(),
    };

    let interval = timeframe.interval_ms();
    let mut buckets: BTreeMap<i64, Candle> = BTreeMap::new();
    let mut has_last_slot: BTreeMap<i64, bool> = BTreeMap::new();

    for bar in sorted {
        let bucket_start = timeframe.bucket_start(bar.timestamp);
        if bar.timestamp == timeframe.last_slot(bucket_start) {
            has_last_slot.insert(bucket_start, true);
        }

        buckets
            .entry(bucket_start)
            .and_modify(|agg| {
                if bar.high > agg.high {
                    agg.high = bar.high;
                }
                if bar.low < agg.low {
                    agg.low = bar.low;
                }
                agg.close = bar.close;
                agg.volume += bar.volume;
                agg.source = bar.source;
            })
            .or_insert_with(|| Candle {
                instrument: instrument.to_string(),
                timeframe,
                timestamp: bucket_start,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.volume,
                is_closed: false,
                source: bar.source,
            });
    }

    buckets
        .into_iter()
        .filter(|(bucket_start, _)| *bucket_start >= start && *bucket_start <= end)
        .map(|(bucket_start, mut candle)| {
            let later_data = max_timestamp >= bucket_start + interval;
            let complete = has_last_slot.get(&bucket_start).copied().unwrap_or(false);
            candle.is_closed = later_data || complete;
            candle
        })
        .collect()
}
