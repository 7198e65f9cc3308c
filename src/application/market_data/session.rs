//! Per-subscriber session state: turns the live trade stream into
//! closed/open candles for every timeframe the subscriber currently wants.
//!
//! One session per connection; handlers run to completion in arrival order,
//! so no internal locking is needed. The only reordering is the explicit
//! queue-and-replay protocol around timeframe changes, which guarantees no
//! tick is dropped or processed twice while a backfill is in flight.

use crate::application::market_data::aggregator::aggregate;
use crate::application::market_data::reconciler::{RangeEnd, Reconciler};
use crate::domain::market::timeframe::MINUTE_MS;
use crate::domain::market::{Candle, CandleEvent, CandleSource, Timeframe, Trade};
use crate::domain::repositories::CandleStore;
use crate::infrastructure::feed::live::LiveFeedHandle;
use anyhow::Result;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct Session {
    /// instrument -> timeframes the subscriber currently wants
    subscriptions: HashMap<String, HashSet<Timeframe>>,
    /// instrument -> open (not yet closed) 1-minute candle
    open_one_minute: HashMap<String, Candle>,
    /// instrument -> timeframe -> open candle, excluding 1m
    open_candles: HashMap<String, HashMap<Timeframe, Candle>>,
    /// Replay guard: trades older than this boundary are echoes of data the
    /// backfill already covered
    next_minute_boundary: HashMap<String, i64>,
    trade_queue: VecDeque<Trade>,
    is_processing_timeframe_change: bool,
    store: Arc<dyn CandleStore>,
    reconciler: Reconciler,
    events: mpsc::Sender<CandleEvent>,
    live_connection: Option<LiveFeedHandle>,
}

impl Session {
    pub fn new(
        store: Arc<dyn CandleStore>,
        reconciler: Reconciler,
        events: mpsc::Sender<CandleEvent>,
    ) -> Self {
        Self {
            subscriptions: HashMap::new(),
            open_one_minute: HashMap::new(),
            open_candles: HashMap::new(),
            next_minute_boundary: HashMap::new(),
            trade_queue: VecDeque::new(),
            is_processing_timeframe_change: false,
            store,
            reconciler,
            events,
            live_connection: None,
        }
    }

    /// Hand the session ownership of its long-lived feed connection; it is
    /// closed on disconnect.
    pub fn attach_live_connection(&mut self, handle: LiveFeedHandle) {
        if let Some(old) = self.live_connection.replace(handle) {
            old.close();
        }
    }

    pub fn subscribed_timeframes(&self, instrument: &str) -> Vec<Timeframe> {
        self.subscriptions
            .get(instrument)
            .map(|set| {
                let mut tfs: Vec<Timeframe> = set.iter().copied().collect();
                tfs.sort_by_key(|tf| tf.interval_ms());
                tfs
            })
            .unwrap_or_default()
    }

    /// Tear down all session-owned resources. Cache rows are unaffected.
    pub fn disconnect(&mut self) {
        if let Some(handle) = self.live_connection.take() {
            handle.close();
        }
        self.subscriptions.clear();
        self.open_one_minute.clear();
        self.open_candles.clear();
        self.next_minute_boundary.clear();
        self.trade_queue.clear();
        info!("session disconnected, live state discarded");
    }

    /// Entry point for every trade from the live feed
    pub async fn on_trade(&mut self, trade: Trade) {
        if self.is_processing_timeframe_change {
            self.trade_queue.push_back(trade);
            return;
        }
        self.process_trade(trade).await;
    }

    async fn process_trade(&mut self, trade: Trade) {
        let Some(timeframes) = self.subscriptions.get(&trade.instrument).cloned() else {
            return;
        };

        // Replay guard: after a fresh subscription the upstream may resend
        // trades the backfill already covered.
        if let Some(&boundary) = self.next_minute_boundary.get(&trade.instrument)
            && trade.timestamp < boundary
        {
            debug!(
                instrument = trade.instrument,
                ts = trade.timestamp,
                boundary,
                "dropping replayed trade"
            );
            return;
        }

        self.apply_to_one_minute(&trade, timeframes.contains(&Timeframe::OneMin))
            .await;

        for tf in timeframes {
            if tf == Timeframe::OneMin {
                continue;
            }
            self.apply_to_timeframe(&trade, tf).await;
        }
    }

    async fn apply_to_one_minute(&mut self, trade: &Trade, emit: bool) {
        let crossed_boundary = self
            .open_one_minute
            .get(&trade.instrument)
            .is_some_and(|open| trade.timestamp >= open.end_boundary());

        if crossed_boundary {
            let mut closed = self
                .open_one_minute
                .remove(&trade.instrument)
                .expect("boundary check saw an open candle");
            closed.is_closed = true;
            // Closed 1m candles are the durable record; higher timeframes
            // are re-derived from them on demand.
            if let Err(e) = self.store.put_batch(std::slice::from_ref(&closed)).await {
                warn!("failed to persist closed 1m candle: {e:#}");
            }
            self.next_minute_boundary
                .insert(trade.instrument.clone(), closed.end_boundary());
            if emit {
                let _ = self.events.send(CandleEvent::Closed(closed)).await;
            }
            self.open_one_minute
                .insert(trade.instrument.clone(), seed_candle(trade, Timeframe::OneMin));
        } else if let Some(open) = self.open_one_minute.get_mut(&trade.instrument) {
            fold_trade(open, trade);
        } else {
            self.open_one_minute
                .insert(trade.instrument.clone(), seed_candle(trade, Timeframe::OneMin));
        }
    }

    async fn apply_to_timeframe(&mut self, trade: &Trade, tf: Timeframe) {
        let per_instrument = self
            .open_candles
            .entry(trade.instrument.clone())
            .or_default();

        let crossed_boundary = per_instrument
            .get(&tf)
            .is_some_and(|open| trade.timestamp >= open.end_boundary());

        if crossed_boundary {
            let mut closed = per_instrument
                .remove(&tf)
                .expect("boundary check saw an open candle");
            closed.is_closed = true;
            let seeded = seed_candle(trade, tf);
            per_instrument.insert(tf, seeded.clone());
            let _ = self.events.send(CandleEvent::Closed(closed)).await;
            let _ = self.events.send(CandleEvent::Open(seeded)).await;
        } else if let Some(open) = per_instrument.get_mut(&tf) {
            fold_trade(open, trade);
            let snapshot = open.clone();
            let _ = self.events.send(CandleEvent::Open(snapshot)).await;
        } else {
            let seeded = seed_candle(trade, tf);
            per_instrument.insert(tf, seeded.clone());
            let _ = self.events.send(CandleEvent::Open(seeded)).await;
        }
    }

    /// Add a timeframe before the live trade stream is flowing (or when the
    /// caller drives trades into `on_trade` itself between awaits).
    pub async fn add_timeframe(&mut self, instrument: &str, tf: Timeframe) -> Result<()> {
        self.add_timeframe_at(instrument, tf, Utc::now().timestamp_millis())
            .await
    }

    pub async fn add_timeframe_at(
        &mut self,
        instrument: &str,
        tf: Timeframe,
        now_ms: i64,
    ) -> Result<()> {
        // Closed, empty feed: the backfill runs with nothing to queue.
        let (tx, mut idle) = mpsc::channel(1);
        drop(tx);
        self.add_timeframe_live_at(instrument, tf, now_ms, &mut idle)
            .await
    }

    /// Add a timeframe while the live trade stream keeps delivering on
    /// `trades`. Ticks arriving during the backfill are queued and replayed
    /// in arrival order after the open candle is seeded, so the change
    /// neither drops nor duplicates ticks.
    pub async fn add_timeframe_live(
        &mut self,
        instrument: &str,
        tf: Timeframe,
        trades: &mut mpsc::Receiver<Trade>,
    ) -> Result<()> {
        self.add_timeframe_live_at(instrument, tf, Utc::now().timestamp_millis(), trades)
            .await
    }

    pub async fn add_timeframe_live_at(
        &mut self,
        instrument: &str,
        tf: Timeframe,
        now_ms: i64,
        trades: &mut mpsc::Receiver<Trade>,
    ) -> Result<()> {
        if self
            .subscriptions
            .get(instrument)
            .is_some_and(|set| set.contains(&tf))
        {
            return Ok(());
        }

        self.is_processing_timeframe_change = true;
        let result = self.backfill_timeframe(instrument, tf, now_ms, trades).await;
        self.is_processing_timeframe_change = false;

        // Replay everything that arrived while the backfill ran, even if the
        // backfill itself failed: the subscription degrades to live-only.
        if let Err(ref e) = result {
            warn!("timeframe backfill failed for {instrument}/{tf}: {e:#}");
        }
        self.drain_trade_queue().await;
        result
    }

    async fn backfill_timeframe(
        &mut self,
        instrument: &str,
        tf: Timeframe,
        now_ms: i64,
        trades: &mut mpsc::Receiver<Trade>,
    ) -> Result<()> {
        self.subscriptions
            .entry(instrument.to_string())
            .or_default()
            .insert(tf);

        if tf == Timeframe::OneMin {
            if !self.next_minute_boundary.contains_key(instrument) {
                self.next_minute_boundary.insert(
                    instrument.to_string(),
                    Timeframe::OneMin.bucket_start(now_ms),
                );
            }
            return Ok(());
        }

        // Rebuild the open candle for the current bucket from history.
        // Trades delivered while the reconcile is in flight land in the
        // queue, not in the candle state.
        let bucket_start = tf.bucket_start(now_ms);
        let reconciler = self.reconciler.clone();
        let target = instrument.to_string();
        let backfill = async move {
            reconciler
                .reconcile_at(&target, bucket_start, RangeEnd::Current, true, true, now_ms)
                .await
        };
        tokio::pin!(backfill);
        let bars = loop {
            tokio::select! {
                result = &mut backfill => break result?,
                Some(trade) = trades.recv() => self.trade_queue.push_back(trade),
            }
        };

        let mut open = aggregate(instrument, tf, bucket_start, now_ms, &bars)
            .into_iter()
            .find(|c| c.timestamp == bucket_start);

        // The still-open 1-minute candle is not in the cache; fold its
        // partial contribution in when it falls inside the new window.
        if let Some(partial) = self.open_one_minute.get(instrument)
            && partial.timestamp >= bucket_start
        {
            match open.as_mut() {
                Some(candle) => fold_candle(candle, partial),
                None => {
                    let mut seeded = partial.clone();
                    seeded.timeframe = tf;
                    seeded.timestamp = bucket_start;
                    seeded.is_closed = false;
                    open = Some(seeded);
                }
            }
        }

        if let Some(mut candle) = open {
            candle.is_closed = false;
            candle.source = CandleSource::TradeBuilt;
            debug!(instrument, %tf, "seeded open candle from backfill");
            let _ = self.events.send(CandleEvent::Open(candle.clone())).await;
            self.open_candles
                .entry(instrument.to_string())
                .or_default()
                .insert(tf, candle);
        }

        // First subscription for this instrument: live trades older than
        // the backfilled history are replays.
        if !self.next_minute_boundary.contains_key(instrument) {
            let boundary = bars
                .last()
                .map(|c| c.timestamp + MINUTE_MS)
                .unwrap_or_else(|| Timeframe::OneMin.bucket_start(now_ms));
            self.next_minute_boundary
                .insert(instrument.to_string(), boundary);
        }

        Ok(())
    }

    async fn drain_trade_queue(&mut self) {
        while let Some(trade) = self.trade_queue.pop_front() {
            self.process_trade(trade).await;
        }
    }

    /// Stop tracking a timeframe. No backfill or queueing involved; the
    /// open-candle state is simply discarded.
    pub fn remove_timeframe(&mut self, instrument: &str, tf: Timeframe) {
        let mut drop_instrument = false;
        if let Some(set) = self.subscriptions.get_mut(instrument) {
            set.remove(&tf);
            drop_instrument = set.is_empty();
        }
        if let Some(per_instrument) = self.open_candles.get_mut(instrument) {
            per_instrument.remove(&tf);
        }
        if drop_instrument {
            self.subscriptions.remove(instrument);
            self.open_candles.remove(instrument);
            self.open_one_minute.remove(instrument);
            self.next_minute_boundary.remove(instrument);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(handle) = self.live_connection.take() {
            handle.close();
        }
    }
}

fn seed_candle(trade: &Trade, tf: Timeframe) -> Candle {
    Candle {
        instrument: trade.instrument.clone(),
        timeframe: tf,
        timestamp: tf.bucket_start(trade.timestamp),
        open: trade.price,
        high: trade.price,
        low: trade.price,
        close: trade.price,
        volume: trade.size,
        is_closed: false,
        source: CandleSource::TradeBuilt,
    }
}

fn fold_trade(open: &mut Candle, trade: &Trade) {
    if trade.price > open.high {
        open.high = trade.price;
    }
    if trade.price < open.low {
        open.low = trade.price;
    }
    open.close = trade.price;
    open.volume += trade.size;
}

/// Fold one candle's contribution into another (partial 1m into a larger
/// open bucket). The target keeps its own open.
fn fold_candle(target: &mut Candle, partial: &Candle) {
    if partial.high > target.high {
        target.high = partial.high;
    }
    if partial.low < target.low {
        target.low = partial.low;
    }
    target.close = partial.close;
    target.volume += partial.volume;
}
