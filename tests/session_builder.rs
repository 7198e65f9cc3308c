//! Session candle building across a mid-stream timeframe change: adding a
//! timeframe must not drop or duplicate any tick relative to a session that
//! tracked the timeframe from the start.

use anyhow::Result;
use async_trait::async_trait;
use barstream::application::market_data::reconciler::Reconciler;
use barstream::application::market_data::session::Session;
use barstream::domain::market::{Candle, CandleEvent, Timeframe, Trade, TradeSide};
use barstream::domain::ports::{HistoricalBarSource, LiveBarSource};
use barstream::domain::repositories::CandleStore;
use barstream::infrastructure::persistence::database::Database;
use barstream::infrastructure::persistence::repositories::SqliteCandleStore;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use tokio::sync::mpsc;

const BASE: i64 = 1704067200000; // 2024-01-01 00:00:00 UTC
const MIN: i64 = 60_000;

struct EmptyHistorical;

#[async_trait]
impl HistoricalBarSource for EmptyHistorical {
    async fn fetch_range(&self, _: &str, _: i64, _: i64) -> Result<Vec<Candle>> {
        Ok(vec![])
    }
}

struct EmptyLive;

#[async_trait]
impl LiveBarSource for EmptyLive {
    async fn backfill_bars(&self, _: &str, _: i64) -> Result<Vec<Candle>> {
        Ok(vec![])
    }
}

async fn new_session() -> (Session, mpsc::Receiver<CandleEvent>) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    let db = Database { pool };
    db.init().await.expect("schema init");
    let store = Arc::new(SqliteCandleStore::new(db.pool));

    // Upstream sources are empty; the only backfill data is what the
    // session itself persisted to the store.
    let reconciler = Reconciler::new(
        store.clone(),
        Arc::new(EmptyHistorical),
        Arc::new(EmptyLive),
        0,
        60 * MIN,
    );
    let (tx, rx) = mpsc::channel(1024);
    (Session::new(store, reconciler, tx), rx)
}

fn trade(offset_ms: i64, price: Decimal, size: u64) -> Trade {
    Trade {
        instrument: "ESM5".to_string(),
        timestamp: BASE + offset_ms,
        price,
        size,
        side: TradeSide::Buy,
    }
}

/// Trades spanning minutes 0..=4 plus one at minute 5 to close the bucket
fn trade_stream() -> Vec<Trade> {
    vec![
        trade(1_000, dec!(100), 2),
        trade(20_000, dec!(102), 1),
        trade(61_000, dec!(99), 3),
        trade(95_000, dec!(101), 1),
        trade(121_000, dec!(103), 2),
        trade(185_000, dec!(98), 1),
        trade(250_000, dec!(100), 4),
        // Minute 5: closes both the minute-4 candle and the 5m bucket
        trade(301_000, dec!(105), 1),
    ]
}

fn last_closed_five_min(events: Vec<CandleEvent>) -> Candle {
    events
        .into_iter()
        .filter_map(|ev| match ev {
            CandleEvent::Closed(c) if c.timeframe == Timeframe::FiveMin => Some(c),
            _ => None,
        })
        .next_back()
        .expect("a closed 5m candle")
}

fn drain(rx: &mut mpsc::Receiver<CandleEvent>) -> Vec<CandleEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

#[tokio::test]
async fn test_add_timeframe_mid_stream_equals_tracking_from_start() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let trades = trade_stream();

    // Control: 5m tracked from the beginning
    let (mut control, mut control_rx) = new_session().await;
    control
        .add_timeframe_at("ESM5", Timeframe::OneMin, BASE)
        .await
        .unwrap();
    control
        .add_timeframe_at("ESM5", Timeframe::FiveMin, BASE)
        .await
        .unwrap();
    for t in &trades {
        control.on_trade(t.clone()).await;
    }
    let control_candle = last_closed_five_min(drain(&mut control_rx));

    // Candidate: 5m added mid-stream, during minute 2. The backfill reads
    // the 1m candles the session already closed and folds in the open
    // partial, then the remaining trades flow through the normal path.
    let (mut candidate, mut candidate_rx) = new_session().await;
    candidate
        .add_timeframe_at("ESM5", Timeframe::OneMin, BASE)
        .await
        .unwrap();
    for t in &trades[..5] {
        candidate.on_trade(t.clone()).await;
    }
    candidate
        .add_timeframe_at("ESM5", Timeframe::FiveMin, BASE + 125_000)
        .await
        .unwrap();
    for t in &trades[5..] {
        candidate.on_trade(t.clone()).await;
    }
    let candidate_candle = last_closed_five_min(drain(&mut candidate_rx));

    // No dropped, no duplicated ticks: identical final candle state
    assert_eq!(candidate_candle.timestamp, control_candle.timestamp);
    assert_eq!(candidate_candle.open, control_candle.open);
    assert_eq!(candidate_candle.high, control_candle.high);
    assert_eq!(candidate_candle.low, control_candle.low);
    assert_eq!(candidate_candle.close, control_candle.close);
    assert_eq!(candidate_candle.volume, control_candle.volume);

    // Sanity: the aggregate matches the raw trade stream
    assert_eq!(control_candle.open, dec!(100));
    assert_eq!(control_candle.high, dec!(103));
    assert_eq!(control_candle.low, dec!(98));
    assert_eq!(control_candle.close, dec!(100));
    assert_eq!(control_candle.volume, 14);
}

/// Live source that stays in flight long enough for trades to arrive
/// while the backfill awaits it.
struct SlowEmptyLive;

#[async_trait]
impl LiveBarSource for SlowEmptyLive {
    async fn backfill_bars(&self, _: &str, _: i64) -> Result<Vec<Candle>> {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        Ok(vec![])
    }
}

#[tokio::test]
async fn test_trades_arriving_during_backfill_are_queued_then_replayed() {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    let db = Database { pool };
    db.init().await.expect("schema init");
    let store = Arc::new(SqliteCandleStore::new(db.pool));

    // Cache holds closed 1m candles for minutes 0 and 1
    let cached: Vec<Candle> = (0..2)
        .map(|m| Candle {
            instrument: "ESM5".to_string(),
            timeframe: Timeframe::OneMin,
            timestamp: BASE + m * MIN,
            open: dec!(100),
            high: dec!(101),
            low: dec!(99),
            close: dec!(100),
            volume: 1,
            is_closed: true,
            source: barstream::domain::market::CandleSource::Historical,
        })
        .collect();
    store.put_batch(&cached).await.unwrap();

    let reconciler = Reconciler::new(
        store.clone(),
        Arc::new(EmptyHistorical),
        Arc::new(SlowEmptyLive),
        0,
        60 * MIN,
    );
    let (tx, mut rx) = mpsc::channel(1024);
    let mut session = Session::new(store, reconciler, tx);

    // Two trades are already waiting on the live feed when the timeframe
    // change starts; the slow backfill forces them through the queue.
    let (trade_tx, mut trade_rx) = mpsc::channel(16);
    trade_tx.send(trade(126_000, dec!(104), 2)).await.unwrap();
    trade_tx.send(trade(127_000, dec!(97), 1)).await.unwrap();

    session
        .add_timeframe_live_at("ESM5", Timeframe::FiveMin, BASE + 130_000, &mut trade_rx)
        .await
        .unwrap();

    let events = drain(&mut rx);
    let five_min: Vec<&Candle> = events
        .iter()
        .filter_map(|ev| match ev {
            CandleEvent::Open(c) if c.timeframe == Timeframe::FiveMin => Some(c),
            _ => None,
        })
        .collect();
    assert_eq!(five_min.len(), 3);

    // First event is the seed built purely from the backfilled history:
    // the queued trades were held back, not folded in early.
    assert_eq!(five_min[0].volume, 2);
    assert_eq!(five_min[0].high, dec!(101));

    // Replay then applies both queued trades, in arrival order, exactly once
    assert_eq!(five_min[1].volume, 4);
    assert_eq!(five_min[1].high, dec!(104));
    assert_eq!(five_min[2].volume, 5);
    assert_eq!(five_min[2].low, dec!(97));
    assert_eq!(five_min[2].close, dec!(97));
}

#[tokio::test]
async fn test_one_minute_candles_close_in_order() {
    let trades = trade_stream();

    let (mut session, mut rx) = new_session().await;
    session
        .add_timeframe_at("ESM5", Timeframe::OneMin, BASE)
        .await
        .unwrap();

    for t in &trades {
        session.on_trade(t.clone()).await;
    }
    let events = drain(&mut rx);

    // Minutes 0..4 each closed exactly once, in order
    let closed: Vec<i64> = events
        .iter()
        .filter_map(|ev| match ev {
            CandleEvent::Closed(c) if c.timeframe == Timeframe::OneMin => Some(c.timestamp),
            _ => None,
        })
        .collect();
    assert_eq!(
        closed,
        vec![
            BASE,
            BASE + MIN,
            BASE + 2 * MIN,
            BASE + 3 * MIN,
            BASE + 4 * MIN
        ]
    );
}
