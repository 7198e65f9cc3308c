//! Facade wiring the cache, upstream clients and reconciler together, and
//! exposing the downstream surface: candle-series requests, live
//! subscriptions and administrative cache purges.

use crate::application::market_data::aggregator::aggregate;
use crate::application::market_data::reconciler::{RangeEnd, Reconciler};
use crate::application::market_data::session::Session;
use crate::config::Config;
use crate::domain::errors::RequestError;
use crate::domain::market::{Candle, CandleEvent, Timeframe, Trade};
use crate::domain::repositories::{CandleStore, PurgeFilter};
use crate::infrastructure::feed::historical::HistoricalFeedClient;
use crate::infrastructure::feed::live::{LiveFeedClient, LiveFeedConfig, LiveFeedHandle};
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::SqliteCandleStore;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

pub struct MarketDataEngine {
    store: Arc<dyn CandleStore>,
    reconciler: Reconciler,
    live_client: Arc<LiveFeedClient>,
}

impl MarketDataEngine {
    pub async fn from_config(config: &Config) -> Result<Self> {
        let database = Database::new(&config.database_url).await?;
        let store: Arc<dyn CandleStore> = Arc::new(SqliteCandleStore::new(database.pool.clone()));

        let historical = Arc::new(HistoricalFeedClient::new(
            config.historical_base_url.clone(),
            config.api_key.clone(),
            config.dataset.clone(),
        ));

        let live_client = Arc::new(LiveFeedClient::new(LiveFeedConfig {
            host: config.live_feed_host.clone(),
            port: config.live_feed_port,
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            dataset: config.dataset.clone(),
            backfill_inactivity: Duration::from_millis(config.backfill_inactivity_ms),
        }));

        let reconciler = Reconciler::new(
            store.clone(),
            historical,
            live_client.clone(),
            config.early_cushion_ms,
            config.late_cushion_ms,
        );

        Ok(Self {
            store,
            reconciler,
            live_client,
        })
    }

    /// One-shot candle series request: reconcile the 1-minute history and
    /// aggregate it into the requested timeframe.
    pub async fn get_candles(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        start: i64,
        end: RangeEnd,
        use_cache: bool,
        save_cache: bool,
    ) -> Result<Vec<Candle>> {
        validate_request(instrument, start, end)?;

        let bars = self
            .reconciler
            .reconcile(instrument, start, end, use_cache, save_cache)
            .await?;

        let effective_end = match end {
            RangeEnd::At(ts) => ts,
            RangeEnd::Current => Utc::now().timestamp_millis(),
        };
        let candles = aggregate(instrument, timeframe, start, effective_end, &bars);

        if candles.is_empty() {
            return Err(RequestError::NoDataAvailable {
                instrument: instrument.to_string(),
                start,
                end: effective_end,
            }
            .into());
        }

        info!(
            instrument,
            %timeframe,
            candles = candles.len(),
            "served candle series"
        );
        Ok(candles)
    }

    /// Create a session for a live subscriber. Candle events flow out of the
    /// returned receiver; timeframes are added/removed on the session
    /// (`add_timeframe_live` once the trade stream is flowing, so in-flight
    /// trades queue instead of racing the backfill).
    pub fn subscribe(&self, buffer: usize) -> (Session, mpsc::Receiver<CandleEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        let session = Session::new(self.store.clone(), self.reconciler.clone(), tx);
        (session, rx)
    }

    /// Open the session's long-lived trade stream. The caller pumps the
    /// receiver into `Session::on_trade` (one task per connection) and
    /// attaches the handle so disconnect tears the socket down.
    pub async fn open_trade_stream(
        &self,
        instrument: &str,
        start: i64,
    ) -> Result<(mpsc::Receiver<Trade>, LiveFeedHandle)> {
        let (tx, rx) = mpsc::channel(1024);
        let handle = self.live_client.stream_trades(instrument, start, tx).await?;
        Ok((rx, handle))
    }

    /// Administrative purge of the 1-minute cache
    pub async fn purge_cache(&self, filter: &PurgeFilter) -> Result<u64> {
        self.store.purge(filter).await
    }
}

fn validate_request(instrument: &str, start: i64, end: RangeEnd) -> Result<()> {
    if instrument.trim().is_empty() {
        return Err(RequestError::UnknownInstrument {
            instrument: instrument.to_string(),
        }
        .into());
    }
    if let RangeEnd::At(end_ts) = end
        && start >= end_ts
    {
        return Err(RequestError::InvalidRange { start, end: end_ts }.into());
    }
    Ok(())
}
