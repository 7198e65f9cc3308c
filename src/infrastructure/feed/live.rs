//! Stateful client for the authenticated streaming socket.
//!
//! One connection is either long-lived (streams trades into a session for
//! its lifetime) or transient (minute-bar backfill bounded by an inactivity
//! timeout). There is no automatic reconnect here; the owner observes the
//! failure and decides.

use crate::domain::errors::FeedError;
use crate::domain::market::{Candle, CandleSource, Timeframe, Trade, TradeSide};
use crate::domain::ports::LiveBarSource;
use crate::infrastructure::feed::protocol::{
    DataRecord, FeedState, Handshake, SubscriptionSchema, decode_price,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, Lines};
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct LiveFeedConfig {
    pub host: String,
    pub port: u16,
    pub api_key: String,
    pub api_secret: String,
    pub dataset: String,
    pub backfill_inactivity: Duration,
}

/// Handle to a long-lived trade-streaming connection. Dropping or closing
/// the handle tears the socket down; the task result reports how the
/// connection ended.
#[derive(Debug)]
pub struct LiveFeedHandle {
    task: JoinHandle<Result<(), FeedError>>,
}

impl LiveFeedHandle {
    pub fn close(&self) {
        self.task.abort();
    }

    /// Wait for the connection to end. `Ok(())` means the server closed the
    /// stream gracefully.
    pub async fn join(self) -> Result<(), FeedError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(FeedError::ConnectionLost {
                reason: format!("feed task panicked: {e}"),
            }),
        }
    }
}

pub struct LiveFeedClient {
    config: LiveFeedConfig,
}

impl LiveFeedClient {
    pub fn new(config: LiveFeedConfig) -> Self {
        Self { config }
    }

    /// Open a long-lived connection streaming trades for `instrument` into
    /// `trade_tx`. Resolves once the handshake completes and the stream is
    /// live; decoding then continues on a background task.
    pub async fn stream_trades(
        &self,
        instrument: &str,
        start: i64,
        trade_tx: mpsc::Sender<Trade>,
    ) -> Result<LiveFeedHandle, FeedError> {
        let handshake = Handshake {
            api_key: self.config.api_key.clone(),
            api_secret: self.config.api_secret.clone(),
            dataset: self.config.dataset.clone(),
            schema: SubscriptionSchema::Trades,
            instrument: instrument.to_string(),
            start,
        };

        let (mut lines, mut writer) = self.connect().await?;
        run_handshake(&handshake, &mut lines, &mut writer).await?;
        info!(instrument, "live feed streaming trades");

        let task = tokio::spawn(async move {
            let result = stream_trade_loop(&mut lines, trade_tx).await;
            let _ = writer.shutdown().await;
            match &result {
                Ok(()) => info!(state = FeedState::Closed.as_str(), "live feed ended"),
                Err(e) => {
                    error!(state = FeedState::Failed.as_str(), "live feed ended with error: {e}")
                }
            }
            result
        });

        Ok(LiveFeedHandle { task })
    }

    async fn connect(&self) -> Result<(Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf), FeedError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| FeedError::ConnectionLost {
                reason: format!("connect to {addr} failed: {e}"),
            })?;
        let (read_half, write_half) = stream.into_split();
        Ok((BufReader::new(read_half).lines(), write_half))
    }
}

#[async_trait]
impl LiveBarSource for LiveFeedClient {
    /// Transient minute-bar backfill. Collects bars from `start` until no
    /// new bar arrives within the configured inactivity window, then closes
    /// and returns whatever arrived. This bounds backfill latency instead
    /// of hanging on a quiet upstream.
    async fn backfill_bars(&self, instrument: &str, start: i64) -> Result<Vec<Candle>> {
        let handshake = Handshake {
            api_key: self.config.api_key.clone(),
            api_secret: self.config.api_secret.clone(),
            dataset: self.config.dataset.clone(),
            schema: SubscriptionSchema::OneMinuteBars,
            instrument: instrument.to_string(),
            start,
        };

        let (mut lines, mut writer) = self
            .connect()
            .await
            .context("backfill connection failed")?;
        run_handshake(&handshake, &mut lines, &mut writer)
            .await
            .context("backfill handshake failed")?;

        let mut symbols: HashMap<u32, String> = HashMap::new();
        let mut bars: Vec<Candle> = Vec::new();

        // The inactivity clock runs from the last *bar* record. Heartbeats
        // and other chatter must not keep a bar-quiet backfill alive.
        let mut deadline = Instant::now() + self.config.backfill_inactivity;

        loop {
            let line = match tokio::time::timeout_at(deadline, lines.next_line()).await {
                Err(_elapsed) => {
                    debug!(
                        instrument,
                        collected = bars.len(),
                        "no new bars within the inactivity window, closing"
                    );
                    break;
                }
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    debug!(instrument, "backfill feed closed by server");
                    break;
                }
                Ok(Err(e)) => {
                    // Degrade to what we already collected; the reconciler
                    // treats a short backfill the same as a quiet feed.
                    warn!("backfill read error, keeping {} bars: {e}", bars.len());
                    break;
                }
            };

            match DataRecord::parse(&line) {
                Ok(DataRecord::Mapping {
                    instrument_id,
                    symbol,
                }) => {
                    symbols.insert(instrument_id, symbol);
                }
                Ok(DataRecord::Bar {
                    instrument_id,
                    ts_event,
                    open,
                    high,
                    low,
                    close,
                    volume,
                }) => {
                    let symbol = symbols
                        .get(&instrument_id)
                        .cloned()
                        .unwrap_or_else(|| instrument.to_string());
                    bars.push(Candle {
                        instrument: symbol,
                        timeframe: Timeframe::OneMin,
                        timestamp: Timeframe::OneMin.bucket_start(ts_event),
                        open: decode_price(open),
                        high: decode_price(high),
                        low: decode_price(low),
                        close: decode_price(close),
                        volume,
                        is_closed: true,
                        source: CandleSource::Live,
                    });
                    deadline = Instant::now() + self.config.backfill_inactivity;
                }
                Ok(DataRecord::Heartbeat {}) | Ok(DataRecord::Unknown) => {
                    debug!("ignoring non-bar record during backfill");
                }
                Ok(DataRecord::Trade { .. }) => {
                    debug!("ignoring trade record during bar backfill");
                }
                Err(e) => {
                    warn!("skipping malformed backfill record: {e}");
                }
            }
        }

        let _ = writer.shutdown().await;
        info!(instrument, bars = bars.len(), "backfill complete");
        Ok(bars)
    }
}

async fn run_handshake(
    handshake: &Handshake,
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    writer: &mut OwnedWriteHalf,
) -> Result<(), FeedError> {
    let mut state = FeedState::Connecting;

    while state != FeedState::Streaming {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                return Err(FeedError::ConnectionLost {
                    reason: format!("socket closed during handshake ({})", state.as_str()),
                });
            }
            Err(e) => {
                return Err(FeedError::ConnectionLost {
                    reason: format!("read failed during handshake: {e}"),
                });
            }
        };

        let step = handshake.on_line(state, &line)?;
        for out in &step.send {
            writer
                .write_all(format!("{out}\n").as_bytes())
                .await
                .map_err(|e| FeedError::ConnectionLost {
                    reason: format!("write failed during handshake: {e}"),
                })?;
        }
        debug!(
            from = state.as_str(),
            to = step.next.as_str(),
            "handshake transition"
        );
        state = step.next;
    }

    Ok(())
}

async fn stream_trade_loop(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    trade_tx: mpsc::Sender<Trade>,
) -> Result<(), FeedError> {
    let mut symbols: HashMap<u32, String> = HashMap::new();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("live feed closed by server");
                return Ok(());
            }
            Err(e) => {
                return Err(FeedError::ConnectionLost {
                    reason: format!("read failed: {e}"),
                });
            }
        };

        match DataRecord::parse(&line) {
            Ok(DataRecord::Mapping {
                instrument_id,
                symbol,
            }) => {
                debug!(instrument_id, symbol, "instrument mapping");
                symbols.insert(instrument_id, symbol);
            }
            Ok(DataRecord::Trade {
                instrument_id,
                ts_event,
                price,
                size,
                side,
            }) => {
                let Some(symbol) = symbols.get(&instrument_id) else {
                    warn!(instrument_id, "trade for unmapped instrument, dropping");
                    continue;
                };
                let trade = Trade {
                    instrument: symbol.clone(),
                    timestamp: ts_event,
                    price: decode_price(price),
                    size,
                    side: side
                        .and_then(|s| s.chars().next())
                        .map(TradeSide::from_flag)
                        .unwrap_or(TradeSide::Unknown),
                };
                if trade_tx.send(trade).await.is_err() {
                    // Session went away; treat as a graceful close.
                    info!("trade receiver dropped, closing live feed");
                    return Ok(());
                }
            }
            Ok(DataRecord::Bar { .. }) => {
                debug!("ignoring bar record on trade stream");
            }
            Ok(DataRecord::Heartbeat {}) | Ok(DataRecord::Unknown) => {
                debug!("heartbeat/unknown record ignored");
            }
            Err(e) => {
                warn!("skipping malformed record: {e}");
            }
        }
    }
}
