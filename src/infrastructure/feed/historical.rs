//! Request/response client for the historical 1-minute bar endpoint.
//!
//! The endpoint returns newline-delimited JSON bars with fixed-point-scaled
//! prices. When the requested end exceeds what the provider has, the error
//! body carries the available boundary; we clamp and retry exactly once.

use crate::domain::market::{Candle, CandleSource, Timeframe};
use crate::domain::ports::HistoricalBarSource;
use crate::infrastructure::feed::protocol::decode_price;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

pub struct HistoricalFeedClient {
    client: ClientWithMiddleware,
    base_url: String,
    api_key: String,
    dataset: String,
}

#[derive(Debug, Deserialize)]
struct BarRecord {
    /// Bucket start, epoch ms
    ts_event: i64,
    open: i64,
    high: i64,
    low: i64,
    close: i64,
    volume: u64,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    #[serde(default)]
    detail: String,
    /// Present when the requested end exceeds available data
    #[serde(default)]
    available_end: Option<i64>,
}

enum FetchAttempt {
    Bars(Vec<Candle>),
    EndBeyondAvailable(i64),
}

impl HistoricalFeedClient {
    pub fn new(base_url: String, api_key: String, dataset: String) -> Self {
        // Transient-failure retries (timeouts, 5xx) live in the middleware;
        // the clamp retry below is a protocol-level concern, not transport.
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            client,
            base_url,
            api_key,
            dataset,
        }
    }

    async fn fetch_once(&self, instrument: &str, start: i64, end: i64) -> Result<FetchAttempt> {
        let url = format!(
            "{}/v0/timeseries.get_range?dataset={}&symbols={}&schema=ohlcv-1m&start={}&end={}",
            self.base_url.trim_end_matches('/'),
            self.dataset,
            instrument,
            start,
            end
        );

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .context("historical bars request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if let Ok(err) = serde_json::from_str::<ProviderError>(&body)
                && let Some(available_end) = err.available_end
            {
                return Ok(FetchAttempt::EndBeyondAvailable(available_end));
            }
            bail!("historical fetch failed ({status}): {body}");
        }

        let body = response
            .text()
            .await
            .context("failed to read historical response body")?;

        Ok(FetchAttempt::Bars(parse_bars(&body, instrument)))
    }
}

/// Parse a newline-delimited JSON body of 1-minute bar records. Malformed
/// lines are skipped with a warning rather than failing the whole fetch.
pub fn parse_bars(body: &str, instrument: &str) -> Vec<Candle> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<BarRecord>(line) {
            Ok(rec) => Some(Candle {
                instrument: instrument.to_string(),
                timeframe: Timeframe::OneMin,
                timestamp: Timeframe::OneMin.bucket_start(rec.ts_event),
                open: decode_price(rec.open),
                high: decode_price(rec.high),
                low: decode_price(rec.low),
                close: decode_price(rec.close),
                volume: rec.volume,
                is_closed: true,
                source: CandleSource::Historical,
            }),
            Err(e) => {
                warn!("skipping malformed historical bar: {e}");
                None
            }
        })
        .collect()
}

#[async_trait]
impl HistoricalBarSource for HistoricalFeedClient {
    async fn fetch_range(&self, instrument: &str, start: i64, end: i64) -> Result<Vec<Candle>> {
        match self.fetch_once(instrument, start, end).await? {
            FetchAttempt::Bars(bars) => {
                info!(instrument, bars = bars.len(), "historical fetch");
                Ok(bars)
            }
            FetchAttempt::EndBeyondAvailable(available_end) => {
                warn!(
                    instrument,
                    requested_end = end,
                    available_end,
                    "requested end beyond available data, clamping and retrying once"
                );
                match self.fetch_once(instrument, start, available_end).await? {
                    FetchAttempt::Bars(bars) => Ok(bars),
                    FetchAttempt::EndBeyondAvailable(_) => {
                        bail!(
                            "historical end still beyond available data for {instrument} after clamping to {available_end}"
                        )
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_bars_ndjson() {
        let body = concat!(
            r#"{"ts_event":1704067200000,"open":100000000000,"high":101000000000,"low":99000000000,"close":100500000000,"volume":5}"#,
            "\n",
            r#"{"ts_event":1704067260000,"open":100500000000,"high":102000000000,"low":100000000000,"close":101000000000,"volume":3}"#,
            "\n",
        );
        let bars = parse_bars(body, "ESM5");
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].timestamp, 1704067200000);
        assert_eq!(bars[0].open, dec!(100));
        assert_eq!(bars[0].close, dec!(100.5));
        assert_eq!(bars[1].volume, 3);
        assert_eq!(bars[1].source, CandleSource::Historical);
        assert!(bars[1].is_closed);
    }

    #[test]
    fn test_parse_bars_skips_garbage_lines() {
        let body = "not json\n{\"ts_event\":1704067200000,\"open\":1,\"high\":1,\"low\":1,\"close\":1,\"volume\":1}\n\n";
        let bars = parse_bars(body, "ESM5");
        assert_eq!(bars.len(), 1);
    }

    #[test]
    fn test_parse_error_body() {
        let body = r#"{"detail":"end beyond available range","available_end":1704067200000}"#;
        let err: ProviderError = serde_json::from_str(body).unwrap();
        assert_eq!(err.available_end, Some(1704067200000));
        assert!(err.detail.contains("available"));
    }
}
