use anyhow::{Context, Result};
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection string for the candle cache
    pub database_url: String,

    // Historical REST API
    pub historical_base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub dataset: String,

    // Live streaming socket
    pub live_feed_host: String,
    pub live_feed_port: u16,

    /// Leading cache gaps smaller than this are accepted instead of
    /// triggering an upstream fetch (missing pre-market data).
    pub early_cushion_ms: i64,
    /// Trailing gap tolerance when the requested end is "current".
    pub late_cushion_ms: i64,
    /// Backfill connections close after this much bar silence.
    pub backfill_inactivity_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // Load .env if present; real env takes precedence
        dotenvy::dotenv().ok();

        let database_url = env::var("BARSTREAM_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://data/candles.db".to_string());

        let historical_base_url = env::var("BARSTREAM_HIST_URL")
            .unwrap_or_else(|_| "https://hist.feed.example.com".to_string());

        let api_key = env::var("BARSTREAM_API_KEY").unwrap_or_default();
        let api_secret = env::var("BARSTREAM_API_SECRET").unwrap_or_default();

        let dataset = env::var("BARSTREAM_DATASET").unwrap_or_else(|_| "GLBX.MDP3".to_string());

        let live_feed_host =
            env::var("BARSTREAM_LIVE_HOST").unwrap_or_else(|_| "live.feed.example.com".to_string());
        let live_feed_port = env::var("BARSTREAM_LIVE_PORT")
            .unwrap_or_else(|_| "13000".to_string())
            .parse::<u16>()
            .context("BARSTREAM_LIVE_PORT must be a valid port number")?;

        let early_cushion_ms = env::var("BARSTREAM_EARLY_CUSHION_MS")
            .unwrap_or_else(|_| "1800000".to_string()) // 30 minutes
            .parse::<i64>()
            .context("BARSTREAM_EARLY_CUSHION_MS must be an integer")?;

        let late_cushion_ms = env::var("BARSTREAM_LATE_CUSHION_MS")
            .unwrap_or_else(|_| "120000".to_string()) // 2 minutes
            .parse::<i64>()
            .context("BARSTREAM_LATE_CUSHION_MS must be an integer")?;

        let backfill_inactivity_ms = env::var("BARSTREAM_BACKFILL_INACTIVITY_MS")
            .unwrap_or_else(|_| "500".to_string())
            .parse::<u64>()
            .context("BARSTREAM_BACKFILL_INACTIVITY_MS must be an integer")?;

        Ok(Self {
            database_url,
            historical_base_url,
            api_key,
            api_secret,
            dataset,
            live_feed_host,
            live_feed_port,
            early_cushion_ms,
            late_cushion_ms,
            backfill_inactivity_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        // Only assert fields that have defaults; env vars may be set by the
        // developer shell, so avoid asserting exact endpoint values.
        let config = Config::from_env().expect("config should load with defaults");
        assert!(config.early_cushion_ms > 0);
        assert!(config.late_cushion_ms > 0);
        assert!(config.backfill_inactivity_ms > 0);
        assert!(!config.database_url.is_empty());
    }
}
