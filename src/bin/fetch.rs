//! One-shot candle fetch: reconcile and aggregate a range, print the result.

use anyhow::Result;
use barstream::application::engine::MarketDataEngine;
use barstream::application::market_data::reconciler::RangeEnd;
use barstream::config::Config;
use barstream::domain::market::Timeframe;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fetch", about = "Fetch an OHLC candle series")]
struct Args {
    /// Instrument symbol, e.g. ESM5
    instrument: String,

    /// Target timeframe (1m, 5m, 15m, 1h, 4h, 1d)
    #[arg(short, long, default_value = "1m")]
    timeframe: Timeframe,

    /// Range start, epoch milliseconds UTC
    #[arg(short, long)]
    start: i64,

    /// Range end, epoch milliseconds UTC; omit for "now"
    #[arg(short, long)]
    end: Option<i64>,

    /// Bypass the candle cache for this request
    #[arg(long)]
    no_cache: bool,

    /// Do not write fetched data back to the cache
    #[arg(long)]
    no_save: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;
    let engine = MarketDataEngine::from_config(&config).await?;

    let end = args.end.map(RangeEnd::At).unwrap_or(RangeEnd::Current);
    let candles = engine
        .get_candles(
            &args.instrument,
            args.timeframe,
            args.start,
            end,
            !args.no_cache,
            !args.no_save,
        )
        .await?;

    for c in &candles {
        println!(
            "{} {} ts={} O={} H={} L={} C={} V={} {}",
            c.instrument,
            c.timeframe,
            c.timestamp,
            c.open,
            c.high,
            c.low,
            c.close,
            c.volume,
            if c.is_closed { "closed" } else { "open" }
        );
    }

    Ok(())
}
