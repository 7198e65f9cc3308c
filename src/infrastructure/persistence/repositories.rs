use crate::domain::market::{Candle, CandleSource, Timeframe};
use crate::domain::repositories::{CandleStore, PurgeFilter};
use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

pub struct SqliteCandleStore {
    pool: SqlitePool,
}

impl SqliteCandleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CandleStore for SqliteCandleStore {
    async fn get_range(&self, instrument: &str, start: i64, end: i64) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            "SELECT * FROM candles WHERE instrument = ? AND timeframe = '1m' \
             AND timestamp >= ? AND timestamp <= ? ORDER BY timestamp ASC",
        )
        .bind(instrument)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("Failed to read candle range")?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            candles.push(Candle {
                instrument: row.try_get("instrument")?,
                timeframe: Timeframe::OneMin,
                timestamp: row.try_get("timestamp")?,
                open: decimal_column(&row, "open")?,
                high: decimal_column(&row, "high")?,
                low: decimal_column(&row, "low")?,
                close: decimal_column(&row, "close")?,
                volume: row.try_get::<i64, _>("volume")? as u64,
                is_closed: true,
                // Whatever wrote the row, a read serves it from cache
                source: CandleSource::Cache,
            });
        }
        Ok(candles)
    }

    async fn put_batch(&self, candles: &[Candle]) -> Result<u64> {
        // Zero-volume candles are displayable but never durable
        let valid: Vec<&Candle> = candles.iter().filter(|c| c.is_valid()).collect();
        if valid.len() < candles.len() {
            debug!(
                "filtered {} invalid candles from batch of {}",
                candles.len() - valid.len(),
                candles.len()
            );
        }
        if valid.is_empty() {
            return Ok(0);
        }

        // All-or-nothing: a storage failure mid-batch rolls everything back
        let mut tx = self.pool.begin().await.context("Failed to begin batch")?;

        for candle in &valid {
            sqlx::query(
                r#"
                INSERT INTO candles (instrument, timeframe, timestamp, open, high, low, close, volume, source)
                VALUES (?, '1m', ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(instrument, timeframe, timestamp) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume,
                    source = excluded.source
                "#,
            )
            .bind(&candle.instrument)
            .bind(candle.timestamp)
            .bind(candle.open.to_string())
            .bind(candle.high.to_string())
            .bind(candle.low.to_string())
            .bind(candle.close.to_string())
            .bind(candle.volume as i64)
            .bind(candle.source.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to upsert candle")?;
        }

        tx.commit().await.context("Failed to commit candle batch")?;
        Ok(valid.len() as u64)
    }

    async fn purge(&self, filter: &PurgeFilter) -> Result<u64> {
        let mut sql = String::from("DELETE FROM candles WHERE 1=1");
        if filter.instrument.is_some() {
            sql.push_str(" AND instrument = ?");
        }
        if filter.start.is_some() {
            sql.push_str(" AND timestamp >= ?");
        }
        if filter.end.is_some() {
            sql.push_str(" AND timestamp <= ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(instrument) = &filter.instrument {
            query = query.bind(instrument);
        }
        if let Some(start) = filter.start {
            query = query.bind(start);
        }
        if let Some(end) = filter.end {
            query = query.bind(end);
        }

        let result = query
            .execute(&self.pool)
            .await
            .context("Failed to purge candles")?;

        info!(removed = result.rows_affected(), "purged candle cache");
        Ok(result.rows_affected())
    }
}

fn decimal_column(row: &sqlx::sqlite::SqliteRow, name: &str) -> Result<Decimal> {
    let text: String = row.try_get(name)?;
    Decimal::from_str(&text).with_context(|| format!("Invalid decimal in column {name}"))
}
