//! SQLite backend
//!
//! WAL mode with normal synchronous, tuned for an edge box. Readings are
//! upserted on `(timestamp_ms, device_id, channel)` so redelivered batches
//! do not create duplicates.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous},
    QueryBuilder, Row, Sqlite, SqlitePool,
};
use tracing::{debug, info};

use super::{ReadingFilter, ReadingQuery, ReadingSink, StorageError};
use crate::config::SqliteConfig;
use crate::pipeline::{ProcessedReading, Quality};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS counter_readings (
    timestamp_ms    INTEGER NOT NULL,
    device_id       TEXT    NOT NULL,
    channel         INTEGER NOT NULL,
    raw_value       INTEGER NOT NULL,
    processed_value REAL    NOT NULL,
    rate            REAL    NOT NULL,
    quality         TEXT    NOT NULL,
    unit            TEXT    NOT NULL,
    PRIMARY KEY (timestamp_ms, device_id, channel)
);
CREATE INDEX IF NOT EXISTS idx_counter_readings_channel
    ON counter_readings (device_id, channel, timestamp_ms);
"#;

const COLUMNS: &str =
    "timestamp_ms, device_id, channel, raw_value, processed_value, rate, quality, unit";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteStore {
    pub async fn open(config: &SqliteConfig) -> Result<Self, StorageError> {
        let path = config.path.to_string_lossy().to_string();

        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        info!("SQLite reading store opened: {}", path);
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM counter_readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_reading(row: &SqliteRow) -> Result<ProcessedReading, StorageError> {
    let timestamp_ms: i64 = row.try_get("timestamp_ms")?;
    let channel: i64 = row.try_get("channel")?;
    let raw_value: i64 = row.try_get("raw_value")?;
    let quality: String = row.try_get("quality")?;

    Ok(ProcessedReading {
        timestamp: Utc
            .timestamp_millis_opt(timestamp_ms)
            .single()
            .ok_or_else(|| StorageError::Rejected(format!("invalid timestamp {}", timestamp_ms)))?,
        device_id: row.try_get("device_id")?,
        channel: u16::try_from(channel)
            .map_err(|_| StorageError::Rejected(format!("invalid channel {}", channel)))?,
        raw_value: u64::try_from(raw_value).unwrap_or_default(),
        processed_value: row.try_get("processed_value")?,
        rate: row.try_get("rate")?,
        quality: Quality::from_str(&quality).map_err(StorageError::Rejected)?,
        unit: row.try_get("unit")?,
    })
}

#[async_trait]
impl ReadingSink for SqliteStore {
    async fn write_batch(&self, readings: &[ProcessedReading]) -> Result<(), StorageError> {
        if readings.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for reading in readings {
            sqlx::query(
                "INSERT OR REPLACE INTO counter_readings \
                 (timestamp_ms, device_id, channel, raw_value, processed_value, rate, quality, unit) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(reading.timestamp.timestamp_millis())
            .bind(&reading.device_id)
            .bind(i64::from(reading.channel))
            .bind(i64::try_from(reading.raw_value).unwrap_or(i64::MAX))
            .bind(reading.processed_value)
            .bind(reading.rate)
            .bind(reading.quality.as_str())
            .bind(&reading.unit)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!("Wrote {} readings to SQLite", readings.len());
        Ok(())
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[async_trait]
impl ReadingQuery for SqliteStore {
    async fn query(&self, filter: &ReadingFilter) -> Result<Vec<ProcessedReading>, StorageError> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM counter_readings WHERE 1 = 1", COLUMNS));
        if let Some(from) = filter.from {
            builder
                .push(" AND timestamp_ms >= ")
                .push_bind(from.timestamp_millis());
        }
        if let Some(to) = filter.to {
            builder
                .push(" AND timestamp_ms < ")
                .push_bind(to.timestamp_millis());
        }
        if let Some(device_id) = &filter.device_id {
            builder.push(" AND device_id = ").push_bind(device_id.clone());
        }
        if let Some(channel) = filter.channel {
            builder.push(" AND channel = ").push_bind(i64::from(channel));
        }
        builder.push(" ORDER BY timestamp_ms ASC, device_id ASC, channel ASC");
        if let Some(limit) = filter.limit {
            builder
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_reading).collect()
    }

    async fn recent(
        &self,
        device_id: &str,
        channel: u16,
        limit: usize,
    ) -> Result<Vec<ProcessedReading>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM counter_readings WHERE device_id = ? AND channel = ? \
             ORDER BY timestamp_ms DESC LIMIT ?",
            COLUMNS
        ))
        .bind(device_id)
        .bind(i64::from(channel))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_reading).collect()
    }
}
