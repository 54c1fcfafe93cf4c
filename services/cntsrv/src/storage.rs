//! Time-series storage for processed readings
//!
//! [`ReadingSink`] is the single write primitive shared by the batch writer
//! and the dead-letter retry loop. Writes are all-or-nothing per call.
//! [`ReadingQuery`] is the read side offered to analytics consumers.

pub mod influx;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::CounterError;
use thiserror::Error;
use tracing::info;

use crate::config::{AppConfig, StorageConfig};
use crate::pipeline::ProcessedReading;

pub use influx::InfluxStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Write timed out after {0:?}")]
    Timeout(Duration),

    /// The backend refused the data; retrying the same batch will not help
    #[error("Write rejected: {0}")]
    Rejected(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether the same write may succeed later
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) | Self::Io(_) => true,
            Self::Rejected(_) => false,
            Self::Database(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => {
                    let message = db.message().to_ascii_lowercase();
                    message.contains("locked") || message.contains("busy")
                },
                _ => false,
            },
            Self::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().is_some_and(|s| s.is_server_error() || s.as_u16() == 429)
            },
        }
    }
}

impl From<StorageError> for CounterError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Database(e) => CounterError::Sqlite(e),
            StorageError::Http(e) => CounterError::HttpClient(e),
            StorageError::Io(e) => CounterError::Io(e),
            other => CounterError::Storage(other.to_string()),
        }
    }
}

/// Write primitive for processed readings
#[async_trait]
pub trait ReadingSink: Send + Sync {
    /// Persist the whole batch or nothing
    async fn write_batch(&self, readings: &[ProcessedReading]) -> Result<(), StorageError>;

    fn name(&self) -> &str;
}

/// Read interface for downstream consumers
#[async_trait]
pub trait ReadingQuery: Send + Sync {
    /// Readings matching `filter`, oldest first
    async fn query(&self, filter: &ReadingFilter) -> Result<Vec<ProcessedReading>, StorageError>;

    /// Latest `limit` readings of one channel, newest first
    async fn recent(
        &self,
        device_id: &str,
        channel: u16,
        limit: usize,
    ) -> Result<Vec<ProcessedReading>, StorageError>;
}

/// Query filter; the time range is half-open `[from, to)`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub device_id: Option<String>,
    pub channel: Option<u16>,
    pub limit: Option<usize>,
}

impl ReadingFilter {
    pub fn range(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            ..Self::default()
        }
    }

    pub fn device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn channel(mut self, channel: u16) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, reading: &ProcessedReading) -> bool {
        self.from.map_or(true, |from| reading.timestamp >= from)
            && self.to.map_or(true, |to| reading.timestamp < to)
            && self
                .device_id
                .as_deref()
                .map_or(true, |id| reading.device_id == id)
            && self.channel.map_or(true, |c| reading.channel == c)
    }
}

/// Opened storage backend
#[derive(Clone)]
pub struct Storage {
    pub sink: Arc<dyn ReadingSink>,
    /// `None` for write-only backends
    pub query: Option<Arc<dyn ReadingQuery>>,
}

/// Open the configured backend
pub async fn open(config: &AppConfig) -> Result<Storage, StorageError> {
    let storage = match &config.storage {
        StorageConfig::Sqlite(sqlite) => {
            let store = Arc::new(SqliteStore::open(sqlite).await?);
            Storage {
                sink: store.clone(),
                query: Some(store),
            }
        },
        StorageConfig::Influxdb(influx) => {
            let store = InfluxStore::new(
                influx.clone(),
                &config.devices,
                config.batch.write_timeout(),
            )?;
            Storage {
                sink: Arc::new(store),
                query: None,
            }
        },
        StorageConfig::Memory => {
            let store = Arc::new(MemoryStore::new());
            Storage {
                sink: store.clone(),
                query: Some(store),
            }
        },
    };
    info!("Storage backend ready: {}", storage.sink.name());
    Ok(storage)
}
