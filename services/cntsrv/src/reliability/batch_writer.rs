//! Buffered writer in front of the storage sink
//!
//! Readings are flushed in FIFO batches when `batch_size` is reached or the
//! oldest buffered reading has waited `batch_timeout_ms`. A batch the sink
//! refuses goes to the dead-letter queue whole; if the queue cannot take it
//! either, the batch returns to the head of the buffer.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use errors::CounterError;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dead_letter::{DeadLetterError, DeadLetterStore};
use crate::config::BatchConfig;
use crate::pipeline::ProcessedReading;
use crate::storage::{ReadingSink, StorageError};

/// Pause before retrying after the dead-letter queue refused a batch
const UNPERSISTED_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Final-flush attempts per batch once shutdown has begun
const SHUTDOWN_FLUSH_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum BatchError {
    /// Neither storage nor the dead-letter queue accepted the batch
    #[error("{count} readings could not be persisted: {source}")]
    Unpersisted {
        count: usize,
        #[source]
        source: DeadLetterError,
    },
}

impl From<BatchError> for CounterError {
    fn from(err: BatchError) -> Self {
        CounterError::DeadLetter(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    Written(usize),
    DeadLettered(usize),
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchStats {
    pub received: u64,
    pub written: u64,
    pub dead_lettered: u64,
    pub spilled: u64,
    pub batches_written: u64,
    pub batches_failed: u64,
    pub buffered: usize,
    /// Readings dropped when shutdown could not persist them
    pub lost: u64,
    pub last_flush_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_write_latency_ms: u64,
}

pub struct BatchWriter {
    config: BatchConfig,
    sink: Arc<dyn ReadingSink>,
    dead_letter: Arc<DeadLetterStore>,
    /// Buffered readings with the instant each was accepted
    buffer: Mutex<VecDeque<(Instant, ProcessedReading)>>,
    /// Serializes flushes so batches leave in FIFO order
    flush_lock: Mutex<()>,
    notify: Notify,
    stats: RwLock<BatchStats>,
}

impl BatchWriter {
    pub fn new(
        config: BatchConfig,
        sink: Arc<dyn ReadingSink>,
        dead_letter: Arc<DeadLetterStore>,
    ) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(config.batch_size)),
            config,
            sink,
            dead_letter,
            flush_lock: Mutex::new(()),
            notify: Notify::new(),
            stats: RwLock::new(BatchStats::default()),
        }
    }

    /// Buffer one reading, waking the flush task once a batch is ready
    pub async fn add(&self, reading: ProcessedReading) {
        let (len, spill) = {
            let mut buffer = self.buffer.lock().await;
            buffer.push_back((Instant::now(), reading));
            let spill = if buffer.len() > self.config.max_buffered {
                let n = self.config.batch_size.min(buffer.len());
                Some(buffer.drain(..n).collect::<Vec<_>>())
            } else {
                None
            };
            (buffer.len(), spill)
        };
        self.stats.write().received += 1;

        if let Some(spill) = spill {
            self.spill(spill).await;
        }
        if len >= self.config.batch_size {
            self.notify.notify_one();
        }
    }

    /// Backpressure: move the oldest readings straight to the dead-letter queue
    async fn spill(&self, entries: Vec<(Instant, ProcessedReading)>) {
        let count = entries.len();
        let readings: Vec<_> = entries.iter().map(|(_, r)| r.clone()).collect();
        warn!(
            "Write buffer above {} readings, spilling {} to the dead-letter queue",
            self.config.max_buffered, count
        );
        match self
            .dead_letter
            .enqueue(readings, "write buffer full")
            .await
        {
            Ok(_) => {
                let mut stats = self.stats.write();
                stats.spilled += count as u64;
                stats.dead_lettered += count as u64;
            },
            Err(e) => {
                error!("Failed to spill {} readings, keeping them buffered: {}", count, e);
                self.requeue(entries).await;
            },
        }
    }

    async fn requeue(&self, entries: Vec<(Instant, ProcessedReading)>) {
        let mut buffer = self.buffer.lock().await;
        for entry in entries.into_iter().rev() {
            buffer.push_front(entry);
        }
    }

    /// Write the oldest batch
    pub async fn flush(&self) -> Result<FlushOutcome, BatchError> {
        let _flushing = self.flush_lock.lock().await;

        let entries: Vec<_> = {
            let mut buffer = self.buffer.lock().await;
            let n = self.config.batch_size.min(buffer.len());
            buffer.drain(..n).collect()
        };
        if entries.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        let readings: Vec<ProcessedReading> = entries.iter().map(|(_, r)| r.clone()).collect();
        let count = readings.len();
        let started = Instant::now();
        let write_timeout = self.config.write_timeout();

        let result = match timeout(write_timeout, self.sink.write_batch(&readings)).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(write_timeout)),
        };

        match result {
            Ok(()) => {
                let latency = started.elapsed();
                let mut stats = self.stats.write();
                stats.written += count as u64;
                stats.batches_written += 1;
                stats.last_flush_at = Some(Utc::now());
                stats.last_write_latency_ms = latency.as_millis() as u64;
                debug!(
                    "Wrote batch of {} readings to {} in {:?}",
                    count,
                    self.sink.name(),
                    latency
                );
                Ok(FlushOutcome::Written(count))
            },
            Err(e) => {
                warn!(
                    "Batch of {} readings failed on {}: {}",
                    count,
                    self.sink.name(),
                    e
                );
                {
                    let mut stats = self.stats.write();
                    stats.batches_failed += 1;
                    stats.last_error = Some(e.to_string());
                }

                match self.dead_letter.enqueue(readings, &e.to_string()).await {
                    Ok(_) => {
                        self.stats.write().dead_lettered += count as u64;
                        Ok(FlushOutcome::DeadLettered(count))
                    },
                    Err(dlq_err) => {
                        error!(
                            "Dead-letter queue refused {} readings, returning them to the buffer: {}",
                            count, dlq_err
                        );
                        self.requeue(entries).await;
                        Err(BatchError::Unpersisted {
                            count,
                            source: dlq_err,
                        })
                    },
                }
            },
        }
    }

    /// Flush loop; drains the buffer once `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "Batch writer started (size {}, timeout {:?}, sink {})",
            self.config.batch_size,
            self.config.batch_timeout(),
            self.sink.name()
        );

        loop {
            let (len, oldest) = {
                let buffer = self.buffer.lock().await;
                (buffer.len(), buffer.front().map(|(at, _)| *at))
            };

            if len >= self.config.batch_size {
                if self.flush_or_pause(&cancel).await {
                    continue;
                }
                break;
            }

            let deadline = oldest.map(|at| at + self.config.batch_timeout());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.notify.notified() => {},
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if !self.flush_or_pause(&cancel).await {
                        break;
                    }
                }
            }
        }

        self.drain().await;
        let stats = self.stats().await;
        info!(
            "Batch writer stopped: {} written, {} dead-lettered, {} still buffered",
            stats.written, stats.dead_lettered, stats.buffered
        );
    }

    /// Flush once; on an unpersisted batch wait before the next attempt.
    /// Returns false when cancelled during the wait.
    async fn flush_or_pause(&self, cancel: &CancellationToken) -> bool {
        if self.flush().await.is_ok() {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = sleep(UNPERSISTED_RETRY_DELAY) => true,
        }
    }

    async fn drain(&self) {
        let mut failures = 0;
        loop {
            match self.flush().await {
                Ok(FlushOutcome::Empty) => break,
                Ok(_) => failures = 0,
                Err(e) => {
                    failures += 1;
                    if failures >= SHUTDOWN_FLUSH_ATTEMPTS {
                        let left = std::mem::take(&mut *self.buffer.lock().await);
                        error!(
                            "Giving up final flush with {} readings unpersisted: {}",
                            left.len(),
                            e
                        );
                        for range in lost_ranges(left.iter().map(|(_, r)| r)) {
                            error!(
                                "Lost {} readings of device {} channel {} from {} to {}",
                                range.count,
                                range.device_id,
                                range.channel,
                                range.first.to_rfc3339(),
                                range.last.to_rfc3339()
                            );
                        }
                        self.stats.write().lost += left.len() as u64;
                        break;
                    }
                    sleep(UNPERSISTED_RETRY_DELAY).await;
                },
            }
        }
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }

    pub async fn stats(&self) -> BatchStats {
        let buffered = self.buffered().await;
        let mut stats = self.stats.read().clone();
        stats.buffered = buffered;
        stats
    }
}

/// Unpersisted readings of one channel
#[derive(Debug, Clone, PartialEq)]
struct LostRange {
    device_id: String,
    channel: u16,
    count: usize,
    first: DateTime<Utc>,
    last: DateTime<Utc>,
}

fn lost_ranges<'a>(readings: impl Iterator<Item = &'a ProcessedReading>) -> Vec<LostRange> {
    let mut ranges: BTreeMap<(&str, u16), LostRange> = BTreeMap::new();
    for reading in readings {
        ranges
            .entry((reading.device_id.as_str(), reading.channel))
            .and_modify(|range| {
                range.count += 1;
                range.first = range.first.min(reading.timestamp);
                range.last = range.last.max(reading.timestamp);
            })
            .or_insert_with(|| LostRange {
                device_id: reading.device_id.clone(),
                channel: reading.channel,
                count: 1,
                first: reading.timestamp,
                last: reading.timestamp,
            });
    }
    ranges.into_values().collect()
}
