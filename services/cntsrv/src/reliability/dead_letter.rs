//! Durable dead-letter queue for failed storage writes
//!
//! Each entry lives in its own `pending/<uuid>.json` file, replaced atomically
//! (tmp file, fsync, rename) whenever its retry state changes. Entries that
//! leave the queue without being written, either after too many attempts or
//! through capacity eviction, are appended to `abandoned.jsonl` first.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use errors::CounterError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DeadLetterConfig;
use crate::link::ReconnectPolicy;
use crate::pipeline::ProcessedReading;
use crate::storage::ReadingSink;

const PENDING_DIR: &str = "pending";
const AUDIT_FILE: &str = "abandoned.jsonl";
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("Dead-letter I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dead-letter serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Dead-letter entry not found: {0}")]
    NotFound(Uuid),

    #[error("Refusing to enqueue an empty batch")]
    EmptyBatch,
}

impl From<DeadLetterError> for CounterError {
    fn from(err: DeadLetterError) -> Self {
        match err {
            DeadLetterError::Io(e) => CounterError::Io(e),
            other => CounterError::DeadLetter(other.to_string()),
        }
    }
}

/// A batch that could not be written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub readings: Vec<ProcessedReading>,
    pub first_failed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: String,
    #[serde(default)]
    pub abandoned: bool,
}

/// Line written to the audit log
#[derive(Debug, Serialize, Deserialize)]
struct AuditRecord {
    abandoned_at: DateTime<Utc>,
    reason: String,
    entry: DeadLetterEntry,
}

/// What happened to an entry after a failed retry
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDisposition {
    Rescheduled { next_retry_at: DateTime<Utc> },
    Abandoned,
}

/// Outcome of one retry pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetryReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub abandoned: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterStats {
    pub pending: usize,
    pub in_flight: usize,
    pub pending_bytes: u64,
    pub enqueued_total: u64,
    pub delivered_total: u64,
    pub abandoned_total: u64,
    pub evicted_total: u64,
}

struct Slot {
    entry: DeadLetterEntry,
    bytes: u64,
}

#[derive(Default)]
struct Index {
    slots: HashMap<Uuid, Slot>,
    in_flight: HashSet<Uuid>,
    total_bytes: u64,
}

impl Index {
    fn remove(&mut self, id: &Uuid) -> Option<Slot> {
        self.in_flight.remove(id);
        let slot = self.slots.remove(id)?;
        self.total_bytes = self.total_bytes.saturating_sub(slot.bytes);
        Some(slot)
    }

    /// Next eviction candidate: closest to abandonment, then oldest
    fn eviction_candidate(&self) -> Option<Uuid> {
        self.slots
            .values()
            .filter(|s| !self.in_flight.contains(&s.entry.id))
            .max_by(|a, b| {
                a.entry
                    .retry_count
                    .cmp(&b.entry.retry_count)
                    .then_with(|| b.entry.first_failed_at.cmp(&a.entry.first_failed_at))
            })
            .map(|s| s.entry.id)
    }
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    abandoned: AtomicU64,
    evicted: AtomicU64,
}

pub struct DeadLetterStore {
    config: DeadLetterConfig,
    pending_dir: PathBuf,
    audit_path: PathBuf,
    backoff: ReconnectPolicy,
    write_timeout: Duration,
    index: Mutex<Index>,
    counters: Counters,
}

impl std::fmt::Debug for DeadLetterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterStore")
            .field("path", &self.config.path)
            .finish_non_exhaustive()
    }
}

impl DeadLetterStore {
    /// Open the queue, reloading every pending entry left on disk
    pub async fn open(config: DeadLetterConfig) -> Result<Self, DeadLetterError> {
        let pending_dir = config.path.join(PENDING_DIR);
        let audit_path = config.path.join(AUDIT_FILE);
        fs::create_dir_all(&pending_dir).await?;

        let backoff = ReconnectPolicy {
            min_interval: Duration::ZERO,
            initial_delay: Duration::from_millis(config.retry_initial_ms),
            max_delay: Duration::from_millis(config.retry_max_ms),
            ..ReconnectPolicy::default()
        };

        let store = Self {
            config,
            pending_dir,
            audit_path,
            backoff,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            index: Mutex::new(Index::default()),
            counters: Counters::default(),
        };
        let loaded = store.reload().await?;
        if loaded > 0 {
            info!("Dead-letter queue reloaded {} pending entries", loaded);
        }
        Ok(store)
    }

    /// Bound on each retry write
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    async fn reload(&self) -> Result<usize, DeadLetterError> {
        let mut index = self.index.lock().await;
        let mut dir = fs::read_dir(&self.pending_dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("json") => {},
                Some("tmp") => {
                    // Interrupted write; the previous version (if any) is still in place
                    debug!("Removing partial dead-letter file {}", path.display());
                    fs::remove_file(&path).await?;
                    continue;
                },
                _ => continue,
            }

            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<DeadLetterEntry>(&bytes) {
                Ok(entry) => {
                    index.total_bytes += bytes.len() as u64;
                    index.slots.insert(
                        entry.id,
                        Slot {
                            entry,
                            bytes: bytes.len() as u64,
                        },
                    );
                },
                Err(e) => {
                    let quarantined = path.with_extension("corrupt");
                    error!(
                        "Unreadable dead-letter file {}: {}, moved to {}",
                        path.display(),
                        e,
                        quarantined.display()
                    );
                    fs::rename(&path, &quarantined).await?;
                },
            }
        }
        Ok(index.slots.len())
    }

    fn entry_path(&self, id: &Uuid) -> PathBuf {
        self.pending_dir.join(format!("{}.json", id))
    }

    /// Atomically replace the entry's file; returns the bytes written
    async fn persist(&self, entry: &DeadLetterEntry) -> Result<u64, DeadLetterError> {
        let data = serde_json::to_vec(entry)?;
        let path = self.entry_path(&entry.id);
        let tmp = path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        Ok(data.len() as u64)
    }

    async fn append_audit(&self, entry: &DeadLetterEntry, reason: &str) -> Result<(), DeadLetterError> {
        let mut entry = entry.clone();
        entry.abandoned = true;
        let record = AuditRecord {
            abandoned_at: Utc::now(),
            reason: reason.to_string(),
            entry,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_path)
            .await?;
        file.write_all(&line).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Audit then delete an entry already removed from the index
    async fn retire(&self, slot: &Slot, reason: &str) -> Result<(), DeadLetterError> {
        self.append_audit(&slot.entry, reason).await?;
        match fs::remove_file(self.entry_path(&slot.entry.id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a failed batch for later retry
    pub async fn enqueue(
        &self,
        readings: Vec<ProcessedReading>,
        error: &str,
    ) -> Result<Uuid, DeadLetterError> {
        if readings.is_empty() {
            return Err(DeadLetterError::EmptyBatch);
        }

        let now = Utc::now();
        let entry = DeadLetterEntry {
            id: Uuid::new_v4(),
            readings,
            first_failed_at: now,
            retry_count: 0,
            next_retry_at: after(now, self.backoff.initial_delay),
            last_error: error.to_string(),
            abandoned: false,
        };

        let mut index = self.index.lock().await;
        let bytes = self.persist(&entry).await?;
        let id = entry.id;
        warn!(
            "Dead-lettered {} readings as {}: {}",
            entry.readings.len(),
            id,
            error
        );
        index.total_bytes += bytes;
        index.slots.insert(id, Slot { entry, bytes });
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);

        self.enforce_capacity(&mut index).await?;
        Ok(id)
    }

    async fn enforce_capacity(&self, index: &mut Index) -> Result<(), DeadLetterError> {
        while index.slots.len() > self.config.max_entries
            || index.total_bytes > self.config.max_bytes
        {
            let Some(victim) = index.eviction_candidate() else {
                break;
            };
            let Some(slot) = index.remove(&victim) else {
                break;
            };
            error!(
                "Dead-letter queue full ({} entries, {} bytes), evicting {} with {} readings after {} retries",
                index.slots.len() + 1,
                index.total_bytes + slot.bytes,
                victim,
                slot.entry.readings.len(),
                slot.entry.retry_count
            );
            self.retire(&slot, "evicted: dead-letter capacity exceeded").await?;
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Claim every entry due at `now`, oldest schedule first
    ///
    /// Claimed entries stay in flight until acked, rescheduled or abandoned.
    pub async fn drain_due(&self, now: DateTime<Utc>) -> Vec<DeadLetterEntry> {
        let mut index = self.index.lock().await;
        let mut due: Vec<DeadLetterEntry> = index
            .slots
            .values()
            .filter(|s| s.entry.next_retry_at <= now && !index.in_flight.contains(&s.entry.id))
            .map(|s| s.entry.clone())
            .collect();
        due.sort_by_key(|e| e.next_retry_at);
        for entry in &due {
            index.in_flight.insert(entry.id);
        }
        due
    }

    /// Entry was written successfully
    pub async fn ack(&self, id: Uuid) -> Result<(), DeadLetterError> {
        let mut index = self.index.lock().await;
        let slot = index.remove(&id).ok_or(DeadLetterError::NotFound(id))?;
        match fs::remove_file(self.entry_path(&id)).await {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        info!(
            "Dead-letter entry {} delivered after {} retries ({} readings)",
            id,
            slot.entry.retry_count + 1,
            slot.entry.readings.len()
        );
        Ok(())
    }

    /// Retry failed: reschedule with backoff, or abandon when out of attempts
    pub async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        retryable: bool,
    ) -> Result<RetryDisposition, DeadLetterError> {
        let mut guard = self.index.lock().await;
        let index = &mut *guard;
        let slot = index.slots.get_mut(&id).ok_or(DeadLetterError::NotFound(id))?;
        slot.entry.retry_count += 1;
        slot.entry.last_error = error.to_string();

        let reason = if !retryable {
            Some(format!("non-retryable storage error: {}", error))
        } else if slot.entry.retry_count >= self.config.max_retry_attempts {
            Some(format!(
                "retry limit of {} reached: {}",
                self.config.max_retry_attempts, error
            ))
        } else {
            None
        };

        if let Some(reason) = reason {
            if let Some(slot) = index.remove(&id) {
                self.abandon_slot(slot, &reason).await?;
            }
            return Ok(RetryDisposition::Abandoned);
        }

        let next_retry_at = after(Utc::now(), self.backoff.delay_for(slot.entry.retry_count));
        slot.entry.next_retry_at = next_retry_at;
        let entry = slot.entry.clone();
        let bytes = self.persist(&entry).await?;
        if let Some(slot) = index.slots.get_mut(&id) {
            let old = std::mem::replace(&mut slot.bytes, bytes);
            index.total_bytes = index.total_bytes.saturating_sub(old) + bytes;
        }
        index.in_flight.remove(&id);
        debug!(
            "Dead-letter entry {} retry {} failed, next attempt at {}",
            id, entry.retry_count, next_retry_at
        );
        Ok(RetryDisposition::Rescheduled { next_retry_at })
    }

    /// Give up on an entry, recording it in the audit log
    pub async fn abandon(&self, id: Uuid, reason: &str) -> Result<(), DeadLetterError> {
        let mut index = self.index.lock().await;
        let slot = index.remove(&id).ok_or(DeadLetterError::NotFound(id))?;
        self.abandon_slot(slot, reason).await
    }

    async fn abandon_slot(&self, slot: Slot, reason: &str) -> Result<(), DeadLetterError> {
        error!(
            "Abandoning dead-letter entry {} ({} readings, first failed {}): {}",
            slot.entry.id,
            slot.entry.readings.len(),
            slot.entry.first_failed_at,
            reason
        );
        self.retire(&slot, reason).await?;
        self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Retry every due entry once through `sink`
    pub async fn retry_due(&self, sink: &dyn ReadingSink) -> RetryReport {
        let mut report = RetryReport::default();
        for entry in self.drain_due(Utc::now()).await {
            report.attempted += 1;

            let result = match timeout(self.write_timeout, sink.write_batch(&entry.readings)).await {
                Ok(result) => result,
                Err(_) => Err(crate::storage::StorageError::Timeout(self.write_timeout)),
            };

            let outcome = match result {
                Ok(()) => self.ack(entry.id).await.map(|()| None),
                Err(e) => self
                    .record_failure(entry.id, &e.to_string(), e.is_retryable())
                    .await
                    .map(Some),
            };

            match outcome {
                Ok(None) => report.succeeded += 1,
                Ok(Some(RetryDisposition::Rescheduled { .. })) => report.rescheduled += 1,
                Ok(Some(RetryDisposition::Abandoned)) => report.abandoned += 1,
                Err(e) => {
                    error!("Dead-letter bookkeeping failed for {}: {}", entry.id, e);
                    self.index.lock().await.in_flight.remove(&entry.id);
                },
            }
        }
        report
    }

    /// Retry due entries every `scan_interval_ms` until cancelled
    pub async fn run_retry_loop(self: Arc<Self>, sink: Arc<dyn ReadingSink>, cancel: CancellationToken) {
        let mut ticker = interval(Duration::from_millis(self.config.scan_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Dead-letter retry loop started (scan every {}ms, sink {})",
            self.config.scan_interval_ms,
            sink.name()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.retry_due(sink.as_ref()).await;
                    if report.attempted > 0 {
                        debug!(
                            "Dead-letter retry pass: {} attempted, {} delivered, {} rescheduled, {} abandoned",
                            report.attempted, report.succeeded, report.rescheduled, report.abandoned
                        );
                    }
                }
            }
        }

        let stats = self.stats().await;
        info!(
            "Dead-letter retry loop stopped, {} entries pending",
            stats.pending
        );
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.lock().await.slots.is_empty()
    }

    pub async fn stats(&self) -> DeadLetterStats {
        let index = self.index.lock().await;
        DeadLetterStats {
            pending: index.slots.len(),
            in_flight: index.in_flight.len(),
            pending_bytes: index.total_bytes,
            enqueued_total: self.counters.enqueued.load(Ordering::Relaxed),
            delivered_total: self.counters.delivered.load(Ordering::Relaxed),
            abandoned_total: self.counters.abandoned.load(Ordering::Relaxed),
            evicted_total: self.counters.evicted.load(Ordering::Relaxed),
        }
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay).map_or(now, |d| now + d)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::pipeline::Quality;
    use crate::storage::memory::FailureMode;
    use crate::storage::MemoryStore;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> DeadLetterConfig {
        DeadLetterConfig {
            path: dir.path().join("dlq"),
            max_retry_attempts: 3,
            retry_initial_ms: 0,
            retry_max_ms: 0,
            scan_interval_ms: 10,
            ..DeadLetterConfig::default()
        }
    }

    fn readings(n: usize) -> Vec<ProcessedReading> {
        (0..n)
            .map(|i| ProcessedReading {
                timestamp: Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap(),
                device_id: "adam-01".to_string(),
                channel: 0,
                raw_value: i as u64,
                processed_value: i as f64,
                rate: 0.0,
                quality: Quality::Good,
                unit: "counts".to_string(),
            })
            .collect()
    }

    fn later() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::hours(1)
    }

    fn audit_lines(dir: &TempDir) -> Vec<serde_json::Value> {
        let path = dir.path().join("dlq").join(AUDIT_FILE);
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_entries_survive_restart() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = DeadLetterStore::open(config(&dir)).await.unwrap();
            store.enqueue(readings(3), "db down").await.unwrap()
        };

        let store = DeadLetterStore::open(config(&dir)).await.unwrap();
        let due = store.drain_due(later()).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);
        assert_eq!(due[0].readings, readings(3));
        assert_eq!(due[0].last_error, "db down");

        store.ack(id).await.unwrap();
        assert!(store.is_empty().await);

        let reopened = DeadLetterStore::open(config(&dir)).await.unwrap();
        assert!(reopened.is_empty().await);
    }

    #[tokio::test]
    async fn test_drain_marks_in_flight() {
        let dir = TempDir::new().unwrap();
        let store = DeadLetterStore::open(config(&dir)).await.unwrap();
        store.enqueue(readings(1), "err").await.unwrap();

        assert_eq!(store.drain_due(later()).await.len(), 1);
        assert!(store.drain_due(later()).await.is_empty());
        assert_eq!(store.stats().await.in_flight, 1);
    }

    #[tokio::test]
    async fn test_not_yet_due_entries_stay() {
        let dir = TempDir::new().unwrap();
        let store = DeadLetterStore::open(DeadLetterConfig {
            retry_initial_ms: 60_000,
            ..config(&dir)
        })
        .await
        .unwrap();
        store.enqueue(readings(1), "err").await.unwrap();
        assert!(store.drain_due(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn test_abandon_after_max_attempts() {
        let dir = TempDir::new().unwrap();
        let store = DeadLetterStore::open(config(&dir)).await.unwrap();
        let sink = MemoryStore::new();
        sink.set_failing(true);
        store.enqueue(readings(2), "db down").await.unwrap();

        let mut abandoned = 0;
        for _ in 0..3 {
            let report = store.retry_due(&sink).await;
            assert_eq!(report.attempted, 1);
            abandoned += report.abandoned;
        }
        assert_eq!(abandoned, 1);
        assert!(store.is_empty().await);

        let audit = audit_lines(&dir);
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0]["entry"]["retry_count"], 3);
        assert_eq!(audit[0]["entry"]["abandoned"], true);
        assert!(audit[0]["reason"].as_str().unwrap().contains("retry limit"));
        assert_eq!(audit[0]["entry"]["readings"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_abandons_immediately() {
        let dir = TempDir::new().unwrap();
        let store = DeadLetterStore::open(config(&dir)).await.unwrap();
        let sink = MemoryStore::new();
        sink.set_failure_mode(FailureMode::Reject);
        store.enqueue(readings(1), "bad data").await.unwrap();

        let report = store.retry_due(&sink).await;
        assert_eq!(report.abandoned, 1);
        assert!(store.is_empty().await);
        assert!(audit_lines(&dir)[0]["reason"]
            .as_str()
            .unwrap()
            .contains("non-retryable"));
    }

    #[tokio::test]
    async fn test_retry_delivers_when_sink_recovers() {
        let dir = TempDir::new().unwrap();
        let store = DeadLetterStore::open(config(&dir)).await.unwrap();
        let sink = MemoryStore::new();
        sink.set_failing(true);
        store.enqueue(readings(4), "db down").await.unwrap();

        assert_eq!(store.retry_due(&sink).await.rescheduled, 1);
        sink.set_failing(false);
        assert_eq!(store.retry_due(&sink).await.succeeded, 1);

        assert_eq!(sink.len(), 4);
        assert!(store.is_empty().await);
        assert!(audit_lines(&dir).is_empty());
        assert_eq!(store.stats().await.delivered_total, 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_most_retried_first() {
        let dir = TempDir::new().unwrap();
        let store = DeadLetterStore::open(DeadLetterConfig {
            max_entries: 2,
            max_retry_attempts: 10,
            ..config(&dir)
        })
        .await
        .unwrap();

        let first = store.enqueue(readings(1), "a").await.unwrap();
        let second = store.enqueue(readings(1), "b").await.unwrap();
        store.record_failure(second, "still down", true).await.unwrap();
        store.record_failure(second, "still down", true).await.unwrap();

        let third = store.enqueue(readings(1), "c").await.unwrap();
        assert_eq!(store.len().await, 2);

        let audit = audit_lines(&dir);
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0]["entry"]["id"], second.to_string());
        assert!(audit[0]["reason"].as_str().unwrap().contains("capacity"));

        let remaining: HashSet<_> = store.drain_due(later()).await.into_iter().map(|e| e.id).collect();
        assert_eq!(remaining, HashSet::from([first, third]));
        assert_eq!(store.stats().await.evicted_total, 1);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let pending = dir.path().join("dlq").join(PENDING_DIR);
        std::fs::create_dir_all(&pending).unwrap();
        std::fs::write(pending.join("broken.json"), b"{not json").unwrap();
        std::fs::write(pending.join("partial.json.tmp"), b"{").unwrap();

        let store = DeadLetterStore::open(config(&dir)).await.unwrap();
        assert!(store.is_empty().await);
        assert!(pending.join("broken.corrupt").exists());
        assert!(!pending.join("partial.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let dir = TempDir::new().unwrap();
        let store = DeadLetterStore::open(config(&dir)).await.unwrap();
        assert!(matches!(
            store.enqueue(Vec::new(), "x").await,
            Err(DeadLetterError::EmptyBatch)
        ));
    }
}
