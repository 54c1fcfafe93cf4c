//! In-process store
//!
//! Keeps readings keyed by `(timestamp, device, channel)` so duplicate
//! deliveries overwrite like the persistent backends do. Writes can be made
//! to fail on demand, which the reliability tests rely on.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ReadingFilter, ReadingQuery, ReadingSink, StorageError};
use crate::pipeline::ProcessedReading;

type Key = (i64, String, u16);

/// How writes currently behave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    None,
    /// Fail with a retryable error
    Unavailable,
    /// Fail with a non-retryable error
    Reject,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    readings: RwLock<BTreeMap<Key, ProcessedReading>>,
    failure: AtomicU8,
    write_calls: AtomicU64,
    failed_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failure_mode(&self, mode: FailureMode) {
        let value = match mode {
            FailureMode::None => 0,
            FailureMode::Unavailable => 1,
            FailureMode::Reject => 2,
        };
        self.failure.store(value, Ordering::SeqCst);
    }

    /// Shorthand for toggling retryable failures
    pub fn set_failing(&self, failing: bool) {
        self.set_failure_mode(if failing {
            FailureMode::Unavailable
        } else {
            FailureMode::None
        });
    }

    pub fn failure_mode(&self) -> FailureMode {
        match self.failure.load(Ordering::SeqCst) {
            1 => FailureMode::Unavailable,
            2 => FailureMode::Reject,
            _ => FailureMode::None,
        }
    }

    /// Distinct stored readings
    pub fn len(&self) -> usize {
        self.readings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.read().is_empty()
    }

    /// All stored readings ordered by timestamp
    pub fn readings(&self) -> Vec<ProcessedReading> {
        self.readings.read().values().cloned().collect()
    }

    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn failed_calls(&self) -> u64 {
        self.failed_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadingSink for MemoryStore {
    async fn write_batch(&self, readings: &[ProcessedReading]) -> Result<(), StorageError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        match self.failure_mode() {
            FailureMode::None => {},
            FailureMode::Unavailable => {
                self.failed_calls.fetch_add(1, Ordering::SeqCst);
                return Err(StorageError::Unavailable("memory store offline".to_string()));
            },
            FailureMode::Reject => {
                self.failed_calls.fetch_add(1, Ordering::SeqCst);
                return Err(StorageError::Rejected("memory store rejects writes".to_string()));
            },
        }

        let mut stored = self.readings.write();
        for reading in readings {
            let key = (
                reading.timestamp.timestamp_millis(),
                reading.device_id.clone(),
                reading.channel,
            );
            stored.insert(key, reading.clone());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[async_trait]
impl ReadingQuery for MemoryStore {
    async fn query(&self, filter: &ReadingFilter) -> Result<Vec<ProcessedReading>, StorageError> {
        let stored = self.readings.read();
        let matching = stored.values().filter(|r| filter.matches(r)).cloned();
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn recent(
        &self,
        device_id: &str,
        channel: u16,
        limit: usize,
    ) -> Result<Vec<ProcessedReading>, StorageError> {
        let stored = self.readings.read();
        Ok(stored
            .values()
            .rev()
            .filter(|r| r.device_id == device_id && r.channel == channel)
            .take(limit)
            .cloned()
            .collect())
    }
}
