//! Readings survive a storage outage and a process restart

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod common;

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use cntsrv::config::{BatchConfig, DeadLetterConfig, SqliteConfig};
use cntsrv::pipeline::{ProcessedReading, Quality};
use cntsrv::reliability::{BatchWriter, DeadLetterStore, FlushOutcome};
use cntsrv::storage::{ReadingFilter, ReadingQuery, SqliteStore};
use tempfile::TempDir;

fn reading(channel: u16, i: u64) -> ProcessedReading {
    ProcessedReading {
        timestamp: Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap(),
        device_id: "adam-01".to_string(),
        channel,
        raw_value: i * 10,
        processed_value: i as f64,
        rate: 10.0,
        quality: Quality::Good,
        unit: "m3".to_string(),
    }
}

fn dead_letter_config(dir: &TempDir) -> DeadLetterConfig {
    DeadLetterConfig {
        path: dir.path().join("dlq"),
        retry_initial_ms: 0,
        retry_max_ms: 0,
        ..DeadLetterConfig::default()
    }
}

#[tokio::test]
async fn test_dead_letters_reach_sqlite_after_restart() {
    let dir = TempDir::new().unwrap();

    // First run: storage is down, every batch is dead-lettered to disk
    {
        let outage = common::sink();
        outage.set_failing(true);
        let dead_letter = Arc::new(DeadLetterStore::open(dead_letter_config(&dir)).await.unwrap());
        let writer = BatchWriter::new(
            BatchConfig {
                batch_size: 4,
                batch_timeout_ms: 100,
                write_timeout_ms: 500,
                max_buffered: 100,
            },
            outage.clone(),
            dead_letter.clone(),
        );

        for i in 0..10 {
            writer.add(reading((i % 2) as u16, i)).await;
        }
        let mut dead_lettered = 0;
        while writer.buffered().await > 0 {
            match writer.flush().await.unwrap() {
                FlushOutcome::DeadLettered(n) => dead_lettered += n,
                other => panic!("unexpected flush outcome {other:?}"),
            }
        }
        assert_eq!(dead_lettered, 10);
        assert_eq!(dead_letter.len().await, 3);
        assert!(outage.is_empty());
    }

    // Second run: entries are reloaded and delivered to a working backend
    let dead_letter = DeadLetterStore::open(dead_letter_config(&dir)).await.unwrap();
    assert_eq!(dead_letter.len().await, 3);

    let store = SqliteStore::open(&SqliteConfig {
        path: dir.path().join("readings.db"),
        max_connections: 2,
    })
    .await
    .unwrap();

    let report = dead_letter.retry_due(&store).await;
    assert_eq!(report.attempted, 3);
    assert_eq!(report.succeeded, 3);
    assert!(dead_letter.is_empty().await);
    assert_eq!(store.count().await.unwrap(), 10);

    let channel_one = store
        .query(&ReadingFilter::default().device("adam-01").channel(1))
        .await
        .unwrap();
    let raw: Vec<u64> = channel_one.iter().map(|r| r.raw_value).collect();
    assert_eq!(raw, vec![10, 30, 50, 70, 90]);
    assert!(channel_one.iter().all(|r| r.unit == "m3" && r.quality == Quality::Good));

    // Nothing is left on disk for a third run
    drop(dead_letter);
    let reopened = DeadLetterStore::open(dead_letter_config(&dir)).await.unwrap();
    assert!(reopened.is_empty().await);
}

#[tokio::test]
async fn test_rejected_batches_are_audited_not_retried() {
    let dir = TempDir::new().unwrap();
    let rejecting = common::sink();
    rejecting.set_failure_mode(cntsrv::storage::memory::FailureMode::Reject);

    let dead_letter = DeadLetterStore::open(dead_letter_config(&dir)).await.unwrap();
    dead_letter
        .enqueue(vec![reading(0, 1), reading(0, 2)], "write timed out")
        .await
        .unwrap();

    let report = dead_letter.retry_due(rejecting.as_ref()).await;
    assert_eq!(report.abandoned, 1);
    assert!(dead_letter.is_empty().await);
    assert_eq!(dead_letter.stats().await.abandoned_total, 1);

    let audit = std::fs::read_to_string(dir.path().join("dlq/abandoned.jsonl")).unwrap();
    let line: serde_json::Value = serde_json::from_str(audit.lines().next().unwrap()).unwrap();
    assert_eq!(line["entry"]["readings"].as_array().unwrap().len(), 2);
}
