//! End-to-end acquisition against the simulator

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod common;

use std::time::Duration;

use cntsrv::pipeline::Quality;
use cntsrv::protocol::{RegisterWidth, WordOrder};
use cntsrv::runtime::Collector;
use common::{channel_readings, device_yaml, eventually, fast_config, open_dead_letter, sink, CounterSimulator};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const CHANNELS: &str = "      - { channel: 0, address: 0, width: 32, unit: pulses }\n      - { channel: 1, address: 2, width: 32, scale: 0.5, unit: litres }\n";

#[tokio::test]
async fn test_counts_flow_from_device_to_storage() {
    let sim = CounterSimulator::start().await.unwrap();
    sim.set_counter(0, RegisterWidth::Bits32, WordOrder::HighFirst, 70_000);
    sim.set_counter(2, RegisterWidth::Bits32, WordOrder::HighFirst, 10);

    let dir = TempDir::new().unwrap();
    let config = fast_config(&device_yaml("adam-01", &sim, CHANNELS), &dir).unwrap();
    let store = sink();
    let collector = Collector::new(config.clone(), store.clone(), open_dead_letter(&config).await.unwrap());
    let registry = collector.registry();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(collector.run(cancel.clone()));

    assert!(eventually(Duration::from_secs(2), || channel_readings(&store, "adam-01", 1).len() >= 2).await);
    sim.set_counter(0, RegisterWidth::Bits32, WordOrder::HighFirst, 70_100);
    sim.set_counter(2, RegisterWidth::Bits32, WordOrder::HighFirst, 30);
    assert!(
        eventually(Duration::from_secs(2), || {
            channel_readings(&store, "adam-01", 1)
                .last()
                .is_some_and(|r| r.raw_value == 30)
        })
        .await
    );

    let status = registry.get("adam-01").unwrap();
    assert!(!status.offline);
    assert!(status.last_success.is_some());

    cancel.cancel();
    let report = task.await.unwrap();

    let pulses = channel_readings(&store, "adam-01", 0);
    let litres = channel_readings(&store, "adam-01", 1);
    assert!(pulses.iter().all(|r| r.quality == Quality::Good && r.unit == "pulses"));
    assert!(litres.iter().all(|r| r.quality == Quality::Good && r.unit == "litres"));
    assert_eq!(litres.last().unwrap().processed_value, 15.0);
    assert!(pulses.iter().any(|r| r.rate > 0.0));
    assert!(pulses.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    // Everything polled was persisted by the final flush
    assert_eq!(report.batch.buffered, 0);
    assert_eq!(report.total_readings() as usize, store.len());
    assert_eq!(report.devices.len(), 1);
    assert!(report.devices[0].polls >= 2);
}

#[tokio::test]
async fn test_16_bit_wrap_is_corrected_end_to_end() {
    let sim = CounterSimulator::start().await.unwrap();
    sim.set_register(0, 65_530);

    let dir = TempDir::new().unwrap();
    let channels = "      - { channel: 0, address: 0, width: 16 }\n";
    let config = fast_config(&device_yaml("adam-01", &sim, channels), &dir).unwrap();
    let store = sink();
    let collector = Collector::new(config.clone(), store.clone(), open_dead_letter(&config).await.unwrap());

    let cancel = CancellationToken::new();
    let task = tokio::spawn(collector.run(cancel.clone()));

    assert!(eventually(Duration::from_secs(2), || !channel_readings(&store, "adam-01", 0).is_empty()).await);
    sim.set_register(0, 10);
    assert!(
        eventually(Duration::from_secs(2), || {
            channel_readings(&store, "adam-01", 0)
                .iter()
                .any(|r| r.raw_value == 10)
        })
        .await
    );
    cancel.cancel();
    task.await.unwrap();

    let readings = channel_readings(&store, "adam-01", 0);
    let wrapped = readings.iter().find(|r| r.raw_value == 10).unwrap();
    assert_eq!(wrapped.processed_value, 65_546.0);
    assert_eq!(wrapped.quality, Quality::Good);
    assert!(readings
        .windows(2)
        .all(|w| w[0].processed_value <= w[1].processed_value));
}

#[tokio::test]
async fn test_storage_outage_loses_nothing() {
    let sim = CounterSimulator::start().await.unwrap();
    sim.set_register(0, 1);

    let dir = TempDir::new().unwrap();
    let channels = "      - { channel: 0, address: 0, width: 16 }\n";
    let config = fast_config(&device_yaml("adam-01", &sim, channels), &dir).unwrap();
    let store = sink();
    store.set_failing(true);
    let dead_letter = open_dead_letter(&config).await.unwrap();
    let collector = Collector::new(config.clone(), store.clone(), dead_letter.clone());

    let cancel = CancellationToken::new();
    let task = tokio::spawn(collector.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(store.is_empty());
    assert!(!dead_letter.is_empty().await);

    store.set_failing(false);
    let drained = eventually(Duration::from_secs(3), || store.len() > 0).await;
    assert!(drained);

    cancel.cancel();
    let report = task.await.unwrap();

    // Whatever is still queued is on disk; retry it to completion
    while !dead_letter.is_empty().await {
        dead_letter.retry_due(store.as_ref()).await;
    }
    assert_eq!(store.len() as u64, report.total_readings());
    assert_eq!(report.dead_letter.abandoned_total, 0);
}
