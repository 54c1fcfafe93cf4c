//! Read-only health surface
//!
//! Device links publish [`DeviceHealth`] on a `watch` channel; the registry
//! only holds the receivers. The reporter logs a summary on an interval and
//! can mirror the snapshot into a JSON file for external pollers.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::link::{DeviceHealth, LinkState};
use crate::reliability::{BatchStats, BatchWriter, DeadLetterStats, DeadLetterStore};

/// Point-in-time view of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub endpoint: String,
    pub state: LinkState,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub seconds_since_last_read: Option<f64>,
    pub last_error: Option<String>,
    pub offline: bool,
    pub total_reads: u64,
    pub failed_reads: u64,
    pub reconnects: u64,
    pub connect_attempts: u64,
    pub failed_connects: u64,
}

impl DeviceStatus {
    pub fn from_health(health: &DeviceHealth, now: DateTime<Utc>) -> Self {
        Self {
            device_id: health.device_id.clone(),
            endpoint: health.endpoint.clone(),
            state: health.state,
            consecutive_failures: health.consecutive_failures,
            last_success: health.last_success,
            seconds_since_last_read: health.seconds_since_last_read(now),
            last_error: health.last_error.clone(),
            offline: health.offline,
            total_reads: health.total_reads,
            failed_reads: health.failed_reads,
            reconnects: health.reconnects,
            connect_attempts: health.connect_attempts,
            failed_connects: health.failed_connects,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
}

#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    devices: Arc<RwLock<BTreeMap<String, watch::Receiver<DeviceHealth>>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a device; re-registering replaces the previous receiver
    pub fn register(&self, device_id: impl Into<String>, health: watch::Receiver<DeviceHealth>) {
        self.devices.write().insert(device_id.into(), health);
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceStatus> {
        let devices = self.devices.read();
        let rx = devices.get(device_id)?;
        let status = DeviceStatus::from_health(&rx.borrow(), Utc::now());
        Some(status)
    }

    /// Every registered device, ordered by id
    pub fn snapshot(&self) -> Vec<DeviceStatus> {
        let now = Utc::now();
        self.devices
            .read()
            .values()
            .map(|rx| DeviceStatus::from_health(&rx.borrow(), now))
            .collect()
    }

    pub fn summary(&self) -> HealthSummary {
        let snapshot = self.snapshot();
        let offline = snapshot.iter().filter(|s| s.offline).count();
        HealthSummary {
            total: snapshot.len(),
            online: snapshot.len() - offline,
            offline,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

/// Contents of the status file
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub devices: Vec<DeviceStatus>,
    pub batch: BatchStats,
    pub dead_letter: DeadLetterStats,
}

/// Write `report` to `path` through a temporary file and rename
pub async fn write_status_file(path: &Path, report: &StatusReport) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let data = serde_json::to_vec_pretty(report)?;
    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&data).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await
}

/// Periodic health summary until cancelled
pub async fn run_reporter(
    registry: HealthRegistry,
    config: HealthConfig,
    writer: Arc<BatchWriter>,
    dead_letter: Arc<DeadLetterStore>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(Duration::from_millis(config.report_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so the first report has data
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = StatusReport {
                    generated_at: Utc::now(),
                    devices: registry.snapshot(),
                    batch: writer.stats().await,
                    dead_letter: dead_letter.stats().await,
                };
                log_report(&report);

                if let Some(path) = &config.status_file {
                    match write_status_file(path, &report).await {
                        Ok(()) => debug!("Status written to {}", path.display()),
                        Err(e) => warn!("Failed to write status file {}: {}", path.display(), e),
                    }
                }
            }
        }
    }
    debug!("Health reporter stopped");
}

fn log_report(report: &StatusReport) {
    let offline: Vec<&str> = report
        .devices
        .iter()
        .filter(|d| d.offline)
        .map(|d| d.device_id.as_str())
        .collect();

    info!(
        "Health: {}/{} devices online, {} readings written, {} buffered, {} dead-letter entries pending",
        report.devices.len() - offline.len(),
        report.devices.len(),
        report.batch.written,
        report.batch.buffered,
        report.dead_letter.pending
    );
    for device in report.devices.iter().filter(|d| d.offline) {
        warn!(
            "Device {} offline: {} consecutive failures, last error: {}",
            device.device_id,
            device.consecutive_failures,
            device.last_error.as_deref().unwrap_or("-")
        );
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn health(id: &str, offline: bool) -> DeviceHealth {
        let mut health = DeviceHealth::new(id, "127.0.0.1:502");
        health.offline = offline;
        if offline {
            health.consecutive_failures = 5;
            health.last_error = Some("connection refused".to_string());
        } else {
            health.state = LinkState::Connected;
            health.last_success = Some(Utc::now());
        }
        health
    }

    #[test]
    fn test_snapshot_follows_watch_updates() {
        let registry = HealthRegistry::new();
        let (tx_b, rx_b) = watch::channel(health("b", false));
        let (_tx_a, rx_a) = watch::channel(health("a", true));
        registry.register("b", rx_b);
        registry.register("a", rx_a);

        let ids: Vec<_> = registry.snapshot().into_iter().map(|s| s.device_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(
            registry.summary(),
            HealthSummary {
                total: 2,
                online: 1,
                offline: 1
            }
        );

        tx_b.send_replace(health("b", true));
        assert!(registry.get("b").unwrap().offline);
        assert_eq!(registry.summary().offline, 2);
    }

    #[test]
    fn test_status_carries_seconds_since_last_read() {
        let registry = HealthRegistry::new();
        let (_tx, rx) = watch::channel(health("a", false));
        registry.register("a", rx);
        let status = registry.get("a").unwrap();
        assert!(status.seconds_since_last_read.unwrap() < 5.0);
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_status_file_written_atomically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status/cntsrv.json");
        let report = StatusReport {
            generated_at: Utc::now(),
            devices: vec![DeviceStatus::from_health(&health("a", true), Utc::now())],
            batch: BatchStats::default(),
            dead_letter: DeadLetterStats::default(),
        };
        write_status_file(&path, &report).await.unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["devices"][0]["device_id"], "a");
        assert_eq!(value["devices"][0]["offline"], true);
        assert!(!path.with_extension("tmp").exists());
    }
}
