//! Shared helpers for the integration tests

#![allow(dead_code)]

pub mod simulator;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cntsrv::config::AppConfig;
use cntsrv::pipeline::ProcessedReading;
use cntsrv::reliability::DeadLetterStore;
use cntsrv::storage::MemoryStore;
use tempfile::TempDir;

pub use simulator::CounterSimulator;

/// One device entry pointing at a simulator
pub fn device_yaml(id: &str, sim: &CounterSimulator, channels: &str) -> String {
    format!(
        r#"
  - id: {id}
    name: "{id} module"
    location: test bench
    host: "{host}"
    port: {port}
    channels:
{channels}"#,
        host = sim.host(),
        port = sim.port(),
    )
}

/// Fast-polling configuration around the given `devices:` entries
pub fn fast_config(devices: &str, dlq_dir: &TempDir) -> Result<AppConfig> {
    let yaml = format!(
        r#"
defaults:
  poll_interval_ms: 50
  timeout_ms: 100
  max_retries: 1
  retry_delay_ms: 10
  min_reconnect_interval_ms: 0
  reconnect_initial_ms: 50
  reconnect_max_ms: 200
  offline_after_failures: 3
  rate_window_secs: 10
batch:
  batch_size: 4
  batch_timeout_ms: 100
  write_timeout_ms: 500
dead_letter:
  path: "{dlq}"
  max_retry_attempts: 1000
  retry_initial_ms: 0
  retry_max_ms: 0
  scan_interval_ms: 20
storage:
  backend: memory
devices:{devices}
"#,
        dlq = dlq_dir.path().join("dlq").display(),
    );
    Ok(AppConfig::from_yaml_str(&yaml)?)
}

pub async fn open_dead_letter(config: &AppConfig) -> Result<Arc<DeadLetterStore>> {
    Ok(Arc::new(DeadLetterStore::open(config.dead_letter.clone()).await?))
}

pub fn sink() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

/// Readings of one device channel, oldest first
pub fn channel_readings(store: &MemoryStore, device: &str, channel: u16) -> Vec<ProcessedReading> {
    store
        .readings()
        .into_iter()
        .filter(|r| r.device_id == device && r.channel == channel)
        .collect()
}

/// Poll `check` until it holds or `limit` passes
pub async fn eventually<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
