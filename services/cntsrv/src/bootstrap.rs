//! Process bootstrap
//!
//! Argument parsing, logging setup and the three run modes: `--validate`,
//! `--test` (one read of every channel) and the long-running service.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use common::service_bootstrap::{parse_log_level, ServiceInfo};
use errors::{CounterError, CounterResult};

use crate::config::AppConfig;
use crate::pipeline::Quality;
use crate::reliability::DeadLetterStore;
use crate::runtime::{Collector, DevicePoller};
use crate::storage;

/// Command-line arguments for cntsrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "cntsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Modbus-TCP counter acquisition service",
    long_about = None
)]
pub struct Args {
    /// Configuration file (falls back to $CNTSRV_CONFIG, then config/cntsrv.yaml)
    #[arg(short = 'c', long, env = "CNTSRV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides logging.level
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - load and validate the configuration, then exit
    #[arg(long)]
    pub validate: bool,

    /// Test mode - read every channel of every device once, then exit
    #[arg(long)]
    pub test: bool,
}

pub fn service_info() -> ServiceInfo {
    ServiceInfo::new(
        "cntsrv",
        env!("CARGO_PKG_VERSION"),
        "Modbus-TCP counter acquisition with windowed rates and durable writes",
    )
}

/// Initialize logging from the arguments and the loaded configuration
///
/// Log root priority: `CNTSRV_LOG_DIR` > `logging.dir` > `logs`.
pub fn initialize_logging(args: &Args, info: &ServiceInfo, config: &AppConfig) -> CounterResult<()> {
    let dir = config.logging.dir.to_string_lossy();
    common::logging::init_log_root(Some(dir.as_ref()));

    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    let console_level = parse_log_level(level);

    let log_config = common::logging::LogConfig {
        service_name: info.name.clone(),
        log_dir: common::logging::get_log_root().join(&info.name),
        console_level,
        file_level: console_level.max(tracing::Level::DEBUG),
        enable_json: config.logging.json,
        ansi: !args.no_color,
        max_log_days: config.logging.max_log_days,
        ..common::logging::LogConfig::default()
    };
    common::logging::init_with_config(log_config)
}

/// Load and validate, logging a summary of what was found
pub fn validate_configuration(config: &AppConfig) -> CounterResult<()> {
    config.validate()?;

    info!("Service: {}", config.service.name);
    info!("Storage backend: {}", config.storage.backend_name());
    info!("Found {} device(s)", config.devices.len());
    for device in &config.devices {
        let settings = config.device_settings(device);
        info!(
            "  Device {} ({}) at {}: {} channel(s), poll {:?}{}",
            device.id,
            device.display_name(),
            device.endpoint(),
            device.channels.len(),
            settings.poll_interval,
            if device.block_read { ", block read" } else { "" }
        );
    }

    let rendered = serde_yaml::to_string(config)?;
    info!("Effective configuration:\n{}", rendered);
    Ok(())
}

/// Read every channel once and print the readings as JSON lines
///
/// Fails when no channel of any device could be read.
pub async fn run_test(config: &AppConfig) -> CounterResult<()> {
    let cancel = CancellationToken::new();
    let mut total = 0usize;
    let mut good = 0usize;

    for device in &config.devices {
        let mut poller = DevicePoller::new(config, device);
        let readings = poller.poll_once(&cancel).await;
        for reading in &readings {
            total += 1;
            if reading.quality != Quality::Bad {
                good += 1;
            }
            println!("{}", serde_json::to_string(reading)?);
        }

        let health = poller.link().health();
        if let Some(err) = &health.last_error {
            warn!("Device {}: {}", device.id, err);
        }
    }

    info!("Test read: {}/{} channels readable", good, total);
    if good == 0 {
        return Err(CounterError::Device {
            device: "*".to_string(),
            message: "no channel could be read".to_string(),
        });
    }
    Ok(())
}

/// Run the service until SIGINT/SIGTERM
pub async fn run_service(config: AppConfig) -> CounterResult<()> {
    let storage = storage::open(&config).await?;
    let dead_letter = DeadLetterStore::open(config.dead_letter.clone())
        .await?
        .with_write_timeout(config.batch.write_timeout());
    let dead_letter = Arc::new(dead_letter);

    let pending = dead_letter.len().await;
    if pending > 0 {
        warn!("{} dead-letter entries pending from a previous run", pending);
    }

    let collector = Collector::new(config, storage.sink.clone(), dead_letter);
    let cancel = CancellationToken::new();
    let collector_task = tokio::spawn(collector.run(cancel.clone()));

    let signal = common::shutdown::wait_for_shutdown().await;
    info!("{} received, shutting down", signal);
    cancel.cancel();

    match collector_task.await {
        Ok(report) => {
            info!(
                "Shutdown complete: {} readings collected, {} dead-letter entries pending",
                report.total_readings(),
                report.dead_letter.pending
            );
            Ok(())
        },
        Err(e) => {
            error!("Collector task failed: {}", e);
            Err(CounterError::ShutdownError(e.to_string()))
        },
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "cntsrv",
            "--config",
            "/etc/cntsrv.yaml",
            "-l",
            "debug",
            "--validate",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/etc/cntsrv.yaml")));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.validate);
        assert!(!args.test);
        assert!(!args.no_color);
    }

    #[test]
    fn test_validate_rejects_empty_device_list() {
        let config = AppConfig::default();
        assert!(validate_configuration(&config).is_err());
    }
}
