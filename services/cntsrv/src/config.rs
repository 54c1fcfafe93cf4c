//! Service configuration
//!
//! Layered with figment: built-in defaults, then the YAML file, then
//! `CNTSRV_` environment variables (`__` separates nested keys, e.g.
//! `CNTSRV_BATCH__BATCH_SIZE=50`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use errors::{CounterError, CounterResult};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::protocol::{RegisterWidth, WordOrder, MAX_READ_REGISTERS};

pub const DEFAULT_CONFIG_PATH: &str = "config/cntsrv.yaml";
pub const CONFIG_PATH_ENV: &str = "CNTSRV_CONFIG";
pub const ENV_PREFIX: &str = "CNTSRV_";

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub defaults: DeviceDefaults,
    pub devices: Vec<DeviceConfig>,
    pub batch: BatchConfig,
    pub dead_letter: DeadLetterConfig,
    pub storage: StorageConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub description: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "cntsrv".to_string(),
            description: None,
        }
    }
}

/// Per-device settings applied when a device does not override them
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceDefaults {
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub min_reconnect_interval_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub keep_alive_ms: u64,
    pub offline_after_failures: u32,
    pub rate_window_secs: u64,
    /// Gap after which a reading's baseline counts as stale; 3x poll interval when unset
    pub stale_after_ms: Option<u64>,
}

impl Default for DeviceDefaults {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            timeout_ms: 3000,
            max_retries: 3,
            retry_delay_ms: 200,
            min_reconnect_interval_ms: 2000,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 30_000,
            keep_alive_ms: 30_000,
            offline_after_failures: 5,
            rate_window_secs: 60,
            stale_after_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default)]
    pub word_order: WordOrder,
    /// Read all channels with one request spanning their registers
    #[serde(default)]
    pub block_read: bool,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub offline_after_failures: Option<u32>,
    pub channels: Vec<ChannelConfig>,
}

fn default_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

impl DeviceConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Registers covered by a block read of every channel: (start, quantity)
    pub fn register_span(&self) -> Option<(u16, u16)> {
        register_span(&self.channels)
    }
}

/// Smallest register range covering all `channels`
pub fn register_span(channels: &[ChannelConfig]) -> Option<(u16, u16)> {
    let start = channels.iter().map(|c| c.address).min()?;
    let end = channels
        .iter()
        .map(|c| u32::from(c.address) + u32::from(c.width.register_count()))
        .max()?;
    let quantity = u16::try_from(end - u32::from(start)).ok()?;
    Some((start, quantity))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel: u16,
    /// First holding register of the counter
    pub address: u16,
    #[serde(default = "default_width")]
    pub width: RegisterWidth,
    #[serde(default)]
    pub rate_window_secs: Option<u64>,
    /// Counts per second above which a step is implausible
    #[serde(default)]
    pub max_change_rate: Option<f64>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default = "default_unit")]
    pub unit: String,
    /// Raw value that triggers the approaching-overflow warning; 95% of max when unset
    #[serde(default)]
    pub overflow_warning_threshold: Option<u64>,
}

fn default_width() -> RegisterWidth {
    RegisterWidth::Bits32
}

fn default_scale() -> f64 {
    1.0
}

fn default_unit() -> String {
    "counts".to_string()
}

impl ChannelConfig {
    pub fn overflow_threshold(&self) -> u64 {
        self.overflow_warning_threshold
            .unwrap_or_else(|| self.width.max_value() / 100 * 95)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Buffered readings above which the oldest spill to the dead-letter store
    pub max_buffered: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout_ms: 5000,
            write_timeout_ms: 10_000,
            max_buffered: 10_000,
        }
    }
}

impl BatchConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub path: PathBuf,
    pub max_retry_attempts: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub scan_interval_ms: u64,
    pub max_entries: usize,
    pub max_bytes: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/dead_letter"),
            max_retry_attempts: 10,
            retry_initial_ms: 1000,
            retry_max_ms: 30_000,
            scan_interval_ms: 1000,
            max_entries: 10_000,
            max_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    Sqlite(SqliteConfig),
    Influxdb(InfluxConfig),
    /// In-process store, useful for dry runs
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Sqlite(SqliteConfig::default())
    }
}

impl StorageConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Influxdb(_) => "influxdb",
            Self::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/counters.db"),
            max_connections: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    pub url: String,
    pub org: String,
    pub bucket: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_measurement")]
    pub measurement: String,
}

fn default_measurement() -> String {
    "counter_data".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub report_interval_ms: u64,
    /// Optional JSON status file rewritten on every report
    pub status_file: Option<PathBuf>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: 60_000,
            status_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: PathBuf,
    pub json: bool,
    pub max_log_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: PathBuf::from("logs"),
            json: false,
            max_log_days: 30,
        }
    }
}

/// Device settings with defaults applied
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub min_reconnect_interval: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub keep_alive: Duration,
    pub offline_after_failures: u32,
    pub stale_after: Duration,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        resolve(&DeviceDefaults::default(), None)
    }
}

fn resolve(defaults: &DeviceDefaults, device: Option<&DeviceConfig>) -> DeviceSettings {
    let poll_ms = device
        .and_then(|d| d.poll_interval_ms)
        .unwrap_or(defaults.poll_interval_ms);
    DeviceSettings {
        poll_interval: Duration::from_millis(poll_ms),
        timeout: Duration::from_millis(device.and_then(|d| d.timeout_ms).unwrap_or(defaults.timeout_ms)),
        max_retries: device.and_then(|d| d.max_retries).unwrap_or(defaults.max_retries),
        retry_delay: Duration::from_millis(defaults.retry_delay_ms),
        min_reconnect_interval: Duration::from_millis(defaults.min_reconnect_interval_ms),
        reconnect_initial: Duration::from_millis(defaults.reconnect_initial_ms),
        reconnect_max: Duration::from_millis(defaults.reconnect_max_ms),
        keep_alive: Duration::from_millis(defaults.keep_alive_ms),
        offline_after_failures: device
            .and_then(|d| d.offline_after_failures)
            .unwrap_or(defaults.offline_after_failures),
        stale_after: Duration::from_millis(defaults.stale_after_ms.unwrap_or(poll_ms.saturating_mul(3))),
    }
}

impl AppConfig {
    /// Load from `path`, `$CNTSRV_CONFIG`, or the default location
    pub fn load(path: Option<&Path>) -> CounterResult<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        if !path.exists() {
            return Err(CounterError::Configuration(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        Self::figment(&path).extract().map_err(|e| {
            CounterError::Configuration(format!(
                "Failed to load configuration from {}: {}",
                path.display(),
                e
            ))
        })
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Parse YAML text over the defaults, without environment overrides
    pub fn from_yaml_str(yaml: &str) -> CounterResult<Self> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Yaml::string(yaml))
            .extract()
            .map_err(|e| CounterError::Configuration(format!("Failed to parse configuration: {}", e)))
    }

    pub fn device_settings(&self, device: &DeviceConfig) -> DeviceSettings {
        resolve(&self.defaults, Some(device))
    }

    pub fn rate_window(&self, channel: &ChannelConfig) -> Duration {
        Duration::from_secs(
            channel
                .rate_window_secs
                .unwrap_or(self.defaults.rate_window_secs),
        )
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> CounterResult<()> {
        if self.devices.is_empty() {
            return Err(CounterError::invalid_config("devices", "at least one device is required"));
        }
        if self.batch.batch_size == 0 {
            return Err(CounterError::invalid_config("batch.batch_size", "must be greater than 0"));
        }
        if self.batch.max_buffered < self.batch.batch_size {
            return Err(CounterError::invalid_config(
                "batch.max_buffered",
                "must be at least batch.batch_size",
            ));
        }
        for (field, value) in [
            ("batch.batch_timeout_ms", self.batch.batch_timeout_ms),
            ("batch.write_timeout_ms", self.batch.write_timeout_ms),
            ("defaults.poll_interval_ms", self.defaults.poll_interval_ms),
            ("defaults.timeout_ms", self.defaults.timeout_ms),
            ("defaults.rate_window_secs", self.defaults.rate_window_secs),
            ("dead_letter.scan_interval_ms", self.dead_letter.scan_interval_ms),
            ("health.report_interval_ms", self.health.report_interval_ms),
        ] {
            if value == 0 {
                return Err(CounterError::invalid_config(field, "must be greater than 0"));
            }
        }
        if self.dead_letter.max_entries == 0 {
            return Err(CounterError::invalid_config(
                "dead_letter.max_entries",
                "must be greater than 0",
            ));
        }
        if let StorageConfig::Influxdb(influx) = &self.storage {
            if influx.url.is_empty() || influx.bucket.is_empty() {
                return Err(CounterError::invalid_config(
                    "storage",
                    "influxdb backend requires url and bucket",
                ));
            }
        }

        let mut device_ids = HashSet::new();
        for device in &self.devices {
            self.validate_device(device)?;
            if !device_ids.insert(device.id.as_str()) {
                return Err(CounterError::invalid_config(
                    "devices",
                    format!("duplicate device id '{}'", device.id),
                ));
            }
        }
        Ok(())
    }

    fn validate_device(&self, device: &DeviceConfig) -> CounterResult<()> {
        let field = |name: &str| format!("devices.{}.{}", device.id, name);

        if device.id.trim().is_empty() {
            return Err(CounterError::invalid_config("devices.id", "must not be empty"));
        }
        if device.host.trim().is_empty() {
            return Err(CounterError::invalid_config(field("host"), "must not be empty"));
        }
        if device.port == 0 {
            return Err(CounterError::invalid_config(field("port"), "must not be 0"));
        }
        if device.channels.is_empty() {
            return Err(CounterError::invalid_config(
                field("channels"),
                "at least one channel is required",
            ));
        }

        let settings = self.device_settings(device);
        if settings.poll_interval.is_zero() || settings.timeout.is_zero() {
            return Err(CounterError::invalid_config(
                field("poll_interval_ms"),
                "poll interval and timeout must be greater than 0",
            ));
        }

        let mut channels = HashSet::new();
        for channel in &device.channels {
            if !channels.insert(channel.channel) {
                return Err(CounterError::invalid_config(
                    field("channels"),
                    format!("duplicate channel {}", channel.channel),
                ));
            }
            if u32::from(channel.address) + u32::from(channel.width.register_count()) > 0x1_0000 {
                return Err(CounterError::invalid_config(
                    field("channels"),
                    format!("channel {} register address out of range", channel.channel),
                ));
            }
            if !(channel.scale.is_finite() && channel.scale > 0.0) {
                return Err(CounterError::invalid_config(
                    field("channels"),
                    format!("channel {} scale must be positive", channel.channel),
                ));
            }
            if channel.max_change_rate.is_some_and(|r| !(r.is_finite() && r > 0.0)) {
                return Err(CounterError::invalid_config(
                    field("channels"),
                    format!("channel {} max_change_rate must be positive", channel.channel),
                ));
            }
            let window = self.rate_window(channel);
            if window < settings.poll_interval * 2 {
                return Err(CounterError::invalid_config(
                    field("channels"),
                    format!(
                        "channel {} rate window {:?} must cover at least two poll intervals ({:?})",
                        channel.channel, window, settings.poll_interval
                    ),
                ));
            }
        }

        if device.block_read {
            match device.register_span() {
                Some((_, quantity)) if quantity <= MAX_READ_REGISTERS => {},
                _ => {
                    return Err(CounterError::invalid_config(
                        field("block_read"),
                        format!("channel registers must span at most {} registers", MAX_READ_REGISTERS),
                    ))
                },
            }
        }
        Ok(())
    }
}
