//! Logging setup shared by the workspace services
//!
//! Console output plus a daily rolling log file per service, both using the
//! bracketed `timestamp [LEVEL] message` format. The filter can be changed at
//! runtime through [`set_log_level`].

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};

use errors::{CounterError, CounterResult};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Environment variable overriding the log root directory
pub const LOG_DIR_ENV: &str = "CNTSRV_LOG_DIR";

/// Default max file size before rotating within the same day: 100MB
const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter producing `2025-12-02T00:50:44.809123Z [INFO] message`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

// ============================================================================
// Log Root Directory
// ============================================================================

static LOG_ROOT: OnceLock<PathBuf> = OnceLock::new();

/// Initialize the log root directory
///
/// Priority: `CNTSRV_LOG_DIR` env > `config_dir` > `logs`
pub fn init_log_root(config_dir: Option<&str>) {
    LOG_ROOT.get_or_init(|| {
        std::env::var(LOG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                config_dir
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("logs"))
            })
    });
}

/// Get the log root directory, falling back to env or `logs`
pub fn get_log_root() -> PathBuf {
    LOG_ROOT.get().cloned().unwrap_or_else(|| {
        std::env::var(LOG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("logs"))
    })
}

// ============================================================================
// Daily Rolling Writer
// ============================================================================

fn log_file_path(log_dir: &Path, service_name: &str, date: &str, rotation: u32) -> PathBuf {
    if rotation == 0 {
        log_dir.join(format!("{}_{}.log", date, service_name))
    } else {
        log_dir.join(format!("{}_{}.{}.log", date, service_name, rotation))
    }
}

fn open_append(path: &Path) -> io::Result<(File, u64)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok((file, size))
}

struct RollingState {
    date: String,
    rotation: u32,
    file: File,
    size: u64,
}

/// File writer named `{YYYYMMDD}_{service}.log`, switching files at local
/// midnight and when `max_file_size` would be exceeded (`.1`, `.2`, ...)
#[derive(Clone)]
struct DailyRollingWriter {
    service_name: Arc<str>,
    log_dir: PathBuf,
    max_file_size: u64,
    state: Arc<Mutex<RollingState>>,
}

impl DailyRollingWriter {
    fn new(service_name: &str, log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        fs::create_dir_all(&log_dir)?;
        let date = chrono::Local::now().format("%Y%m%d").to_string();
        let (file, size) = open_append(&log_file_path(&log_dir, service_name, &date, 0))?;

        Ok(Self {
            service_name: Arc::from(service_name),
            log_dir,
            max_file_size,
            state: Arc::new(Mutex::new(RollingState {
                date,
                rotation: 0,
                file,
                size,
            })),
        })
    }

    fn roll(&self, state: &mut RollingState, date: String, rotation: u32) -> io::Result<()> {
        fs::create_dir_all(&self.log_dir)?;
        let path = log_file_path(&self.log_dir, &self.service_name, &date, rotation);
        let (file, size) = open_append(&path)?;
        state.date = date;
        state.rotation = rotation;
        state.file = file;
        state.size = size;
        Ok(())
    }
}

impl Write for DailyRollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| io::Error::other(format!("Mutex poisoned: {}", e)))?;

        let today = chrono::Local::now().format("%Y%m%d").to_string();
        if state.date != today {
            self.roll(&mut state, today, 0)?;
        } else if state.size > 0 && state.size + buf.len() as u64 > self.max_file_size {
            let next = state.rotation + 1;
            let date = state.date.clone();
            self.roll(&mut state, date, next)?;
        }

        let written = state.file.write(buf)?;
        state.size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| io::Error::other(format!("Mutex poisoned: {}", e)))?;
        state.file.flush()
    }
}

// ============================================================================
// Initialization
// ============================================================================

static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();

type EnvFilterReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;
static LOG_FILTER_HANDLE: OnceLock<EnvFilterReloadHandle> = OnceLock::new();
static CURRENT_LOG_LEVEL: OnceLock<Mutex<String>> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used in file names and the default filter
    pub service_name: String,
    /// Directory for log files
    pub log_dir: PathBuf,
    /// Level for everything outside the service crate
    pub console_level: Level,
    /// Level for the service crate itself
    pub file_level: Level,
    /// JSON lines in the log file instead of the bracketed format
    pub enable_json: bool,
    /// ANSI colors on the console
    pub ansi: bool,
    /// Days to keep compressed logs
    pub max_log_days: u64,
    /// Size limit of a single log file
    pub max_file_size: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            log_dir: get_log_root(),
            console_level: Level::INFO,
            file_level: Level::DEBUG,
            enable_json: false,
            ansi: true,
            max_log_days: 365,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Initialize the global subscriber
///
/// `RUST_LOG` wins over the configured levels when set.
pub fn init_with_config(config: LogConfig) -> CounterResult<()> {
    let writer = DailyRollingWriter::new(
        &config.service_name,
        config.log_dir.clone(),
        config.max_file_size,
    )?;
    let (non_blocking, guard) = tracing_appender::non_blocking(writer);

    let guards = GUARDS.get_or_init(|| Mutex::new(Vec::new()));
    match guards.lock() {
        Ok(mut guards) => guards.push(guard),
        Err(poisoned) => poisoned.into_inner().push(guard),
    }

    let filter_str = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        format!(
            "{},{}={}",
            config.console_level.as_str().to_lowercase(),
            config.service_name.replace('-', "_"),
            config.file_level.as_str().to_lowercase()
        )
    });
    let env_filter = EnvFilter::try_new(&filter_str)
        .map_err(|e| CounterError::Configuration(format!("Invalid log filter: {}", e)))?;

    let (reload_filter, reload_handle) = reload::Layer::new(env_filter);
    let _ = LOG_FILTER_HANDLE.set(reload_handle);
    let _ = CURRENT_LOG_LEVEL.set(Mutex::new(filter_str));

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = if config.enable_json {
        fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_level(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .event_format(BracketedLevelFormat)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(reload_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| CounterError::Configuration(format!("Failed to init logging: {}", e)))?;

    tracing::info!("Logging: {} @ {:?}", config.service_name, config.log_dir);

    start_log_compression_task(config.log_dir, config.service_name, config.max_log_days);
    Ok(())
}

/// Change the log filter at runtime, e.g. `"debug"` or `"info,cntsrv=trace"`
pub fn set_log_level(level: &str) -> Result<(), String> {
    let handle = LOG_FILTER_HANDLE
        .get()
        .ok_or("Logging not initialized with reload support")?;

    let new_filter =
        EnvFilter::try_new(level).map_err(|e| format!("Invalid log level '{}': {}", level, e))?;
    handle
        .reload(new_filter)
        .map_err(|e| format!("Failed to reload log filter: {}", e))?;

    if let Some(current) = CURRENT_LOG_LEVEL.get() {
        if let Ok(mut guard) = current.lock() {
            *guard = level.to_string();
        }
    }

    tracing::info!("Log level changed to: {}", level);
    Ok(())
}

/// Current log filter string
pub fn get_log_level() -> String {
    CURRENT_LOG_LEVEL
        .get()
        .and_then(|m| m.lock().ok())
        .map(|guard| guard.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

// ==================== Log Compression ====================

const COMPRESS_AFTER: Duration = Duration::from_secs(7 * 86400);

/// Compress week-old logs once a day, delete compressed logs past `max_log_days`
pub fn start_log_compression_task(log_dir: PathBuf, service_name: String, max_log_days: u64) {
    // No runtime during synchronous tooling (e.g. --validate before tokio starts)
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };

    runtime.spawn(async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        let mut ticker = tokio::time::interval(Duration::from_secs(86400));
        let retention = Duration::from_secs(max_log_days * 86400);

        loop {
            ticker.tick().await;
            let dir = log_dir.clone();
            let name = service_name.clone();
            let result = tokio::task::spawn_blocking(move || {
                compress_old_logs(&dir, &name, COMPRESS_AFTER, retention)
            })
            .await;

            match result {
                Ok(Ok(count)) if count > 0 => tracing::debug!("Compressed {} log files", count),
                Ok(Ok(_)) => {},
                Ok(Err(e)) => tracing::error!("Log compression error for {}: {}", service_name, e),
                Err(e) => tracing::error!("Log compression task failed: {}", e),
            }
        }
    });
}

/// Gzip plain logs older than `compress_after`; remove `.gz` older than `retention`
///
/// Today's files are never touched. Returns the number of files compressed.
pub fn compress_old_logs(
    log_dir: &Path,
    service_name: &str,
    compress_after: Duration,
    retention: Duration,
) -> io::Result<usize> {
    let today = chrono::Local::now().format("%Y%m%d").to_string();
    let marker = format!("_{}.", service_name);
    let mut compressed = 0;

    for entry in fs::read_dir(log_dir)? {
        let path = entry?.path();
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        if !file_name.contains(&marker) || file_name.starts_with(&today) {
            continue;
        }

        let age = fs::metadata(&path)?
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or_default();

        if file_name.ends_with(".log") && age >= compress_after {
            compress_file(&path)?;
            fs::remove_file(&path)?;
            compressed += 1;
        } else if file_name.ends_with(".log.gz") && age >= retention {
            fs::remove_file(&path)?;
            tracing::debug!("Deleted: {}", file_name);
        }
    }

    Ok(compressed)
}

fn compress_file(path: &Path) -> io::Result<()> {
    let data = fs::read(path)?;
    let output = File::create(format!("{}.gz", path.display()))?;
    let mut encoder = GzEncoder::new(output, Compression::best());
    encoder.write_all(&data)?;
    encoder.finish()?;
    Ok(())
}
