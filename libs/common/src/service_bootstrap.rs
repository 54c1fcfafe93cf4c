//! Service bootstrap helpers: metadata, banner, log level parsing

use tracing::{info, Level};

/// Service metadata for startup
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    /// Service name (e.g., "cntsrv")
    pub name: String,
    /// Service version from Cargo.toml
    pub version: String,
    /// One-line description
    pub description: String,
}

impl ServiceInfo {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
        }
    }
}

/// Print the startup banner through the logger
pub fn print_startup_banner(service: &ServiceInfo) {
    let banner = r#"
  ██████╗███╗   ██╗████████╗███████╗██████╗ ██╗   ██╗
 ██╔════╝████╗  ██║╚══██╔══╝██╔════╝██╔══██╗██║   ██║
 ██║     ██╔██╗ ██║   ██║   ███████╗██████╔╝██║   ██║
 ██║     ██║╚██╗██║   ██║   ╚════██║██╔══██╗╚██╗ ██╔╝
 ╚██████╗██║ ╚████║   ██║   ███████║██║  ██║ ╚████╔╝
  ╚═════╝╚═╝  ╚═══╝   ╚═╝   ╚══════╝╚═╝  ╚═╝  ╚═══╝
    "#;

    info!("{}", banner);
    info!(" {} v{}", service.name.to_uppercase(), service.version);
    info!(" {}", service.description);
}

/// Parse a log level name, defaulting to INFO
pub fn parse_log_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
