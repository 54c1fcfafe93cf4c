//! Basic library shared by the workspace services
//!
//! Provides:
//! - logging setup (console + daily rolling files)
//! - shutdown signal handling
//! - service bootstrap helpers (startup banner, log level parsing)

pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;

pub use service_bootstrap::ServiceInfo;
pub use shutdown::wait_for_shutdown;
