//! Unified error handling for the counter acquisition service
//!
//! Components keep their own small error enums (codec, link, storage,
//! dead letter queue). This crate provides the service-level error that
//! bootstrap code and `main` propagate, plus classification helpers used
//! when deciding whether a failure is transient.

use thiserror::Error;

// ============================================================================
// CounterError - Main error type
// ============================================================================

/// Main error type for the counter acquisition service
#[derive(Debug, Error)]
pub enum CounterError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // ======================================
    // Device & Protocol Errors
    // ======================================
    #[error("Connection failed: {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Timeout waiting for response from {0}")]
    Timeout(String),

    #[error("Modbus error: {0}")]
    Modbus(String),

    #[error("Device error: {device}: {message}")]
    Device { device: String, message: String },

    // ======================================
    // Storage Errors
    // ======================================
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Dead letter queue error: {0}")]
    DeadLetter(String),

    // ======================================
    // File & Serialization Errors
    // ======================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ======================================
    // Service & Runtime Errors
    // ======================================
    #[error("Service startup failed: {0}")]
    StartupFailed(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using CounterError
pub type CounterResult<T> = Result<T, CounterError>;

/// Error category, used for log classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Connection,
    Timeout,
    Protocol,
    Storage,
    Internal,
    Unknown,
}

impl CounterError {
    /// Shorthand for [`CounterError::InvalidConfig`]
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::ConnectionFailed { .. }
                | Self::Storage(_)
                | Self::HttpClient(_)
                | Self::Io(_)
        )
    }

    /// Stable machine-readable code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Modbus(_) => "MODBUS_ERROR",
            Self::Device { .. } => "DEVICE_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Sqlite(_) => "SQLITE_ERROR",
            Self::HttpClient(_) => "HTTP_CLIENT_ERROR",
            Self::DeadLetter(_) => "DEAD_LETTER_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::StartupFailed(_) => "STARTUP_FAILED",
            Self::ShutdownError(_) => "SHUTDOWN_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Other(_) => "OTHER_ERROR",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::InvalidConfig { .. } => ErrorCategory::Configuration,
            Self::ConnectionFailed { .. } | Self::Device { .. } => ErrorCategory::Connection,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Modbus(_) => ErrorCategory::Protocol,
            Self::Storage(_) | Self::Sqlite(_) | Self::HttpClient(_) | Self::DeadLetter(_) => {
                ErrorCategory::Storage
            },
            Self::Io(_)
            | Self::Serialization(_)
            | Self::StartupFailed(_)
            | Self::ShutdownError(_)
            | Self::Internal(_) => ErrorCategory::Internal,
            Self::Other(_) => ErrorCategory::Unknown,
        }
    }
}

// Conversion traits for common error types
impl From<serde_json::Error> for CounterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for CounterError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

// Helper macros for creating errors
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::CounterError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::CounterError::Configuration(format!($fmt, $($arg)*))
    };
}
