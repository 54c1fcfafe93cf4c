//! Per-device link health

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection state of a device link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// A request is in flight
    Reading,
    /// Last connect attempt was refused locally by spacing or backoff
    Throttled,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reading => "reading",
            Self::Throttled => "throttled",
        };
        f.write_str(name)
    }
}

/// Health of one device, written only by its link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceHealth {
    pub device_id: String,
    pub endpoint: String,
    pub state: LinkState,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub offline: bool,
    pub total_reads: u64,
    pub failed_reads: u64,
    pub reconnects: u64,
    pub connect_attempts: u64,
    pub failed_connects: u64,
}

impl DeviceHealth {
    pub fn new(device_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            endpoint: endpoint.into(),
            state: LinkState::Disconnected,
            consecutive_failures: 0,
            last_success: None,
            last_error: None,
            offline: false,
            total_reads: 0,
            failed_reads: 0,
            reconnects: 0,
            connect_attempts: 0,
            failed_connects: 0,
        }
    }

    pub fn seconds_since_last_read(&self, now: DateTime<Utc>) -> Option<f64> {
        self.last_success
            .map(|at| (now - at).num_milliseconds().max(0) as f64 / 1000.0)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, LinkState::Connected | LinkState::Reading)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_seconds_since_last_read() {
        let mut health = DeviceHealth::new("adam-01", "127.0.0.1:502");
        let now = Utc::now();
        assert_eq!(health.seconds_since_last_read(now), None);

        health.last_success = Some(now - Duration::milliseconds(2500));
        assert_eq!(health.seconds_since_last_read(now), Some(2.5));
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&LinkState::Throttled).unwrap();
        assert_eq!(json, "\"throttled\"");
    }
}
