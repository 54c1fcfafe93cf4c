//! Reading types flowing through the pipeline

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-reading confidence tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// Read succeeded and the rate is plausible
    Good,
    /// Read succeeded but the rate is suspect (anomaly, ambiguous wrap, stale baseline)
    Degraded,
    /// Read failed; values are carried forward from the last good reading
    Bad,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Degraded => "degraded",
            Self::Bad => "bad",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "good" => Ok(Self::Good),
            "degraded" => Ok(Self::Degraded),
            "bad" => Ok(Self::Bad),
            other => Err(format!("unknown quality '{}'", other)),
        }
    }
}

/// One register read, successful or not
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub device_id: String,
    pub channel: u16,
    /// `None` when the read failed
    pub value: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

impl RawSample {
    pub fn ok(device_id: impl Into<String>, channel: u16, value: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            channel,
            value: Some(value),
            timestamp,
            error: None,
        }
    }

    pub fn failed(
        device_id: impl Into<String>,
        channel: u16,
        timestamp: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            channel,
            value: None,
            timestamp,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.value.is_some()
    }
}

/// The persisted unit of data
///
/// Storage keys readings by `(timestamp, device_id, channel)`; duplicates
/// with the same key are expected under at-least-once delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedReading {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub channel: u16,
    pub raw_value: u64,
    /// Overflow-corrected, unit-scaled counter
    pub processed_value: f64,
    /// Scaled units per second over the rate window
    pub rate: f64,
    pub quality: Quality,
    pub unit: String,
}

impl ProcessedReading {
    /// Key used for de-duplication downstream
    pub fn key(&self) -> (i64, &str, u16) {
        (self.timestamp.timestamp_millis(), &self.device_id, self.channel)
    }
}
