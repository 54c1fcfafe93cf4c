//! Sliding-window rate calculation over a wrapping hardware counter
//!
//! Each sample stores a cumulative, overflow-corrected total so that the rate
//! over the window is simply `(newest.total - oldest.total) / elapsed`. A wrap
//! between two consecutive samples contributes `(max - prev) + new + 1`.
//!
//! When a per-channel `max_change_rate` is known, a wrap whose corrected delta
//! would exceed it cannot be told apart from a device reset or several wraps in
//! one interval. Such a wrap is reported as [`Overflow::Ambiguous`] and the
//! window restarts from the new sample rather than inventing counts.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::protocol::RegisterWidth;

/// Default maximum number of retained samples
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RateError {
    #[error("Non-monotonic timestamp: {current} is not after {previous}")]
    NonMonotonic {
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },

    #[error("Counter value {value} exceeds register maximum {max}")]
    OutOfRange { value: u64, max: u64 },
}

/// Wrap classification for the latest sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    None,
    /// Counter wrapped once and the corrected delta is plausible
    Wrapped,
    /// Counter decreased and the wrap correction is not trustworthy
    Ambiguous,
}

/// Result of pushing one sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PushOutcome {
    /// Counts per second over the window, `0.0` while warming up
    pub rate: f64,
    /// Fewer than two samples in the window
    pub warming_up: bool,
    pub overflow: Overflow,
    /// Corrected delta from the previous sample, if there was one
    pub delta: Option<u64>,
    /// Delta exceeded the configured maximum change rate
    pub implausible: bool,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    timestamp: DateTime<Utc>,
    raw: u64,
    total: u64,
}

#[derive(Debug, Clone)]
pub struct RateWindow {
    window_ms: i64,
    capacity: usize,
    max_value: u64,
    max_change_rate: Option<f64>,
    samples: VecDeque<Sample>,
}

impl RateWindow {
    pub fn new(window: Duration, width: RegisterWidth) -> Self {
        Self {
            window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
            capacity: DEFAULT_CAPACITY,
            max_value: width.max_value(),
            max_change_rate: None,
            samples: VecDeque::new(),
        }
    }

    /// Counts per second above which a delta is treated as implausible
    pub fn with_max_change_rate(mut self, max_change_rate: Option<f64>) -> Self {
        self.max_change_rate = max_change_rate.filter(|r| r.is_finite() && *r > 0.0);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(2);
        self
    }

    /// Add a sample and return the updated rate
    ///
    /// On error the window is left untouched.
    pub fn push(&mut self, timestamp: DateTime<Utc>, raw: u64) -> Result<PushOutcome, RateError> {
        if raw > self.max_value {
            return Err(RateError::OutOfRange {
                value: raw,
                max: self.max_value,
            });
        }

        let Some(last) = self.samples.back().copied() else {
            self.samples.push_back(Sample {
                timestamp,
                raw,
                total: 0,
            });
            return Ok(self.outcome(Overflow::None, None, false));
        };

        if timestamp <= last.timestamp {
            return Err(RateError::NonMonotonic {
                previous: last.timestamp,
                current: timestamp,
            });
        }

        let (delta, wrapped) = if raw >= last.raw {
            (raw - last.raw, false)
        } else {
            ((self.max_value - last.raw) + raw + 1, true)
        };

        let elapsed = seconds_between(last.timestamp, timestamp);
        let implausible = self
            .max_change_rate
            .is_some_and(|limit| delta as f64 > limit * elapsed);

        if wrapped && implausible {
            self.samples.clear();
            self.samples.push_back(Sample {
                timestamp,
                raw,
                total: 0,
            });
            return Ok(self.outcome(Overflow::Ambiguous, Some(delta), true));
        }

        self.samples.push_back(Sample {
            timestamp,
            raw,
            total: last.total.saturating_add(delta),
        });
        self.evict(timestamp);

        let overflow = if wrapped {
            Overflow::Wrapped
        } else {
            Overflow::None
        };
        Ok(self.outcome(overflow, Some(delta), implausible))
    }

    /// Current rate, `None` while fewer than two samples are held
    pub fn rate(&self) -> Option<f64> {
        let (oldest, newest) = (self.samples.front()?, self.samples.back()?);
        if self.samples.len() < 2 {
            return None;
        }
        let elapsed = seconds_between(oldest.timestamp, newest.timestamp);
        if elapsed <= 0.0 {
            return None;
        }
        Some((newest.total - oldest.total) as f64 / elapsed)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.samples.back().map(|s| s.timestamp)
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    fn evict(&mut self, newest: DateTime<Utc>) {
        while let Some(front) = self.samples.front() {
            let age_ms = (newest - front.timestamp).num_milliseconds();
            if age_ms > self.window_ms && self.samples.len() > 1 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    fn outcome(&self, overflow: Overflow, delta: Option<u64>, implausible: bool) -> PushOutcome {
        let rate = self.rate();
        PushOutcome {
            rate: rate.unwrap_or(0.0),
            warming_up: rate.is_none(),
            overflow,
            delta,
            implausible,
        }
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let span = to - from;
    match span.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => span.num_milliseconds() as f64 / 1000.0,
    }
}
