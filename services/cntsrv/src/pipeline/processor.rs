//! Turns raw counter samples into processed readings
//!
//! One [`ChannelProcessor`] exists per configured channel and is owned by the
//! device task that polls it, so no locking is involved.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::model::{ProcessedReading, Quality, RawSample};
use super::rate_window::{Overflow, RateWindow};
use crate::config::ChannelConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
struct LastGood {
    timestamp: DateTime<Utc>,
    raw: u64,
    processed: f64,
}

#[derive(Debug)]
pub struct ChannelProcessor {
    device_id: String,
    channel: u16,
    window: RateWindow,
    stale_after: Duration,
    /// Counts added by trusted wraps so far
    wrap_offset: u64,
    last_good: Option<LastGood>,
    overflow_warned: bool,
}

impl ChannelProcessor {
    pub fn new(
        device_id: impl Into<String>,
        config: &ChannelConfig,
        rate_window: Duration,
        stale_after: Duration,
    ) -> Self {
        let window = RateWindow::new(rate_window, config.width)
            .with_max_change_rate(config.max_change_rate);
        Self {
            device_id: device_id.into(),
            channel: config.channel,
            window,
            stale_after,
            wrap_offset: 0,
            last_good: None,
            overflow_warned: false,
        }
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// Grade one sample and fold it into the channel state
    ///
    /// `config` must be the channel this processor was built for; width and
    /// plausibility limits are fixed at construction.
    pub fn process(&mut self, sample: &RawSample, config: &ChannelConfig) -> ProcessedReading {
        match sample.value {
            Some(raw) => self.process_value(sample.timestamp, raw, config),
            None => self.process_failure(sample, config),
        }
    }

    fn process_failure(&self, sample: &RawSample, config: &ChannelConfig) -> ProcessedReading {
        debug!(
            "Device {} channel {} read failed: {}",
            self.device_id,
            self.channel,
            sample.error.as_deref().unwrap_or("unknown error")
        );
        let (raw, processed) = self
            .last_good
            .map_or((0, 0.0), |last| (last.raw, last.processed));
        self.reading(sample.timestamp, raw, processed, 0.0, Quality::Bad, config)
    }

    fn process_value(
        &mut self,
        timestamp: DateTime<Utc>,
        raw: u64,
        config: &ChannelConfig,
    ) -> ProcessedReading {
        let stale = self.last_good.is_some_and(|last| {
            (timestamp - last.timestamp)
                .to_std()
                .is_ok_and(|gap| gap > self.stale_after)
        });
        if stale {
            debug!(
                "Device {} channel {} previous reading is stale",
                self.device_id, self.channel
            );
        }
        self.check_approaching_overflow(raw, config);

        let scale = config.scale;
        let pushed = self.window.push(timestamp, raw);
        let accepted = pushed.is_ok();
        let (rate, mut quality) = match pushed {
            Ok(outcome) => {
                let mut quality = Quality::Good;
                match outcome.overflow {
                    Overflow::Wrapped => {
                        self.wrap_offset = self
                            .wrap_offset
                            .saturating_add(config.width.max_value() + 1);
                        debug!(
                            "Device {} channel {} counter wrapped, corrected delta {}",
                            self.device_id,
                            self.channel,
                            outcome.delta.unwrap_or_default()
                        );
                    },
                    Overflow::Ambiguous => {
                        warn!(
                            "Device {} channel {} counter decreased to {} with no plausible wrap, restarting rate window",
                            self.device_id, self.channel, raw
                        );
                        quality = Quality::Degraded;
                    },
                    Overflow::None => {},
                }
                if outcome.implausible && outcome.overflow != Overflow::Ambiguous {
                    warn!(
                        "Device {} channel {} implausible change of {} counts",
                        self.device_id,
                        self.channel,
                        outcome.delta.unwrap_or_default()
                    );
                    quality = Quality::Degraded;
                }
                (outcome.rate * scale, quality)
            },
            Err(err) => {
                warn!("Device {} channel {}: {}", self.device_id, self.channel, err);
                (self.window.rate().unwrap_or(0.0) * scale, Quality::Degraded)
            },
        };
        if stale {
            quality = Quality::Degraded;
        }

        let processed = raw.saturating_add(self.wrap_offset) as f64 * scale;
        // Only samples the window accepted become the carry-forward baseline
        if accepted {
            self.last_good = Some(LastGood {
                timestamp,
                raw,
                processed,
            });
        }
        self.reading(timestamp, raw, processed, rate, quality, config)
    }

    fn check_approaching_overflow(&mut self, raw: u64, config: &ChannelConfig) {
        let threshold = config.overflow_threshold();
        if raw >= threshold {
            if !self.overflow_warned {
                warn!(
                    "Device {} channel {} counter {} approaching overflow (max {})",
                    self.device_id,
                    self.channel,
                    raw,
                    config.width.max_value()
                );
                self.overflow_warned = true;
            }
        } else {
            self.overflow_warned = false;
        }
    }

    fn reading(
        &self,
        timestamp: DateTime<Utc>,
        raw: u64,
        processed: f64,
        rate: f64,
        quality: Quality,
        config: &ChannelConfig,
    ) -> ProcessedReading {
        ProcessedReading {
            timestamp,
            device_id: self.device_id.clone(),
            channel: self.channel,
            raw_value: raw,
            processed_value: processed,
            rate,
            quality,
            unit: config.unit.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::protocol::RegisterWidth;
    use chrono::TimeZone;
    use tracing_test::traced_test;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn channel(width: RegisterWidth) -> ChannelConfig {
        ChannelConfig {
            channel: 0,
            address: 0,
            width,
            rate_window_secs: None,
            max_change_rate: None,
            scale: 1.0,
            unit: "counts".to_string(),
            overflow_warning_threshold: None,
        }
    }

    struct Harness {
        config: ChannelConfig,
        processor: ChannelProcessor,
    }

    impl Harness {
        fn new(config: ChannelConfig) -> Self {
            let processor = ChannelProcessor::new(
                "adam-01",
                &config,
                Duration::from_secs(60),
                Duration::from_secs(15),
            );
            Self { config, processor }
        }

        fn ok(&mut self, secs: i64, raw: u64) -> ProcessedReading {
            self.processor
                .process(&RawSample::ok("adam-01", 0, raw, at(secs)), &self.config)
        }

        fn failed(&mut self, secs: i64) -> ProcessedReading {
            self.processor.process(
                &RawSample::failed("adam-01", 0, at(secs), "timeout"),
                &self.config,
            )
        }
    }

    #[test]
    fn test_first_reading_is_good_with_zero_rate() {
        let mut p = Harness::new(channel(RegisterWidth::Bits32));
        let reading = p.ok(0, 500);
        assert_eq!(reading.quality, Quality::Good);
        assert_eq!(reading.rate, 0.0);
        assert_eq!(reading.raw_value, 500);
        assert_eq!(reading.processed_value, 500.0);
    }

    #[test]
    fn test_wrap_keeps_processed_value_monotonic() {
        let mut p = Harness::new(channel(RegisterWidth::Bits16));
        p.ok(0, 65530);
        let reading = p.ok(5, 10);

        assert_eq!(reading.quality, Quality::Good);
        assert_eq!(reading.raw_value, 10);
        assert_eq!(reading.processed_value, 65546.0);
        assert!((reading.rate - 3.2).abs() < 1e-9);
    }

    #[test]
    fn test_scale_applied_to_value_and_rate() {
        let mut config = channel(RegisterWidth::Bits32);
        config.scale = 0.5;
        config.unit = "litres".to_string();
        let mut p = Harness::new(config);
        p.ok(0, 100);
        let reading = p.ok(5, 200);
        assert_eq!(reading.processed_value, 100.0);
        assert!((reading.rate - 10.0).abs() < 1e-9);
        assert_eq!(reading.unit, "litres");
    }

    #[test]
    #[traced_test]
    fn test_ambiguous_overflow_is_degraded() {
        let mut config = channel(RegisterWidth::Bits16);
        config.max_change_rate = Some(100.0);
        let mut p = Harness::new(config);
        p.ok(0, 40_000);
        let reading = p.ok(5, 10);

        assert_eq!(reading.quality, Quality::Degraded);
        assert_eq!(reading.rate, 0.0);
        assert!(logs_contain("no plausible wrap"));

        let reading = p.ok(10, 60);
        assert_eq!(reading.quality, Quality::Good);
        assert!((reading.rate - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_implausible_rate_is_degraded() {
        let mut config = channel(RegisterWidth::Bits32);
        config.max_change_rate = Some(10.0);
        let mut p = Harness::new(config);
        p.ok(0, 0);
        let reading = p.ok(5, 1000);
        assert_eq!(reading.quality, Quality::Degraded);
    }

    #[test]
    fn test_failed_read_carries_last_values() {
        let mut p = Harness::new(channel(RegisterWidth::Bits32));
        let reading = p.failed(0);
        assert_eq!(reading.quality, Quality::Bad);
        assert_eq!(reading.raw_value, 0);
        assert_eq!(reading.processed_value, 0.0);

        p.ok(5, 42);
        let reading = p.failed(10);
        assert_eq!(reading.quality, Quality::Bad);
        assert_eq!(reading.raw_value, 42);
        assert_eq!(reading.processed_value, 42.0);
        assert_eq!(reading.rate, 0.0);
    }

    #[test]
    fn test_stale_baseline_is_degraded() {
        let mut p = Harness::new(channel(RegisterWidth::Bits32));
        p.ok(0, 100);
        let reading = p.ok(30, 200);
        assert_eq!(reading.quality, Quality::Degraded);

        let reading = p.ok(35, 250);
        assert_eq!(reading.quality, Quality::Good);
    }

    #[test]
    fn test_non_monotonic_timestamp_is_degraded() {
        let mut p = Harness::new(channel(RegisterWidth::Bits32));
        p.ok(0, 100);
        p.ok(5, 150);
        let reading = p.ok(4, 160);
        assert_eq!(reading.quality, Quality::Degraded);
        assert!((reading.rate - 10.0).abs() < 1e-9);

        // Same timestamp as the last accepted sample
        let duplicate = p.ok(5, 9000);
        assert_eq!(duplicate.quality, Quality::Degraded);

        let carried = p.failed(10);
        assert_eq!(carried.quality, Quality::Bad);
        assert_eq!(carried.raw_value, 150);
        assert_eq!(carried.processed_value, 150.0);
    }

    #[test]
    #[traced_test]
    fn test_overflow_warning_logged_once() {
        let mut config = channel(RegisterWidth::Bits16);
        config.overflow_warning_threshold = Some(60_000);
        let mut p = Harness::new(config);
        p.ok(0, 60_100);
        p.ok(5, 60_200);
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|line| line.contains("approaching overflow"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("expected one warning, got {}", n)),
            }
        });
    }
}
