//! Reconnection discipline
//!
//! Exponential backoff with jitter plus a minimum spacing between attempts.
//! The helper never sleeps: callers ask whether an attempt is allowed and get
//! the remaining wait back when it is not, so a poll loop can move on.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

use crate::config::DeviceSettings;

/// Reconnection policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Minimum time between two connect attempts
    pub min_interval: Duration,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Backoff multiplier for exponential delay
    pub backoff_multiplier: f64,
    /// Whether to add ±25% jitter to delays
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(2),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &DeviceSettings) -> Self {
        Self {
            min_interval: settings.min_reconnect_interval,
            initial_delay: settings.reconnect_initial,
            max_delay: settings.reconnect_max,
            ..Self::default()
        }
    }

    /// Backoff delay after `failures` consecutive failed attempts (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20) as i32;
        let mut delay = self
            .initial_delay
            .mul_f64(self.backoff_multiplier.powi(exponent))
            .min(self.max_delay);

        if self.jitter {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            if jitter_range > 0.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                delay = Duration::from_millis((delay.as_millis() as f64 + jitter).max(0.0) as u64);
            }
        }
        delay
    }
}

/// Reconnection statistics tracking
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconnectStats {
    pub total_attempts: u64,
    pub failed_connects: u64,
}

/// Tracks attempts and decides when the next one may happen
#[derive(Debug)]
pub struct ReconnectGate {
    policy: ReconnectPolicy,
    last_attempt: Option<Instant>,
    next_allowed: Option<Instant>,
    failures: u32,
    /// Sessions lost since the last answered read
    session_failures: u32,
    stats: ReconnectStats,
}

impl ReconnectGate {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            last_attempt: None,
            next_allowed: None,
            failures: 0,
            session_failures: 0,
            stats: ReconnectStats::default(),
        }
    }

    pub fn stats(&self) -> &ReconnectStats {
        &self.stats
    }

    /// Consecutive failed attempts since the last success
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn session_failures(&self) -> u32 {
        self.session_failures
    }

    /// `Err(wait)` when an attempt now would violate spacing or backoff
    pub fn check(&self, now: Instant) -> Result<(), Duration> {
        let spacing = self
            .last_attempt
            .map(|last| last + self.policy.min_interval);
        let deadline = match (spacing, self.next_allowed) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        match deadline {
            Some(deadline) if deadline > now => Err(deadline - now),
            _ => Ok(()),
        }
    }

    pub fn record_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
        self.stats.total_attempts += 1;
    }

    /// Schedule the next attempt and return the backoff applied
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.stats.failed_connects += 1;
        let delay = self.policy.delay_for(self.failures);
        self.next_allowed = Some(now + delay);
        debug!(
            "Reconnect backoff {:?} after {} consecutive failures",
            delay, self.failures
        );
        delay
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.next_allowed = None;
    }

    /// A session was lost; back off before reconnecting
    ///
    /// A connect that succeeds does not reset this backoff, only an answered
    /// read does. A peer that accepts sessions but never answers still backs
    /// off up to the cap.
    pub fn record_disconnect(&mut self, now: Instant) -> Duration {
        self.session_failures = self.session_failures.saturating_add(1);
        let delay = self
            .policy
            .delay_for(self.failures.max(self.session_failures));
        self.next_allowed = Some(now + delay);
        delay
    }

    /// The device answered a request
    pub fn record_session_ok(&mut self) {
        self.session_failures = 0;
    }
}
