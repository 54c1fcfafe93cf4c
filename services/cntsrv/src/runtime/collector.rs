//! Acquisition orchestration
//!
//! Every device runs in its own task with its own link, processors and poll
//! timer, so a dead device never delays another. Results flow into the shared
//! [`BatchWriter`]. Shutdown order: device tasks, then the retry loop and
//! reporter, then the writer's final flush.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::health::{run_reporter, HealthRegistry};
use crate::config::{AppConfig, ChannelConfig, DeviceConfig, DeviceSettings};
use crate::link::{DeviceHealth, DeviceLink, LinkError};
use crate::pipeline::{ChannelProcessor, ProcessedReading, Quality, RawSample};
use crate::reliability::{BatchStats, BatchWriter, DeadLetterStats, DeadLetterStore};
use crate::storage::ReadingSink;

/// Delay before a panicked device task is restarted
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// What a device task did before it stopped
#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub device_id: String,
    pub polls: u64,
    pub readings: u64,
    pub bad_readings: u64,
    pub restarts: u32,
    pub health: DeviceHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectorReport {
    pub devices: Vec<DeviceReport>,
    pub batch: BatchStats,
    pub dead_letter: DeadLetterStats,
}

impl CollectorReport {
    pub fn total_readings(&self) -> u64 {
        self.devices.iter().map(|d| d.readings).sum()
    }
}

/// What one read attempt covers
#[derive(Clone, Copy)]
enum ReadTarget<'a> {
    Channel(&'a ChannelConfig),
    Block(&'a [ChannelConfig]),
}

/// Owns one device's link and channel processors
pub struct DevicePoller {
    device: DeviceConfig,
    settings: DeviceSettings,
    link: DeviceLink,
    processors: Vec<ChannelProcessor>,
    polls: u64,
    readings: u64,
    bad_readings: u64,
}

impl DevicePoller {
    pub fn new(config: &AppConfig, device: &DeviceConfig) -> Self {
        let settings = config.device_settings(device);
        let processors = device
            .channels
            .iter()
            .map(|channel| {
                ChannelProcessor::new(
                    &device.id,
                    channel,
                    config.rate_window(channel),
                    settings.stale_after,
                )
            })
            .collect();

        Self {
            link: DeviceLink::new(device, settings.clone()),
            device: device.clone(),
            settings,
            processors,
            polls: 0,
            readings: 0,
            bad_readings: 0,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn link(&self) -> &DeviceLink {
        &self.link
    }

    /// Read every channel once and process the samples
    ///
    /// Never fails: an unreadable channel yields a Bad reading.
    pub async fn poll_once(&mut self, cancel: &CancellationToken) -> Vec<ProcessedReading> {
        self.polls += 1;
        let started = Instant::now();

        if let Err(e) = self.link.probe_if_idle().await {
            debug!("Device {} keep-alive probe failed: {}", self.device.id, e);
        }

        let channels = self.device.channels.clone();
        let samples = if self.device.block_read && channels.len() > 1 {
            match self.read_with_retry(ReadTarget::Block(&channels), started, cancel).await {
                Ok(samples) => samples,
                Err(e) => channels
                    .iter()
                    .map(|c| RawSample::failed(&self.device.id, c.channel, Utc::now(), e.to_string()))
                    .collect(),
            }
        } else {
            let mut samples = Vec::with_capacity(channels.len());
            for channel in &channels {
                let sample = match self
                    .read_with_retry(ReadTarget::Channel(channel), started, cancel)
                    .await
                {
                    Ok(mut read) => read.pop().unwrap_or_else(|| {
                        RawSample::failed(&self.device.id, channel.channel, Utc::now(), "empty read")
                    }),
                    Err(e) => {
                        RawSample::failed(&self.device.id, channel.channel, Utc::now(), e.to_string())
                    },
                };
                samples.push(sample);
            }
            samples
        };

        let mut readings = Vec::with_capacity(samples.len());
        for (sample, (processor, channel)) in samples
            .iter()
            .zip(self.processors.iter_mut().zip(channels.iter()))
        {
            let reading = processor.process(sample, channel);
            if reading.quality == Quality::Bad {
                self.bad_readings += 1;
            }
            readings.push(reading);
        }
        self.readings += readings.len() as u64;
        readings
    }

    async fn attempt(&mut self, target: ReadTarget<'_>) -> Result<Vec<RawSample>, LinkError> {
        match target {
            ReadTarget::Channel(channel) => Ok(vec![self.link.read_channel(channel).await?]),
            ReadTarget::Block(channels) => self.link.read_channels(channels).await,
        }
    }

    /// Up to `max_retries` retries within the poll interval; one attempt while offline
    async fn read_with_retry(
        &mut self,
        target: ReadTarget<'_>,
        poll_started: Instant,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawSample>, LinkError> {
        let attempts = if self.link.is_offline() {
            1
        } else {
            1 + self.settings.max_retries
        };
        let deadline = poll_started + self.settings.poll_interval;

        let mut attempt = 1;
        loop {
            let err = match self.attempt(target).await {
                Ok(samples) => return Ok(samples),
                Err(e) => e,
            };

            let out_of_time = Instant::now() + self.settings.retry_delay >= deadline;
            if err.is_throttled() || attempt >= attempts || out_of_time || cancel.is_cancelled() {
                debug!(
                    "Device {} read gave up after {} attempt(s): {}",
                    self.device.id, attempt, err
                );
                return Err(err);
            }

            attempt += 1;
            sleep(self.settings.retry_delay).await;
        }
    }

    /// Poll on the device's interval until cancelled
    pub async fn run(mut self, writer: Arc<BatchWriter>, cancel: CancellationToken) -> DeviceReport {
        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Device {} ({}) polling {} every {:?}",
            self.device.id,
            self.device.display_name(),
            self.link.endpoint(),
            self.settings.poll_interval
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for reading in self.poll_once(&cancel).await {
                        writer.add(reading).await;
                    }
                }
            }
        }

        self.link.disconnect().await;
        info!("Device {} stopped after {} polls", self.device.id, self.polls);
        self.report(0)
    }

    fn report(&self, restarts: u32) -> DeviceReport {
        DeviceReport {
            device_id: self.device.id.clone(),
            polls: self.polls,
            readings: self.readings,
            bad_readings: self.bad_readings,
            restarts,
            health: self.link.health(),
        }
    }
}

pub struct Collector {
    config: Arc<AppConfig>,
    sink: Arc<dyn ReadingSink>,
    dead_letter: Arc<DeadLetterStore>,
    writer: Arc<BatchWriter>,
    registry: HealthRegistry,
}

impl Collector {
    pub fn new(
        config: AppConfig,
        sink: Arc<dyn ReadingSink>,
        dead_letter: Arc<DeadLetterStore>,
    ) -> Self {
        let writer = Arc::new(BatchWriter::new(
            config.batch.clone(),
            sink.clone(),
            dead_letter.clone(),
        ));
        Self {
            config: Arc::new(config),
            sink,
            dead_letter,
            writer,
            registry: HealthRegistry::new(),
        }
    }

    pub fn registry(&self) -> HealthRegistry {
        self.registry.clone()
    }

    pub fn writer(&self) -> Arc<BatchWriter> {
        self.writer.clone()
    }

    /// Run until `cancel` fires, then shut everything down in order
    pub async fn run(self, cancel: CancellationToken) -> CollectorReport {
        info!(
            "Collector starting {} devices, storage {}",
            self.config.devices.len(),
            self.sink.name()
        );

        let background = CancellationToken::new();
        let writer_cancel = CancellationToken::new();

        let writer_task = tokio::spawn({
            let writer = self.writer.clone();
            let token = writer_cancel.clone();
            async move { writer.run(token).await }
        });
        let retry_task = tokio::spawn(
            self.dead_letter
                .clone()
                .run_retry_loop(self.sink.clone(), background.child_token()),
        );
        let reporter_task = tokio::spawn(run_reporter(
            self.registry.clone(),
            self.config.health.clone(),
            self.writer.clone(),
            self.dead_letter.clone(),
            background.child_token(),
        ));

        let mut devices = JoinSet::new();
        for device in &self.config.devices {
            devices.spawn(supervise(
                self.config.clone(),
                device.clone(),
                self.writer.clone(),
                self.registry.clone(),
                cancel.child_token(),
            ));
        }

        let mut reports = Vec::with_capacity(self.config.devices.len());
        while let Some(joined) = devices.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!("Device supervisor failed: {}", e),
            }
        }
        reports.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        info!("All device tasks stopped");

        background.cancel();
        for (name, task) in [("retry loop", retry_task), ("health reporter", reporter_task)] {
            if let Err(e) = task.await {
                error!("Collector {} task failed: {}", name, e);
            }
        }

        writer_cancel.cancel();
        if let Err(e) = writer_task.await {
            error!("Batch writer task failed: {}", e);
        }

        let report = CollectorReport {
            devices: reports,
            batch: self.writer.stats().await,
            dead_letter: self.dead_letter.stats().await,
        };
        info!(
            "Collector stopped: {} readings collected, {} written, {} dead-letter entries pending",
            report.total_readings(),
            report.batch.written,
            report.dead_letter.pending
        );
        report
    }
}

/// Keep one device's poller alive, restarting it after a panic
async fn supervise(
    config: Arc<AppConfig>,
    device: DeviceConfig,
    writer: Arc<BatchWriter>,
    registry: HealthRegistry,
    cancel: CancellationToken,
) -> DeviceReport {
    let mut restarts = 0;
    loop {
        let poller = DevicePoller::new(&config, &device);
        registry.register(&device.id, poller.link().subscribe());
        let last_health = poller.link().subscribe();

        let handle = tokio::spawn(poller.run(writer.clone(), cancel.clone()));
        match handle.await {
            Ok(mut report) => {
                report.restarts = restarts;
                return report;
            },
            Err(e) => {
                error!("Device {} task crashed: {}", device.id, e);
                if cancel.is_cancelled() {
                    return DeviceReport {
                        device_id: device.id.clone(),
                        polls: 0,
                        readings: 0,
                        bad_readings: 0,
                        restarts,
                        health: last_health.borrow().clone(),
                    };
                }
                restarts += 1;
                warn!(
                    "Restarting device {} in {:?} (restart {})",
                    device.id, RESTART_DELAY, restarts
                );
                tokio::select! {
                    _ = cancel.cancelled() => {},
                    _ = sleep(RESTART_DELAY) => {},
                }
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::protocol::codec::{encode_read_response, parse_read_request_pdu};
    use crate::protocol::{MbapHeader, MBAP_HEADER_LEN};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers every request with registers counting up from `base`
    async fn counter_server(base: u16) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut frame = [0u8; 12];
                    while socket.read_exact(&mut frame).await.is_ok() {
                        let header = MbapHeader::decode(&frame).unwrap();
                        let (start, quantity) =
                            parse_read_request_pdu(&frame[MBAP_HEADER_LEN..]).unwrap();
                        let words: Vec<u16> = (0..quantity).map(|i| base + start + i).collect();
                        let reply = encode_read_response(header.transaction_id, header.unit_id, &words);
                        if socket.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    fn config(endpoint: &str, block_read: bool) -> AppConfig {
        let (host, port) = endpoint.rsplit_once(':').unwrap();
        AppConfig::from_yaml_str(&format!(
            r#"
defaults:
  poll_interval_ms: 100
  timeout_ms: 200
  max_retries: 1
  retry_delay_ms: 10
  min_reconnect_interval_ms: 0
  reconnect_initial_ms: 50
devices:
  - id: adam-01
    host: "{host}"
    port: {port}
    block_read: {block_read}
    channels:
      - {{ channel: 0, address: 0, width: 16 }}
      - {{ channel: 1, address: 1, width: 16 }}
"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_poll_once_reads_every_channel() {
        let addr = counter_server(100).await;
        let config = config(&addr, false);
        let mut poller = DevicePoller::new(&config, &config.devices[0]);

        let readings = poller.poll_once(&CancellationToken::new()).await;
        let raws: Vec<_> = readings.iter().map(|r| r.raw_value).collect();
        assert_eq!(raws, vec![100, 101]);
        assert!(readings.iter().all(|r| r.quality == Quality::Good));
    }

    #[tokio::test]
    async fn test_block_read_matches_channel_reads() {
        let addr = counter_server(7).await;
        let config = config(&addr, true);
        let mut poller = DevicePoller::new(&config, &config.devices[0]);

        let readings = poller.poll_once(&CancellationToken::new()).await;
        let raws: Vec<_> = readings.iter().map(|r| (r.channel, r.raw_value)).collect();
        assert_eq!(raws, vec![(0, 7), (1, 8)]);
        assert_eq!(readings[0].timestamp, readings[1].timestamp);
    }

    #[tokio::test]
    async fn test_unreachable_device_yields_bad_readings() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = config(&addr, false);
        let mut poller = DevicePoller::new(&config, &config.devices[0]);
        let readings = poller.poll_once(&CancellationToken::new()).await;

        assert_eq!(readings.len(), 2);
        assert!(readings.iter().all(|r| r.quality == Quality::Bad));
        assert_eq!(poller.bad_readings, 2);
        assert!(poller.link().health().consecutive_failures >= 1);
    }
}
