//! One device's Modbus-TCP session

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::health::{DeviceHealth, LinkState};
use super::reconnect::{ReconnectGate, ReconnectPolicy};
use super::{transport, LinkError};
use crate::config::{register_span, ChannelConfig, DeviceConfig, DeviceSettings};
use crate::pipeline::RawSample;
use crate::protocol::{combine_words, CodecError, ReadRequest, WordOrder, MAX_READ_REGISTERS};

pub struct DeviceLink {
    device_id: String,
    endpoint: String,
    unit_id: u8,
    word_order: WordOrder,
    /// Register read by keep-alive probes
    probe_address: u16,
    settings: DeviceSettings,
    stream: Option<TcpStream>,
    gate: ReconnectGate,
    transaction_id: u16,
    last_activity: Option<Instant>,
    ever_connected: bool,
    health: DeviceHealth,
    health_tx: watch::Sender<DeviceHealth>,
}

impl DeviceLink {
    pub fn new(device: &DeviceConfig, settings: DeviceSettings) -> Self {
        let endpoint = device.endpoint();
        let health = DeviceHealth::new(&device.id, &endpoint);
        let (health_tx, _) = watch::channel(health.clone());
        Self {
            device_id: device.id.clone(),
            endpoint,
            unit_id: device.unit_id,
            word_order: device.word_order,
            probe_address: device.channels.first().map_or(0, |c| c.address),
            gate: ReconnectGate::new(ReconnectPolicy::from_settings(&settings)),
            settings,
            stream: None,
            transaction_id: 0,
            last_activity: None,
            ever_connected: false,
            health,
            health_tx,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub fn health(&self) -> DeviceHealth {
        self.health.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceHealth> {
        self.health_tx.subscribe()
    }

    pub fn state(&self) -> LinkState {
        self.health.state
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_offline(&self) -> bool {
        self.health.offline
    }

    /// Open the TCP session, subject to spacing and backoff
    pub async fn connect(&mut self) -> Result<(), LinkError> {
        let now = Instant::now();
        if let Err(retry_in) = self.gate.check(now) {
            self.set_state(LinkState::Throttled);
            return Err(LinkError::Throttled { retry_in });
        }

        self.stream = None;
        self.gate.record_attempt(now);
        self.set_state(LinkState::Connecting);

        let result =
            transport::connect(&self.endpoint, self.settings.timeout, self.settings.keep_alive)
                .await;
        match result {
            Ok(stream) => {
                self.stream = Some(stream);
                self.gate.record_success();
                self.sync_connect_stats();
                self.last_activity = Some(Instant::now());
                if self.ever_connected {
                    self.health.reconnects += 1;
                }
                self.ever_connected = true;
                info!("Device {} connected: {}", self.device_id, self.endpoint);
                self.set_state(LinkState::Connected);
                Ok(())
            },
            Err(e) => {
                let backoff = self.gate.record_failure(Instant::now());
                self.sync_connect_stats();
                warn!(
                    "Device {} connect to {} failed: {} (next attempt in {:?})",
                    self.device_id, self.endpoint, e, backoff
                );
                self.health.state = LinkState::Disconnected;
                self.note_failure(&e);
                Err(e)
            },
        }
    }

    /// Read one channel's counter
    pub async fn read_channel(&mut self, channel: &ChannelConfig) -> Result<RawSample, LinkError> {
        let words = self
            .read_registers(channel.address, channel.width.register_count())
            .await?;
        let value = combine_words(&words, channel.width, self.word_order)?;
        Ok(RawSample::ok(&self.device_id, channel.channel, value, Utc::now()))
    }

    /// Read every channel with a single request spanning their registers
    ///
    /// Samples come back in the order of `channels`.
    pub async fn read_channels(
        &mut self,
        channels: &[ChannelConfig],
    ) -> Result<Vec<RawSample>, LinkError> {
        let (start, quantity) = register_span(channels).ok_or(CodecError::InvalidQuantity(0))?;
        if quantity > MAX_READ_REGISTERS {
            return Err(CodecError::InvalidQuantity(quantity).into());
        }

        let words = self.read_registers(start, quantity).await?;
        let timestamp = Utc::now();
        channels
            .iter()
            .map(|channel| -> Result<RawSample, LinkError> {
                let offset = usize::from(channel.address - start);
                let count = usize::from(channel.width.register_count());
                let slice = words.get(offset..offset + count).ok_or(
                    CodecError::WordCountMismatch {
                        expected: offset + count,
                        actual: words.len(),
                    },
                )?;
                let value = combine_words(slice, channel.width, self.word_order)?;
                Ok(RawSample::ok(&self.device_id, channel.channel, value, timestamp))
            })
            .collect()
    }

    /// Raw holding register read, connecting first if needed
    pub async fn read_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, LinkError> {
        if self.stream.is_none() {
            self.connect().await?;
        }

        let request = ReadRequest::new(self.next_transaction_id(), self.unit_id, address, quantity)?;
        let read_timeout = self.settings.timeout;
        self.health.total_reads += 1;
        self.set_state(LinkState::Reading);

        let Some(stream) = self.stream.as_mut() else {
            return Err(LinkError::NotConnected);
        };
        let result = transport::exchange(stream, &request, read_timeout).await;
        self.last_activity = Some(Instant::now());

        match result {
            Ok(words) => {
                self.note_success();
                Ok(words)
            },
            Err(e) => {
                self.note_read_failure(&e);
                Err(e)
            },
        }
    }

    /// Probe a session that has been idle longer than the keep-alive period
    ///
    /// Returns `true` when a probe was sent and answered.
    pub async fn probe_if_idle(&mut self) -> Result<bool, LinkError> {
        let idle = match (self.stream.as_ref(), self.last_activity) {
            (Some(_), Some(last)) => last.elapsed(),
            _ => return Ok(false),
        };
        if idle < self.settings.keep_alive {
            return Ok(false);
        }

        debug!(
            "Device {} idle for {:?}, sending keep-alive probe",
            self.device_id, idle
        );
        self.read_registers(self.probe_address, 1).await?;
        Ok(true)
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Device {} shutdown: {}", self.device_id, e);
            }
            info!("Device {} disconnected", self.device_id);
        }
        self.set_state(LinkState::Disconnected);
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    fn note_success(&mut self) {
        let was_offline = self.health.offline;
        self.gate.record_session_ok();
        self.health.consecutive_failures = 0;
        self.health.last_success = Some(Utc::now());
        self.health.offline = false;
        self.health.state = LinkState::Connected;
        if was_offline {
            info!("Device {} back online", self.device_id);
        }
        self.publish();
    }

    fn note_read_failure(&mut self, err: &LinkError) {
        self.health.failed_reads += 1;
        if err.breaks_session() {
            self.stream = None;
            let backoff = self.gate.record_disconnect(Instant::now());
            self.health.state = LinkState::Disconnected;
            warn!(
                "Device {} session dropped: {} (reconnect in {:?})",
                self.device_id, err, backoff
            );
        } else {
            self.health.state = LinkState::Connected;
            debug!("Device {} read rejected: {}", self.device_id, err);
        }
        self.note_failure(err);
    }

    fn note_failure(&mut self, err: &LinkError) {
        self.health.consecutive_failures = self.health.consecutive_failures.saturating_add(1);
        self.health.last_error = Some(err.to_string());
        if !self.health.offline
            && self.health.consecutive_failures >= self.settings.offline_after_failures
        {
            self.health.offline = true;
            warn!(
                "Device {} marked offline after {} consecutive failures",
                self.device_id, self.health.consecutive_failures
            );
        }
        self.publish();
    }

    fn sync_connect_stats(&mut self) {
        let stats = self.gate.stats();
        self.health.connect_attempts = stats.total_attempts;
        self.health.failed_connects = stats.failed_connects;
    }

    fn set_state(&mut self, state: LinkState) {
        if self.health.state != state {
            self.health.state = state;
            self.publish();
        }
    }

    fn publish(&self) {
        self.health_tx.send_replace(self.health.clone());
    }
}
