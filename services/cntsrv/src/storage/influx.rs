//! InfluxDB v2 line-protocol writer

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, error};

use super::{ReadingSink, StorageError};
use crate::config::{DeviceConfig, InfluxConfig};
use crate::pipeline::ProcessedReading;

/// Static tags attached to every point of a device
#[derive(Debug, Clone)]
struct DeviceTags {
    name: String,
    location: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InfluxStore {
    config: InfluxConfig,
    client: Client,
    devices: HashMap<String, DeviceTags>,
}

impl InfluxStore {
    pub fn new(
        config: InfluxConfig,
        devices: &[DeviceConfig],
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        let client = Client::builder().timeout(timeout).build()?;
        let devices = devices
            .iter()
            .map(|d| {
                (
                    d.id.clone(),
                    DeviceTags {
                        name: d.display_name().to_string(),
                        location: d.location.clone(),
                    },
                )
            })
            .collect();

        Ok(Self {
            config,
            client,
            devices,
        })
    }

    fn write_url(&self) -> String {
        format!("{}/api/v2/write", self.config.url.trim_end_matches('/'))
    }

    /// One line-protocol record, millisecond precision
    pub fn to_line_protocol(&self, reading: &ProcessedReading) -> String {
        let mut line = escape_measurement(&self.config.measurement);

        let mut push_tag = |key: &str, value: &str| {
            if value.is_empty() {
                return;
            }
            line.push(',');
            line.push_str(key);
            line.push('=');
            line.push_str(&escape_tag(value));
        };
        push_tag("device", &reading.device_id);
        if let Some(tags) = self.devices.get(&reading.device_id) {
            push_tag("name", &tags.name);
            if let Some(location) = &tags.location {
                push_tag("location", location);
            }
        }
        push_tag("channel", &reading.channel.to_string());
        push_tag("quality", reading.quality.as_str());
        push_tag("unit", &reading.unit);

        line.push_str(&format!(
            " raw={}i,processed={},rate={} {}",
            i64::try_from(reading.raw_value).unwrap_or(i64::MAX),
            float_field(reading.processed_value),
            float_field(reading.rate),
            reading.timestamp.timestamp_millis()
        ));
        line
    }
}

#[async_trait]
impl ReadingSink for InfluxStore {
    async fn write_batch(&self, readings: &[ProcessedReading]) -> Result<(), StorageError> {
        if readings.is_empty() {
            return Ok(());
        }

        let body = readings
            .iter()
            .map(|r| self.to_line_protocol(r))
            .collect::<Vec<_>>()
            .join("\n");

        let mut request = self
            .client
            .post(self.write_url())
            .query(&[
                ("org", self.config.org.as_str()),
                ("bucket", self.config.bucket.as_str()),
                ("precision", "ms"),
            ])
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body);
        if !self.config.token.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.config.token));
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            debug!("Wrote {} points to InfluxDB", readings.len());
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        error!("InfluxDB write failed: {} - {}", status, body);
        let message = format!("{} - {}", status, body);
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(StorageError::Unavailable(message))
        } else {
            Err(StorageError::Rejected(message))
        }
    }

    fn name(&self) -> &str {
        "influxdb"
    }
}

fn escape_measurement(value: &str) -> String {
    value.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(value: &str) -> String {
    value
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

/// Floats always carry a decimal point so Influx does not infer an integer
fn float_field(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::pipeline::Quality;
    use chrono::{TimeZone, Utc};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn devices() -> Vec<DeviceConfig> {
        serde_yaml::from_str(
            r#"
- id: adam-01
  name: Line 1
  location: hall a
  host: 127.0.0.1
  channels: []
"#,
        )
        .unwrap()
    }

    fn store(url: &str) -> InfluxStore {
        InfluxStore::new(
            InfluxConfig {
                url: url.to_string(),
                org: "plant".to_string(),
                bucket: "counters".to_string(),
                token: "secret".to_string(),
                measurement: "counter_data".to_string(),
            },
            &devices(),
            Duration::from_secs(2),
        )
        .unwrap()
    }

    fn reading() -> ProcessedReading {
        ProcessedReading {
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
            device_id: "adam-01".to_string(),
            channel: 3,
            raw_value: 1200,
            processed_value: 12.0,
            rate: 0.25,
            quality: Quality::Good,
            unit: "m3".to_string(),
        }
    }

    #[test]
    fn test_line_protocol_format() {
        let line = store("http://localhost:8086").to_line_protocol(&reading());
        assert_eq!(
            line,
            "counter_data,device=adam-01,name=Line\\ 1,location=hall\\ a,channel=3,quality=good,unit=m3 \
             raw=1200i,processed=12.0,rate=0.25 1700000000123"
        );
    }

    #[test]
    fn test_tag_escaping() {
        assert_eq!(escape_tag("a,b=c d"), "a\\,b\\=c\\ d");
        assert_eq!(escape_measurement("my meas"), "my\\ meas");
    }

    /// One-shot HTTP responder; returns the captured request text
    async fn http_stub(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut request = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!("{}\r\ncontent-length: 4\r\nconnection: close\r\n\r\nnope", status_line);
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_write_sends_line_protocol() {
        let (url, server) = http_stub("HTTP/1.1 200 OK").await;
        store(&url).write_batch(&[reading()]).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/v2/write?org=plant&bucket=counters&precision=ms"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret"));
        assert!(request.contains("raw=1200i"));
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let (url, _server) = http_stub("HTTP/1.1 503 Service Unavailable").await;
        let err = store(&url).write_batch(&[reading()]).await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_bad_request_is_rejected() {
        let (url, _server) = http_stub("HTTP/1.1 400 Bad Request").await;
        let err = store(&url).write_batch(&[reading()]).await.unwrap_err();
        assert!(matches!(err, StorageError::Rejected(_)));
        assert!(!err.is_retryable());
    }
}
