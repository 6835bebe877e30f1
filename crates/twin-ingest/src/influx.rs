//! InfluxDB v2 sink
//!
//! One line-protocol point per sample, posted to `/api/v2/write` with
//! nanosecond precision.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};
use twin_core::{Sample, SinkError, SinkResult, TimeSeriesSink};
use url::Url;

use crate::error::{IngestError, IngestResult};

/// Measurement written when none is configured
pub const DEFAULT_MEASUREMENT: &str = "websocket_events";

/// InfluxDB connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub measurement: String,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            token: String::new(),
            org: String::new(),
            bucket: String::new(),
            measurement: DEFAULT_MEASUREMENT.to_string(),
        }
    }
}

/// Writes samples to InfluxDB, one request per sample
#[derive(Debug, Clone)]
pub struct InfluxSink {
    client: Client,
    write_url: Url,
    auth: String,
    measurement: String,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig) -> IngestResult<Self> {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(client: Client, config: &InfluxConfig) -> IngestResult<Self> {
        if config.org.is_empty() || config.bucket.is_empty() {
            return Err(IngestError::Config(
                "influxdb org and bucket must be set".to_string(),
            ));
        }
        if config.measurement.is_empty() {
            return Err(IngestError::Config(
                "influxdb measurement must not be empty".to_string(),
            ));
        }

        let mut write_url = Url::parse(&format!(
            "{}/api/v2/write",
            config.url.trim_end_matches('/')
        ))
        .map_err(|e| IngestError::Config(format!("invalid influxdb url: {}", e)))?;
        write_url
            .query_pairs_mut()
            .append_pair("org", &config.org)
            .append_pair("bucket", &config.bucket)
            .append_pair("precision", "ns");

        Ok(Self {
            client,
            write_url,
            auth: format!("Token {}", config.token),
            measurement: config.measurement.clone(),
        })
    }

    pub fn write_url(&self) -> &Url {
        &self.write_url
    }
}

#[async_trait]
impl TimeSeriesSink for InfluxSink {
    #[instrument(skip(self, sample), fields(entity = %sample.entity_id, feature = %sample.feature))]
    async fn write(&self, sample: &Sample) -> SinkResult<()> {
        let line = to_line_protocol(&self.measurement, sample)?;
        debug!(%line, "Writing point");

        let response = self
            .client
            .post(self.write_url.clone())
            .header(reqwest::header::AUTHORIZATION, &self.auth)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(line)
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(SinkError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Render one sample as a line-protocol point:
/// `measurement,device_id=..,feature_name=.. value=.. <ns>`
///
/// ```
/// # use chrono::TimeZone;
/// # use twin_core::Sample;
/// # use twin_ingest::influx::to_line_protocol;
/// let ts = chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap();
/// let line = to_line_protocol("websocket_events", &Sample::new("ns:s1", "temp", 21.5, ts)).unwrap();
/// assert_eq!(line, "websocket_events,device_id=ns:s1,feature_name=temp value=21.5 1700000000000000000");
/// ```
pub fn to_line_protocol(measurement: &str, sample: &Sample) -> SinkResult<String> {
    if sample.entity_id.is_empty() {
        return Err(SinkError::InvalidPoint("empty device_id tag".to_string()));
    }
    if sample.feature.is_empty() {
        return Err(SinkError::InvalidPoint("empty feature_name tag".to_string()));
    }
    for (name, text) in [
        ("measurement", measurement),
        ("device_id tag", sample.entity_id.as_str()),
        ("feature_name tag", sample.feature.as_str()),
    ] {
        // line protocol has no escape for line breaks
        if text.contains(['\n', '\r']) {
            return Err(SinkError::InvalidPoint(format!(
                "line break in {}: {:?}",
                name, text
            )));
        }
    }
    if !sample.value.is_finite() {
        return Err(SinkError::InvalidPoint(format!(
            "non-finite value {}",
            sample.value
        )));
    }
    let nanos = sample.timestamp.timestamp_nanos_opt().ok_or_else(|| {
        SinkError::InvalidPoint(format!("timestamp {} out of range", sample.timestamp))
    })?;

    Ok(format!(
        "{},device_id={},feature_name={} value={} {}",
        escape_measurement(measurement),
        escape_tag(&sample.entity_id),
        escape_tag(&sample.feature),
        sample.value,
        nanos
    ))
}

fn escape_measurement(s: &str) -> String {
    escape(s, &[',', ' '])
}

fn escape_tag(s: &str) -> String {
    escape(s, &[',', '=', ' '])
}

fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
