//! Daemon configuration
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables. Every section and field has a default, so an empty file (or
//! no file) is a valid configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use twin_api::AuthConfig;
use twin_client::ClientConfig;
use twin_core::BackendCredentials;
use twin_ingest::{
    BackoffConfig, BackpressurePolicy, InfluxConfig, PipelineConfig, RestartPolicy,
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_FILTER,
};
use url::Url;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub influxdb: InfluxConfig,
    pub auth: AuthConfig,
    pub gateway: GatewayConfig,
    pub ingestion: IngestionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
        }
    }
}

/// Twin backend connection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    /// Full event stream URL; derived from `url` when unset
    pub ws_url: Option<String>,
    /// Subject granted access by auto-created policies
    pub policy_subject: Option<String>,
    pub request_timeout_secs: Option<f64>,
    pub connect_timeout_secs: Option<f64>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            username: "ditto".to_string(),
            password: "ditto".to_string(),
            ws_url: None,
            policy_subject: None,
            request_timeout_secs: None,
            connect_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub external_prefix: String,
    pub auto_create_policy: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            external_prefix: twin_core::routing::DEFAULT_EXTERNAL_PREFIX.to_string(),
            auto_create_policy: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    #[default]
    Never,
    Backoff,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub enabled: bool,
    pub filter: String,
    pub channel_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub restart: RestartMode,
    pub backoff: BackoffConfig,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            filter: DEFAULT_FILTER.to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure: BackpressurePolicy::default(),
            restart: RestartMode::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl IngestionConfig {
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            filter: self.filter.clone(),
            channel_capacity: self.channel_capacity,
            backpressure: self.backpressure,
        }
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        match self.restart {
            RestartMode::Never => RestartPolicy::Never,
            RestartMode::Backoff => RestartPolicy::Backoff(self.backoff),
        }
    }
}

impl Config {
    /// Read the file (if any), apply process environment overrides and
    /// validate.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Override fields from environment-style variables. Empty values are
    /// ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("DITTO_URL") {
            self.backend.url = v;
        }
        if let Some(v) = get("DITTO_USERNAME") {
            self.backend.username = v;
        }
        if let Some(v) = get("DITTO_PASSWORD") {
            self.backend.password = v;
        }
        if let Some(v) = get("DITTO_WS_URL") {
            self.backend.ws_url = Some(v);
        }
        if let Some(v) = get("INFLUXDB_URL") {
            self.influxdb.url = v;
        }
        if let Some(v) = get("INFLUXDB_TOKEN") {
            self.influxdb.token = v;
        }
        if let Some(v) = get("INFLUXDB_ORG") {
            self.influxdb.org = v;
        }
        if let Some(v) = get("INFLUXDB_BUCKET") {
            self.influxdb.bucket = v;
        }
        if let Some(v) = get("PROXY_AUTH_USERNAME") {
            self.auth.username = Some(v);
        }
        if let Some(v) = get("PROXY_AUTH_PASSWORD") {
            self.auth.password = Some(v);
        }
        if let Some(v) = get("PORT") {
            self.server.port = v
                .parse()
                .with_context(|| format!("PORT is not a valid port: {}", v))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        Url::parse(&self.backend.url)
            .with_context(|| format!("Invalid backend url: {}", self.backend.url))?;
        if let Some(ws_url) = &self.backend.ws_url {
            Url::parse(ws_url).with_context(|| format!("Invalid backend ws_url: {}", ws_url))?;
        }
        if self.auth.password.is_some() && self.auth.username.is_none() {
            anyhow::bail!("auth.password is set without auth.username");
        }
        if self.ingestion.enabled && self.ingestion.channel_capacity == 0 {
            anyhow::bail!("ingestion.channel_capacity must be at least 1");
        }
        self.client_config()?;
        Ok(())
    }

    pub fn credentials(&self) -> BackendCredentials {
        BackendCredentials::new(&self.backend.username, &self.backend.password)
    }

    pub fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let events_url = self
            .backend
            .ws_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .context("Invalid backend ws_url")?;
        Ok(ClientConfig {
            request_timeout: self
                .backend
                .request_timeout_secs
                .map(|secs| timeout("backend.request_timeout_secs", secs))
                .transpose()?,
            connect_timeout: self
                .backend
                .connect_timeout_secs
                .map(|secs| timeout("backend.connect_timeout_secs", secs))
                .transpose()?,
            events_url,
            policy_subject: self.backend.policy_subject.clone(),
        })
    }
}

/// A positive, finite number of seconds
fn timeout(field: &str, secs: f64) -> anyhow::Result<Duration> {
    let duration = Duration::try_from_secs_f64(secs)
        .with_context(|| format!("{} is not a valid duration: {}", field, secs))?;
    if duration.is_zero() {
        anyhow::bail!("{} must be greater than zero", field);
    }
    Ok(duration)
}
