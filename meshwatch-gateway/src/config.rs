use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use crate::error::ConfigError;
use crate::status::Thresholds;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub mesh: MeshConf,
    pub http: HttpConf,
    pub thresholds: Thresholds,
    pub alerts: AlertsConf,
    pub broadcast: BroadcastConf,
    pub staleness: StalenessConf,
}

/// Where the mesh radio's MQTT bridge publishes decoded packets.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MeshConf {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub topic: String, // ex: "msh/EU_868/2/json/#"
    pub keep_alive_secs: u64,
    pub retry_delay_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
    /// Origins allowed to open the subscriber endpoint. Empty allows all.
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AlertsConf {
    pub capacity: usize,
    pub snapshot_limit: usize,
    /// Per machine + alert kind suppression window. `None` keeps every alert.
    pub debounce_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BroadcastConf {
    pub handoff_capacity: usize,
    pub subscriber_queue: usize,
    pub send_timeout_secs: u64,
    pub ping_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StalenessConf {
    /// Silence after which a machine is treated as offline. `None` disables expiry.
    pub offline_after_secs: Option<u64>,
    pub check_interval_secs: u64,
}

impl Default for MeshConf {
    fn default() -> Self {
        Self {
            broker_host: "localhost".into(),
            broker_port: 1883,
            client_id: "meshwatch-gateway".into(),
            topic: "msh/#".into(),
            keep_alive_secs: 15,
            retry_delay_secs: 2,
        }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".into(),
            allowed_origins: vec!["http://localhost:5173".into(), "http://127.0.0.1:5173".into()],
        }
    }
}

impl Default for AlertsConf {
    fn default() -> Self {
        Self { capacity: 200, snapshot_limit: 50, debounce_secs: None }
    }
}

impl Default for BroadcastConf {
    fn default() -> Self {
        Self { handoff_capacity: 64, subscriber_queue: 32, send_timeout_secs: 5, ping_interval_secs: 30 }
    }
}

impl Default for StalenessConf {
    fn default() -> Self {
        Self { offline_after_secs: None, check_interval_secs: 30 }
    }
}

impl AlertsConf {
    pub fn debounce_window(&self) -> Option<Duration> {
        self.debounce_secs.map(Duration::from_secs)
    }
}

impl BroadcastConf {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds.validate().map_err(ConfigError::Invalid)?;
        if self.alerts.capacity == 0 {
            return Err(ConfigError::Invalid("alerts.capacity must be at least 1".into()));
        }
        if self.broadcast.handoff_capacity == 0 || self.broadcast.subscriber_queue == 0 {
            return Err(ConfigError::Invalid("broadcast queues must hold at least one frame".into()));
        }
        if self.broadcast.ping_interval_secs == 0 || self.staleness.check_interval_secs == 0 {
            return Err(ConfigError::Invalid("intervals must be at least one second".into()));
        }
        Ok(())
    }

    /// Applies `MESHWATCH_*` environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("MESHWATCH_BIND") {
            self.http.bind = bind;
        }
        if let Some(host) = lookup("MESHWATCH_MQTT_HOST") {
            self.mesh.broker_host = host;
        }
        if let Some(port) = lookup("MESHWATCH_MQTT_PORT") {
            match port.parse() {
                Ok(p) => self.mesh.broker_port = p,
                Err(_) => tracing::warn!(value = %port, "ignoring invalid MESHWATCH_MQTT_PORT"),
            }
        }
        if let Some(topic) = lookup("MESHWATCH_MQTT_TOPIC") {
            self.mesh.topic = topic;
        }
        if let Some(origins) = lookup("MESHWATCH_ALLOWED_ORIGINS") {
            self.http.allowed_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
    }
}

/// Parses and validates a YAML document. Empty input yields the defaults.
pub fn parse_config(txt: &str) -> Result<GatewayConfig, ConfigError> {
    if txt.trim().is_empty() {
        return Ok(GatewayConfig::default());
    }
    let cfg: GatewayConfig = serde_yaml::from_str(txt)?;
    cfg.validate()?;
    Ok(cfg)
}

pub async fn read_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let txt = fs::read_to_string(path).await?;
    parse_config(&txt)
}

/// Loads `gateway.yaml` (or `$MESHWATCH_CONFIG`), falling back to defaults on
/// any problem, then applies environment overrides.
pub async fn load_config() -> GatewayConfig {
    let path = std::env::var("MESHWATCH_CONFIG").unwrap_or_else(|_| "gateway.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        read_config(Path::new(&path)).await.unwrap_or_else(|e| {
            tracing::error!(%path, error = %e, "invalid config, using defaults");
            GatewayConfig::default()
        })
    } else {
        tracing::warn!(%path, "no config file, using defaults");
        GatewayConfig::default()
    };
    cfg.apply_env(|key| std::env::var(key).ok());
    cfg
}
