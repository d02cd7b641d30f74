//! Configuration for the Rallytime server
//!
//! Every field has a default, so an empty or partial TOML file is valid.

use anyhow::{Context, Result};
use rallytime_ingest::{IngestOptions, MqttSourceConfig, TopicLayout};
use rallytime_log::{EventLogOptions, TailOptions};
use rallytime_protocol::defaults::{
    DEFAULT_BACKOFF_INITIAL_MS, DEFAULT_BACKOFF_MAX_MS, DEFAULT_HTTP_BIND_ADDR,
    DEFAULT_MAX_FINISHES, DEFAULT_MQTT_KEEP_ALIVE_SECS, DEFAULT_MQTT_PORT,
    DEFAULT_MQTT_TOPIC_FILTER, DEFAULT_RETRY_HINT_MS, DEFAULT_TAIL_CHANNEL_CAPACITY,
    DEFAULT_TAIL_POLL_INTERVAL_MS,
};
use rallytime_timing::DecoderConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RallytimeConfig {
    /// Root of the gate partitions (`<data_root>/gates/...`)
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    #[serde(default)]
    pub log: LogSection,

    #[serde(default)]
    pub tail: TailSection,

    #[serde(default)]
    pub decoder: DecoderConfig,

    #[serde(default)]
    pub association: AssociationSection,

    #[serde(default)]
    pub http: HttpSection,

    #[serde(default)]
    pub mqtt: MqttSection,
}

fn default_data_root() -> PathBuf {
    rallytime_protocol::paths::default_data_root()
}

impl Default for RallytimeConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            log: LogSection::default(),
            tail: TailSection::default(),
            decoder: DecoderConfig::default(),
            association: AssociationSection::default(),
            http: HttpSection::default(),
            mqtt: MqttSection::default(),
        }
    }
}

impl RallytimeConfig {
    /// Load configuration from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: RallytimeConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSection {
    /// Flush every append to disk before returning
    #[serde(default = "default_true")]
    pub fsync: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            fsync: default_true(),
        }
    }
}

impl LogSection {
    pub fn options(&self) -> EventLogOptions {
        EventLogOptions { fsync: self.fsync }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Reconnect hint sent to stream clients
    #[serde(default = "default_retry_hint_ms")]
    pub retry_hint_ms: u64,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_TAIL_POLL_INTERVAL_MS
}

fn default_retry_hint_ms() -> u64 {
    DEFAULT_RETRY_HINT_MS
}

fn default_channel_capacity() -> usize {
    DEFAULT_TAIL_CHANNEL_CAPACITY
}

impl Default for TailSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            retry_hint_ms: default_retry_hint_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl TailSection {
    pub fn options(&self) -> TailOptions {
        TailOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            channel_capacity: self.channel_capacity.max(1),
        }
    }

    pub fn retry_hint(&self) -> Duration {
        Duration::from_millis(self.retry_hint_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationSection {
    /// Finishes kept in memory by `rallytime match`
    #[serde(default = "default_max_finishes")]
    pub max_finishes: usize,
}

fn default_max_finishes() -> usize {
    DEFAULT_MAX_FINISHES
}

impl Default for AssociationSection {
    fn default() -> Self {
        Self {
            max_finishes: default_max_finishes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    DEFAULT_HTTP_BIND_ADDR.to_string()
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttSection {
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Must have the form `<prefix>/+/pass`
    #[serde(default = "default_topic_filter")]
    pub topic_filter: String,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}

fn default_client_id() -> String {
    "rallytime-ingest".to_string()
}

fn default_topic_filter() -> String {
    DEFAULT_MQTT_TOPIC_FILTER.to_string()
}

fn default_keep_alive_secs() -> u64 {
    DEFAULT_MQTT_KEEP_ALIVE_SECS
}

fn default_backoff_initial_ms() -> u64 {
    DEFAULT_BACKOFF_INITIAL_MS
}

fn default_backoff_max_ms() -> u64 {
    DEFAULT_BACKOFF_MAX_MS
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            topic_filter: default_topic_filter(),
            keep_alive_secs: default_keep_alive_secs(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl MqttSection {
    pub fn source_config(&self) -> MqttSourceConfig {
        MqttSourceConfig {
            host: self.host.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            topic_filter: self.topic_filter.clone(),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
        }
    }

    pub fn ingest_options(&self) -> Result<IngestOptions> {
        let prefix = self
            .topic_filter
            .strip_suffix("/+/pass")
            .with_context(|| {
                format!(
                    "mqtt.topic_filter '{}' must have the form <prefix>/+/pass",
                    self.topic_filter
                )
            })?;
        Ok(IngestOptions {
            topics: TopicLayout::new(prefix)?,
            backoff_initial: Duration::from_millis(self.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rallytime_timing::Key;

    #[test]
    fn test_default_config() {
        let config = RallytimeConfig::default();
        assert!(config.log.fsync);
        assert_eq!(config.tail.poll_interval_ms, 500);
        assert_eq!(config.tail.retry_hint_ms, 2000);
        assert_eq!(config.decoder.min_length, 5);
        assert_eq!(config.decoder.terminators, vec![Key::Enter, Key::Tab]);
        assert_eq!(config.association.max_finishes, 200);
        assert_eq!(config.http.bind, "127.0.0.1:8080");
        assert_eq!(config.mqtt.port, 1883);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: RallytimeConfig = toml::from_str(
            r#"
            data_root = "/srv/rally"

            [decoder]
            min_length = 8
            terminators = ["Enter"]

            [mqtt]
            host = "broker.local"
            username = "rally"
            "#,
        )
        .unwrap();

        assert_eq!(config.data_root, PathBuf::from("/srv/rally"));
        assert_eq!(config.decoder.min_length, 8);
        assert_eq!(config.decoder.idle_reset_ms, 120);
        assert_eq!(config.decoder.terminators, vec![Key::Enter]);
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.username.as_deref(), Some("rally"));
        assert_eq!(config.mqtt.topic_filter, "rally/v1/gates/+/pass");
        assert_eq!(config.tail, TailSection::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("rallytime.toml");

        let mut config = RallytimeConfig {
            data_root: dir.path().join("data"),
            ..RallytimeConfig::default()
        };
        config.http.bind = "0.0.0.0:9000".to_string();
        config.mqtt.password = Some("timing".to_string());
        config.save(&path).unwrap();

        assert_eq!(RallytimeConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RallytimeConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.http, HttpSection::default());
    }

    #[test]
    fn test_ingest_options_from_filter() {
        let mqtt = MqttSection {
            topic_filter: "stage/7/+/pass".to_string(),
            ..MqttSection::default()
        };
        let options = mqtt.ingest_options().unwrap();
        assert_eq!(options.topics.prefix(), "stage/7");

        let bad = MqttSection {
            topic_filter: "stage/#".to_string(),
            ..MqttSection::default()
        };
        assert!(bad.ingest_options().is_err());
    }
}
