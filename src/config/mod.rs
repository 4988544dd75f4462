//! # Configuration Management Module
//!
//! Centralized, TOML-backed configuration for the bridge. The loaded [`Config`]
//! is an explicit value handed to each component's constructor; nothing reads
//! configuration from global state.
//!
//! ## Configuration Structure
//!
//! - [`BrokerConfig`] - MQTT broker address, credentials and topic filters (inbound link)
//! - [`DeviceConfig`] - Meshtastic TCP API endpoint, retry and backoff tuning (outbound link)
//! - [`ChannelConfig`] - Dedicated bot channel topic pair
//! - [`BridgeConfig`] - Identity label, private mode, banner and reply policy
//! - [`ResponderConfig`] - Which responder answers messages
//! - [`LoggingConfig`] - Logging and debugging settings
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshbridge::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("Broker: {}:{}", config.broker.host, config.broker.port);
//!
//!     Config::create_default("config.toml").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [broker]
//! host = "10.0.0.159"
//! port = 1883
//!
//! [device]
//! host = "10.0.0.133"
//! port = 4403
//!
//! [channel]
//! enabled = true
//! topic = "msh/US/2/json/llm/"
//! response_topic = "msh/US/2/json/llmres/"
//!
//! [bridge]
//! private_mode = false
//! startup_banner = true
//! ```
//!
//! Every section is optional; missing keys take the defaults below. CLI flags on
//! `meshbridge start` override file values.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

/// Channel index used when no live channel name matches the requested one.
pub const DEFAULT_CHANNEL_INDEX: u32 = 2;

/// Channel name used when the response topic has no usable segment.
pub const DEFAULT_RESPONSE_CHANNEL: &str = "llmres";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub responder: ResponderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Empty means anonymous.
    pub username: String,
    pub password: String,
    /// A random suffix is appended per session so restarts never collide.
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    /// Bounded wait for the first CONNACK.
    pub connect_timeout_secs: u64,
    pub regular_topic: String,
    pub nodeinfo_topic: String,
    /// Topic that asks gateways to re-announce node info.
    pub nodeinfo_request_topic: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client_id_prefix: "meshtastic-llm-agent".to_string(),
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            regular_topic: "msh/+/rx".to_string(),
            nodeinfo_topic: "msh/+/nodeinfo".to_string(),
            nodeinfo_request_topic: "msh/request/nodeinfo".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn client_id(&self) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.client_id_prefix, &suffix[..12])
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Empty means "same host as the broker".
    pub host: String,
    pub port: u16,
    /// Retries for the initial connect (attempts = retries + 1).
    pub connect_retries: u32,
    /// Retries for reconnects triggered by a failed send.
    pub reconnect_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub handshake_timeout_secs: u64,
    /// Pause between chunks of a multi-part message.
    pub chunk_pause_ms: u64,
    /// Interval between keepalive heartbeats (0 disables).
    pub heartbeat_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_channel_index: Option<u32>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 4403,
            connect_retries: 4,
            reconnect_retries: 2,
            backoff_base_ms: 2000,
            backoff_cap_ms: 30_000,
            handshake_timeout_secs: 10,
            chunk_pause_ms: 1000,
            heartbeat_secs: 300,
            default_channel_index: None,
        }
    }
}

impl DeviceConfig {
    pub fn effective_host<'a>(&'a self, broker: &'a BrokerConfig) -> &'a str {
        if self.host.trim().is_empty() {
            &broker.host
        } else {
            &self.host
        }
    }

    pub fn default_channel_index(&self) -> u32 {
        self.default_channel_index.unwrap_or(DEFAULT_CHANNEL_INDEX)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn chunk_pause(&self) -> Duration {
        Duration::from_millis(self.chunk_pause_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub enabled: bool,
    pub topic: String,
    pub response_topic: String,
    /// Device channel used for replies; derived from `response_topic` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_channel_name: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: "msh/US/2/json/llm/".to_string(),
            response_topic: "msh/US/2/json/llmres/".to_string(),
            response_channel_name: None,
        }
    }
}

impl ChannelConfig {
    /// Explicit name, else the last non-empty segment of the response topic,
    /// else [`DEFAULT_RESPONSE_CHANNEL`].
    pub fn response_channel_name(&self) -> String {
        if let Some(name) = self.response_channel_name.as_deref() {
            if !name.trim().is_empty() {
                return name.trim().to_string();
            }
        }
        self.response_topic
            .split('/')
            .filter(|part| !part.is_empty())
            .last()
            .unwrap_or(DEFAULT_RESPONSE_CHANNEL)
            .to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Node long name the bridge answers to; senders with this name are the bridge itself.
    pub identity_label: String,
    /// Reply directly to the sender even for broadcast traffic.
    pub private_mode: bool,
    pub startup_banner: bool,
    /// Banner prefix. Inbound text starting with it is treated as our own echo.
    pub banner_text: String,
    /// Also send dedicated-channel replies straight to the sender before the channel send.
    pub mirror_dedicated_direct: bool,
    pub reply_retries: u32,
    pub reply_retry_delay_ms: u64,
    pub queue_join_timeout_ms: u64,
    pub shutdown_send_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            identity_label: "llm_agent".to_string(),
            private_mode: false,
            startup_banner: false,
            banner_text: "📢 LLM Agent is now online and ready for conversations!".to_string(),
            mirror_dedicated_direct: false,
            reply_retries: 2,
            reply_retry_delay_ms: 2000,
            queue_join_timeout_ms: 2000,
            shutdown_send_timeout_ms: 5000,
        }
    }
}

impl BridgeConfig {
    pub fn reply_retry_delay(&self) -> Duration {
        Duration::from_millis(self.reply_retry_delay_ms)
    }

    pub fn queue_join_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_join_timeout_ms)
    }

    pub fn shutdown_send_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_send_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponderKind {
    Echo,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    pub kind: ResponderKind,
    /// OpenAI-compatible chat completions URL (http kind only).
    pub endpoint: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub system_prompt: String,
    /// Turns kept per user.
    pub max_history: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub timeout_secs: u64,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            kind: ResponderKind::Echo,
            endpoint: String::new(),
            model: "mistral-7b-instruct".to_string(),
            api_key: None,
            system_prompt: "You are a helpful AI assistant connected via Meshtastic mesh network. \
Keep your responses concise as they need to be transmitted over a low-bandwidth network."
                .to_string(),
            max_history: 10,
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file and validate it.
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config
            .validate()
            .map_err(|e| anyhow!("Invalid config file {}: {}", path, e))?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker.host.trim().is_empty() {
            bail!("broker.host must not be empty");
        }
        if self.broker.port == 0 {
            bail!("broker.port must be non-zero");
        }
        if self.device.port == 0 {
            bail!("device.port must be non-zero");
        }
        if self.channel.enabled
            && (self.channel.topic.trim().is_empty() || self.channel.response_topic.trim().is_empty())
        {
            bail!("channel.topic and channel.response_topic are required when the channel is enabled");
        }
        if self.bridge.identity_label.trim().is_empty() {
            bail!("bridge.identity_label must not be empty");
        }
        if self.bridge.banner_text.trim().is_empty() {
            bail!("bridge.banner_text must not be empty");
        }
        if self.device.backoff_base_ms > self.device.backoff_cap_ms {
            bail!(
                "device.backoff_base_ms ({}) exceeds device.backoff_cap_ms ({})",
                self.device.backoff_base_ms,
                self.device.backoff_cap_ms
            );
        }
        if self.responder.kind == ResponderKind::Http && self.responder.endpoint.trim().is_empty() {
            bail!("responder.endpoint is required for the http responder");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.device.port, 4403);
        assert_eq!(config.device.default_channel_index(), DEFAULT_CHANNEL_INDEX);
        assert_eq!(config.bridge.reply_retries, 2);
    }

    #[test]
    fn response_channel_name_uses_last_topic_segment() {
        let mut channel = ChannelConfig::default();
        assert_eq!(channel.response_channel_name(), "llmres");

        channel.response_topic = "msh/EU/0/json/answers".to_string();
        assert_eq!(channel.response_channel_name(), "answers");

        channel.response_topic = "///".to_string();
        assert_eq!(channel.response_channel_name(), DEFAULT_RESPONSE_CHANNEL);

        channel.response_channel_name = Some(" Bot ".to_string());
        assert_eq!(channel.response_channel_name(), "Bot");
    }

    #[test]
    fn device_host_falls_back_to_broker_host() {
        let mut config = Config::default();
        config.broker.host = "10.0.0.159".to_string();
        assert_eq!(config.device.effective_host(&config.broker), "10.0.0.159");
        config.device.host = "10.0.0.133".to_string();
        assert_eq!(config.device.effective_host(&config.broker), "10.0.0.133");
    }

    #[test]
    fn partial_file_takes_defaults() {
        let config: Config = toml::from_str(
            r#"
            [broker]
            host = "mqtt.local"

            [bridge]
            private_mode = true

            [responder]
            kind = "http"
            endpoint = "http://127.0.0.1:8080/v1/chat/completions"
            "#,
        )
        .unwrap();
        assert_eq!(config.broker.host, "mqtt.local");
        assert_eq!(config.broker.port, 1883);
        assert!(config.bridge.private_mode);
        assert_eq!(config.bridge.identity_label, "llm_agent");
        assert_eq!(config.responder.kind, ResponderKind::Http);
        config.validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.device.backoff_base_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.channel.response_topic.clear();
        assert!(config.validate().is_err());
        config.channel.enabled = false;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.responder.kind = ResponderKind::Http;
        assert!(config.validate().is_err());
    }

    #[test]
    fn client_ids_are_unique_per_session() {
        let broker = BrokerConfig::default();
        let a = broker.client_id();
        let b = broker.client_id();
        assert!(a.starts_with("meshtastic-llm-agent-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn create_default_round_trips_through_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.channel.topic, Config::default().channel.topic);
        assert_eq!(loaded.device.backoff_cap_ms, 30_000);
    }
}
