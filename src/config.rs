//! TOML configuration for the sample binary
//!
//! The core library takes `MqttOptions` directly; this module maps a
//! config file onto those options plus the TLS settings. Credentials are
//! never stored in the file: `username_env` names an environment variable
//! that is read at load time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::MqttOptions;
use crate::transport::TlsSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub client: ClientSection,
    pub broker: BrokerSection,
    pub tls: TlsSection,
    #[serde(default)]
    pub publish: PublishSection,
    #[serde(default)]
    pub subscribe: SubscribeSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSection {
    /// Client id; generated with a random suffix when absent
    pub id: Option<String>,
    /// Environment variable holding the broker username
    pub username_env: Option<String>,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            id: None,
            username_env: None,
            clean_session: default_clean_session(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerSection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSection {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublishSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub topic: Option<String>,
    pub message: Option<String>,
    #[serde(default = "default_publish_interval_secs")]
    pub interval_secs: u64,
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: None,
            message: None,
            interval_secs: default_publish_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SubscribeSection {
    #[serde(default)]
    pub enabled: bool,
    pub topic: Option<String>,
}

fn default_clean_session() -> bool {
    true
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_port() -> u16 {
    8883
}

fn default_true() -> bool {
    true
}

fn default_publish_interval_secs() -> u64 {
    2
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.host must not be empty".to_string(),
            ));
        }
        if !self.publish.enabled && !self.subscribe.enabled {
            return Err(ConfigError::InvalidConfig(
                "at least one of publish or subscribe must be enabled".to_string(),
            ));
        }
        if self.publish.enabled {
            if self.publish.topic.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "publish.topic is required when publishing".to_string(),
                ));
            }
            if self.publish.message.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "publish.message is required when publishing".to_string(),
                ));
            }
        }
        if self.subscribe.enabled && self.subscribe.topic.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::InvalidConfig(
                "subscribe.topic is required when subscribing".to_string(),
            ));
        }
        Ok(())
    }

    /// Build connection options, resolving the username from the
    /// environment when `username_env` is set.
    pub fn mqtt_options(&self) -> Result<MqttOptions, ConfigError> {
        let mut options = match &self.client.id {
            Some(id) => MqttOptions::new(id.clone()),
            None => MqttOptions::with_generated_id("mqttcore"),
        };
        options = options
            .keep_alive(Duration::from_secs(self.client.keep_alive_secs))
            .clean_session(self.client.clean_session);
        if let Some(var) = &self.client.username_env {
            let username = std::env::var(var).map_err(|_| {
                ConfigError::InvalidConfig(format!(
                    "environment variable {var} named by client.username_env is not set"
                ))
            })?;
            options = options.credentials(username, None);
        }
        Ok(options)
    }

    pub fn tls_settings(&self) -> TlsSettings {
        TlsSettings {
            cert_file: self.tls.cert_file.clone(),
            key_file: self.tls.key_file.clone(),
            ca_file: self.tls.ca_file.clone(),
        }
    }
}
