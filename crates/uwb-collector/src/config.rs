// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! YAML configuration for the collector.
//!
//! ```yaml
//! mqtt:
//!   broker: "test.mosquitto.org"
//!   port: 1883
//!   topic: "uwb"
//!   client_id: "uwb-collector"
//! data:
//!   data_processed: "data/processed/"
//! ```

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default MQTT keep-alive in seconds.
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;

/// Default JSON field carrying the reading.
pub const DEFAULT_VALUE_FIELD: &str = "distance";

/// Top-level collector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Broker connection settings.
    pub mqtt: MqttConfig,
    /// Output settings.
    pub data: DataConfig,
}

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker host name or address.
    pub broker: String,
    /// Broker TCP port.
    pub port: u16,
    /// Topic prefix; the collector subscribes to `<topic>/#`.
    pub topic: String,
    /// MQTT client identifier.
    pub client_id: String,
    /// Username. Empty means no credentials.
    #[serde(default)]
    pub username: Option<String>,
    /// Password. Empty means no credentials.
    #[serde(default)]
    pub password: Option<String>,
    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Subscription QoS (0, 1 or 2).
    #[serde(default)]
    pub qos: u8,
}

/// Output settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    /// Output file or directory for the exported CSV files.
    pub data_processed: PathBuf,
    /// JSON field holding the reading.
    #[serde(default = "default_value_field")]
    pub value_field: String,
}

fn default_keep_alive() -> u64 {
    DEFAULT_KEEP_ALIVE_SECS
}

fn default_value_field() -> String {
    DEFAULT_VALUE_FIELD.to_string()
}

impl Config {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Reject settings the collector cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.broker.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt.broker is empty".to_string()));
        }
        if self.mqtt.port == 0 {
            return Err(ConfigError::Invalid("mqtt.port must be non-zero".to_string()));
        }
        if self.mqtt.topic.trim_end_matches('/').is_empty() {
            return Err(ConfigError::Invalid("mqtt.topic is empty".to_string()));
        }
        if self.mqtt.qos > 2 {
            return Err(ConfigError::Invalid(format!(
                "mqtt.qos must be 0, 1 or 2 (got {})",
                self.mqtt.qos
            )));
        }
        if self.data.value_field.is_empty() {
            return Err(ConfigError::Invalid("data.value_field is empty".to_string()));
        }
        Ok(())
    }
}

impl MqttConfig {
    /// Wildcard filter covering the prefix and every level below it.
    pub fn subscription_filter(&self) -> String {
        subscription_filter(&self.topic)
    }

    /// Credentials, only when both username and password are set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

/// Build `<prefix>/#`, tolerating a trailing slash on the prefix.
pub fn subscription_filter(prefix: &str) -> String {
    format!("{}/#", prefix.trim_end_matches('/'))
}
