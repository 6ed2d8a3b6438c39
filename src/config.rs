//! Bridge configuration, read from a TOML file
//!
//! ```toml
//! log_level = "info"
//!
//! [broker]
//! host = "mqtt.local"
//! port = 1883
//! username = "bridge"
//! password = "..."
//!
//! [smartthings]
//! location_id = "..."
//!
//! [bridge]
//! topic_namespace = "smartthings"
//! bridge_to_st_auth_token = "..."
//! st_to_bridge_auth_token = "..."
//!
//! [server]
//! listen = "0.0.0.0:1983"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::mqtt::MqttConfig;
use crate::smartthings::DEFAULT_ENDPOINTS_URL;

const CONFIG_DIR: &str = "smartthings2mqtt";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration:\n  {}", .0.join("\n  "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub broker: MqttConfig,
    pub smartthings: SmartThingsConfig,
    pub bridge: BridgeConfig,
    pub server: ServerConfig,
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SmartThingsConfig {
    pub location_id: String,
    pub endpoints_url: String,
}

impl Default for SmartThingsConfig {
    fn default() -> Self {
        Self {
            location_id: String::new(),
            endpoints_url: DEFAULT_ENDPOINTS_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub topic_namespace: String,
    pub status_topic: String,
    /// Sent to the SmartApp
    pub bridge_to_st_auth_token: String,
    /// Expected from the SmartApp on every notification
    pub st_to_bridge_auth_token: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            topic_namespace: "smartthings".to_string(),
            status_topic: "smartthings2mqtt/status".to_string(),
            bridge_to_st_auth_token: String::new(),
            st_to_bridge_auth_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 1983)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl Settings {
    /// `<config dir>/smartthings2mqtt/config.toml`
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Reads and validates the file at `path`. A missing file falls back to the
    /// defaults, which do not validate on their own.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let settings = if exists {
            debug!("Loading configuration from {}", path.display());
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            Self::parse(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            warn!("{} does not exist, using defaults", path.display());
            Self::default()
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Collects every problem instead of stopping at the first one
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = self.broker.validate();

        if self.smartthings.location_id.trim().is_empty() {
            problems.push("smartthings.location_id not configured.".to_string());
        }
        if self.smartthings.endpoints_url.trim().is_empty() {
            problems.push("smartthings.endpoints_url not configured.".to_string());
        }
        if self.bridge.topic_namespace.trim().is_empty() {
            problems.push("bridge.topic_namespace not configured.".to_string());
        } else if self.bridge.topic_namespace.contains(['#', '+', '/']) {
            problems.push(format!(
                "bridge.topic_namespace '{}' must be a single topic level.",
                self.bridge.topic_namespace
            ));
        }
        if self.bridge.status_topic.trim().is_empty() {
            problems.push("bridge.status_topic not configured.".to_string());
        }
        if self.bridge.bridge_to_st_auth_token.trim().is_empty() {
            problems.push("bridge.bridge_to_st_auth_token not configured.".to_string());
        }
        if self.bridge.st_to_bridge_auth_token.trim().is_empty() {
            problems.push("bridge.st_to_bridge_auth_token not configured.".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        log_level = "debug"

        [broker]
        host = "mqtt.local"
        username = "bridge"
        password = "pw"

        [smartthings]
        location_id = "home"

        [bridge]
        bridge_to_st_auth_token = "to-st"
        st_to_bridge_auth_token = "from-st"

        [server]
        listen = "127.0.0.1:8080"
    "#;

    #[test]
    fn parses_and_fills_defaults() {
        let settings = Settings::parse(FULL).unwrap();

        assert_eq!(settings.broker.host, "mqtt.local");
        assert_eq!(settings.broker.port, 1883);
        assert_eq!(settings.broker.client_id, "SmartThings2MQTT");
        assert_eq!(settings.smartthings.endpoints_url, DEFAULT_ENDPOINTS_URL);
        assert_eq!(settings.bridge.topic_namespace, "smartthings");
        assert_eq!(settings.bridge.status_topic, "smartthings2mqtt/status");
        assert_eq!(settings.server.listen.port(), 8080);
        assert_eq!(settings.log_level, LogLevel::Debug);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn validation_reports_every_problem() {
        let Err(ConfigError::Invalid(problems)) = Settings::default().validate() else {
            panic!("defaults must not validate");
        };

        assert!(problems.iter().any(|p| p.contains("broker.host")));
        assert!(problems.iter().any(|p| p.contains("location_id")));
        assert!(problems.iter().any(|p| p.contains("bridge_to_st_auth_token")));
        assert!(problems.iter().any(|p| p.contains("st_to_bridge_auth_token")));
    }

    #[test]
    fn namespace_must_be_one_level() {
        let mut settings = Settings::parse(FULL).unwrap();
        settings.bridge.topic_namespace = "home/st".into();

        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(p)) if p.len() == 1));
    }

    #[tokio::test]
    async fn missing_file_fails_validation() {
        let path = std::env::temp_dir().join("smartthings2mqtt-does-not-exist.toml");
        assert!(matches!(
            Settings::load(&path).await,
            Err(ConfigError::Invalid(_))
        ));
    }
}
