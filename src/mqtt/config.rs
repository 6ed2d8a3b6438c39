use serde::{Deserialize, Serialize};
use std::fmt;

/// Broker connection settings (`[broker]` section)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            username: None,
            password: None,
            client_id: "SmartThings2MQTT".to_string(),
            keep_alive_secs: 10,
        }
    }
}

impl MqttConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.host.trim().is_empty() {
            problems.push("broker.host not configured.".to_string());
        }
        if self.port == 0 {
            problems.push(format!("broker.port {} is invalid.", self.port));
        }
        if self.client_id.trim().is_empty() {
            problems.push("broker.client_id not configured.".to_string());
        }
        problems
    }
}

impl fmt::Display for MqttConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.username {
            Some(user) => write!(f, "{}@{}:{}", user, self.host, self.port),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}
