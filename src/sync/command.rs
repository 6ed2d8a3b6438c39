//! Topic layout and the MQTT → device command table

use serde::Serialize;
use serde_json::{Map, Value};

use super::error::CommandError;

/// Topic a device property is mirrored to: `{namespace}/{device id}/{property}`, lower-cased
pub fn property_topic(namespace: &str, device_id: &str, property: &str) -> String {
    format!(
        "{}/{}/{}",
        namespace.to_lowercase(),
        device_id.to_lowercase(),
        property.to_lowercase()
    )
}

/// A device topic split back into its parts (all lower-cased)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRoute {
    pub namespace: String,
    pub device_id: String,
    pub property: String,
}

impl TopicRoute {
    /// Empty levels are ignored; everything after the device id is the property.
    pub fn parse(topic: &str) -> Option<Self> {
        let mut parts = topic.split('/').filter(|part| !part.is_empty());
        let namespace = parts.next()?.to_lowercase();
        let device_id = parts.next()?.to_lowercase();
        let property = parts.collect::<Vec<_>>().join("/").to_lowercase();
        if property.is_empty() {
            return None;
        }

        Some(Self {
            namespace,
            device_id,
            property,
        })
    }
}

/// A command the SmartApp executes on a device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub name: String,
    pub parameters: Map<String, Value>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Map::new(),
        }
    }

    pub fn with_parameter(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Maps a property change received over MQTT to the device command applying it.
    ///
    /// Returns `Ok(None)` for properties that cannot be controlled.
    pub fn from_property(property: &str, value: &str) -> Result<Option<Self>, CommandError> {
        let value = value.trim().to_lowercase();

        let command = match property.to_lowercase().as_str() {
            "switch" => Self::new(value),
            "level" => {
                let level: i64 = value
                    .parse()
                    .map_err(|_| CommandError::InvalidLevel(value.clone()))?;
                Self::new("setLevel").with_parameter("level", level)
            }
            "nightmode" if value == "enabled" => Self::new("enableNightmode"),
            "nightmode" => Self::new("disableNightmode"),
            _ => return Ok(None),
        };

        Ok(Some(command))
    }
}
