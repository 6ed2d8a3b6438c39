//! Payloads exchanged with the SmartApp

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Snapshot of one device as reported by the SmartApp.
///
/// Property names are stored lower-cased so lookups are case-insensitive. A value
/// of `None` (or a blank string) means the device did not report it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "lowercase_properties")]
    pub properties: BTreeMap<String, Option<String>>,
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, name: &str, value: impl Into<String>) -> Self {
        self.properties
            .insert(name.to_lowercase(), Some(value.into()));
        self
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .get(&name.to_lowercase())
            .and_then(|value| value.as_deref())
    }

    pub fn has_id(&self, id: &str) -> bool {
        self.id.eq_ignore_ascii_case(id)
    }
}

fn lowercase_properties<'de, D>(deserializer: D) -> Result<BTreeMap<String, Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, serde_json::Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(name, value)| {
            let value = match value {
                serde_json::Value::Null => None,
                serde_json::Value::String(text) => Some(text),
                other => Some(other.to_string()),
            };
            (name.to_lowercase(), value)
        })
        .collect())
}

#[derive(Debug, Deserialize)]
pub(crate) struct DevicesResponse {
    #[serde(default)]
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Location {
    pub id: String,
}

/// One installed SmartApp endpoint, as listed by the endpoints API
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EndpointInfo {
    pub location: Location,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Routine {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    #[serde(alias = "Device")]
    Device,
    #[serde(alias = "Routine")]
    Routine,
}

/// Body of a SmartApp → bridge notification
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HookRequest {
    pub kind: HookKind,
    #[serde(default)]
    pub device: Option<Device>,
    #[serde(default)]
    pub routine: Option<Routine>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}
