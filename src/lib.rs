//! SmartThings ⇄ MQTT bridge
//!
//! Mirrors the devices of a SmartThings location as retained MQTT topics and turns
//! writes to those topics back into device commands.

pub mod config;
pub mod mqtt;
pub mod smartthings;
pub mod sync;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConfigError, Settings};
pub use mqtt::{MqttSession, MqttSessionSettings};
pub use smartthings::{EndpointCache, SmartAppClient};
pub use sync::{SyncSettings, Synchronizer};
