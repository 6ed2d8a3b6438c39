//! # Sync Module
//!
//! Bridges SmartThings devices and MQTT topics in both directions.
//!
//! ```text
//! SmartApp ──poll──► [ST => MQTT] ──publish──► broker
//!    ▲                     │ snapshot
//!    └──execute── [MQTT => ST] ◄──observe──────┘
//! ```
//!
//! Device properties live on `{namespace}/{device id}/{property}`. Writing to such a
//! topic runs the matching device command:
//!
//! | property    | value     | command                      |
//! |-------------|-----------|------------------------------|
//! | `switch`    | any       | the value (`on`, `off`)      |
//! | `level`     | integer   | `setLevel { level }`         |
//! | `nightmode` | `enabled` | `enableNightmode`            |
//! | `nightmode` | other     | `disableNightmode`           |
//!
//! Anything else is logged and dropped.

pub mod command;
pub mod error;
pub mod synchronizer;

pub use command::{property_topic, Command, TopicRoute};
pub use error::{CommandError, SyncError};
pub use synchronizer::{SyncSettings, SyncSnapshot, Synchronizer};
