//! # MQTT Module
//!
//! The bridge's side of the broker: one shared session that publishes device state,
//! deduplicates values per topic and fans inbound messages out to observers.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker connection settings
//! ├── error.rs            - Session error type
//! ├── message_manager.rs  - Inbound messages and observer streams
//! ├── mqtt_handler.rs     - Session handle and its worker state machine
//! ├── topic_cache.rs      - Last value seen per topic
//! └── transport.rs        - Wire primitive, rumqttc backed
//! ```
//!
//! ## Behaviour
//!
//! - The broker connection is opened lazily by the first publish or subscribe and
//!   reopened the same way after it drops.
//! - Every connection registers a retained `offline` will on the status topic and
//!   then publishes a retained `online` birth message.
//! - Values are compared case-insensitively. A publish of a value the cache already
//!   holds for that topic is skipped, and an inbound message repeating the cached
//!   value is not delivered. Outbound and inbound share the same cache, so the
//!   bridge's own publishes do not echo back to observers.
//! - Losing the connection clears the cache and the subscription set and ends all
//!   observer streams with [`MqttError::Disconnected`].

pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod topic_cache;
pub mod transport;

pub use config::MqttConfig;
pub use error::MqttError;
pub use message_manager::{MessageStream, MqttMessage};
pub use mqtt_handler::{MqttSession, MqttSessionSettings};
pub use rumqttc::QoS;
pub use topic_cache::TopicValueCache;
pub use transport::{RumqttcTransport, Transport, TransportEvent, Will};
