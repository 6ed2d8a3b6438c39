//! # SmartThings Module
//!
//! Everything the bridge knows about the vendor side: the SmartApp's HTTP API,
//! the payloads it exchanges, and the cache resolving a location to the
//! installation that serves it.
//!
//! ```text
//! smartthings/
//! ├── client.rs          - DeviceCloud seam and its reqwest implementation
//! ├── endpoint.rs        - Active endpoint or placeholder
//! ├── endpoint_cache.rs  - Single-flight, circuit-breaking location lookup
//! ├── error.rs
//! └── model.rs           - Devices, endpoints, routines, webhook payload
//! ```

pub mod client;
pub mod endpoint;
pub mod endpoint_cache;
pub mod error;
pub mod model;

pub use client::{DeviceCloud, SmartAppClient, DEFAULT_ENDPOINTS_URL};
pub use endpoint::{Endpoint, INVALID_ENDPOINT_DURATION};
pub use endpoint_cache::{EndpointCache, MAX_ERROR_COUNT};
pub use error::{ApiError, EndpointError};
pub use model::{Device, EndpointInfo, HookKind, HookRequest, Location, Routine};
