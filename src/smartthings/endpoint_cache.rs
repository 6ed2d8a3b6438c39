//! Location → endpoint resolution
//!
//! Lookups of a known, valid endpoint only take a read lock. Anything else goes
//! through a single refresh gate: one caller reloads every installation at once
//! while the others wait and then reuse its result. The refresh runs on its own
//! task so a caller giving up does not abort it for everybody else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::DeviceCloud;
use super::endpoint::{ActiveEndpoint, Endpoint, PlaceholderEndpoint, INVALID_ENDPOINT_DURATION};
use super::error::{ApiError, EndpointError};

/// Consecutive failed refreshes after which every endpoint is dropped
pub const MAX_ERROR_COUNT: u32 = 5;

#[derive(Clone)]
pub struct EndpointCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    cloud: Arc<dyn DeviceCloud>,
    // Keyed by lower-cased location id
    endpoints: RwLock<HashMap<String, Endpoint>>,
    gate: Mutex<()>,
    error_count: AtomicU32,
    lifetime: CancellationToken,
}

impl EndpointCache {
    pub fn new(cloud: Arc<dyn DeviceCloud>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                cloud,
                endpoints: RwLock::new(HashMap::new()),
                gate: Mutex::new(()),
                error_count: AtomicU32::new(0),
                lifetime: CancellationToken::new(),
            }),
        }
    }

    /// Endpoint of `location_id`, or a placeholder if the SmartApp does not know it.
    pub async fn get(&self, ct: &CancellationToken, location_id: &str) -> Result<Endpoint, EndpointError> {
        if self.inner.lifetime.is_cancelled() {
            return Err(EndpointError::Disposed);
        }

        let location = location_id.to_lowercase();
        if let Some(endpoint) = self.inner.lookup_valid(&location) {
            return Ok(endpoint);
        }

        let inner = self.inner.clone();
        let load = tokio::spawn(async move { inner.load(&location).await });

        tokio::select! {
            _ = ct.cancelled() => Err(EndpointError::Cancelled),
            result = load => result.unwrap_or_else(|e| {
                error!("Endpoint refresh task failed: {}", e);
                Err(EndpointError::Cancelled)
            }),
        }
    }

    /// Like [`get`](Self::get) but only succeeds with a real installation.
    pub async fn resolve(&self, ct: &CancellationToken, location_id: &str) -> Result<Endpoint, EndpointError> {
        let endpoint = self.get(ct, location_id).await?;
        if endpoint.is_placeholder() {
            return Err(EndpointError::NotFound(location_id.to_string()));
        }
        Ok(endpoint)
    }

    /// Keeps resolving `location_id` until an installation shows up, retrying every
    /// [`INVALID_ENDPOINT_DURATION`]. Fails only on cancellation or dispose.
    pub async fn observe(&self, ct: &CancellationToken, location_id: &str) -> Result<Endpoint, EndpointError> {
        loop {
            let error = match self.resolve(ct, location_id).await {
                Ok(endpoint) => return Ok(endpoint),
                Err(e @ (EndpointError::Cancelled | EndpointError::Disposed)) => return Err(e),
                Err(e) => e,
            };

            warn!(
                "Endpoint of location {} unavailable ({}), retrying in {:?}",
                location_id, error, INVALID_ENDPOINT_DURATION
            );
            tokio::select! {
                _ = ct.cancelled() => return Err(EndpointError::Cancelled),
                _ = self.inner.lifetime.cancelled() => return Err(EndpointError::Disposed),
                _ = tokio::time::sleep(INVALID_ENDPOINT_DURATION) => {}
            }
        }
    }

    /// Cached endpoint of `location_id`, valid or not, without any remote call
    pub fn peek(&self, location_id: &str) -> Option<Endpoint> {
        self.inner
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&location_id.to_lowercase())
            .cloned()
    }

    pub fn error_count(&self) -> u32 {
        self.inner.error_count.load(Ordering::SeqCst)
    }

    /// Stops every lookup waiting for the refresh gate. A refresh already running
    /// completes.
    pub fn dispose(&self) {
        self.inner.lifetime.cancel();
    }
}

impl CacheInner {
    fn lookup_valid(&self, location: &str) -> Option<Endpoint> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(location)
            .filter(|endpoint| endpoint.is_valid())
            .cloned()
    }

    async fn load(&self, location: &str) -> Result<Endpoint, EndpointError> {
        let _gate = tokio::select! {
            _ = self.lifetime.cancelled() => return Err(EndpointError::Disposed),
            guard = self.gate.lock() => guard,
        };

        if let Some(endpoint) = self.lookup_valid(location) {
            debug!("Endpoint of location {} loaded by another caller", location);
            return Ok(endpoint);
        }

        self.refresh().await;

        let mut endpoints = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
        match endpoints.get(location) {
            Some(endpoint @ Endpoint::Active(_)) => Ok(endpoint.clone()),
            _ => {
                info!(
                    "No endpoint for location {}, not asking again for {:?}",
                    location, INVALID_ENDPOINT_DURATION
                );
                let placeholder = Endpoint::Placeholder(PlaceholderEndpoint::new(location));
                endpoints.insert(location.to_string(), placeholder.clone());
                Ok(placeholder)
            }
        }
    }

    async fn refresh(&self) {
        match self.cloud.list_endpoints().await {
            Err(ApiError::Unauthorized) => {
                warn!("SmartApp rejected the access token, dropping all endpoints");
                self.tear_down();
            }
            Err(e) => {
                let errors = self.error_count.fetch_add(1, Ordering::SeqCst) + 1;
                if errors >= MAX_ERROR_COUNT {
                    error!(
                        "Loading endpoints failed {} times in a row ({}), dropping all endpoints",
                        errors, e
                    );
                    self.tear_down();
                } else {
                    warn!("Loading endpoints failed ({}/{}): {}", errors, MAX_ERROR_COUNT, e);
                }
            }
            Ok(list) if list.is_empty() => {
                warn!("SmartApp reported no endpoint, dropping all endpoints");
                self.tear_down();
            }
            Ok(list) => {
                self.error_count.store(0, Ordering::SeqCst);
                let refreshed: HashMap<String, Endpoint> = list
                    .into_iter()
                    .map(|info| {
                        let key = info.location.id.to_lowercase();
                        let endpoint = ActiveEndpoint::new(info.location.id, info.uri, self.cloud.clone());
                        (key, Endpoint::Active(endpoint))
                    })
                    .collect();
                info!("Loaded {} endpoint(s)", refreshed.len());
                *self.endpoints.write().unwrap_or_else(PoisonError::into_inner) = refreshed;
            }
        }
    }

    fn tear_down(&self) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
