use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::client::DeviceCloud;
use super::error::EndpointError;
use super::model::Device;
use crate::sync::command::Command;

/// How long a placeholder is trusted before the location is looked up again
pub const INVALID_ENDPOINT_DURATION: Duration = Duration::from_secs(10 * 60);

/// A location's SmartApp installation
#[derive(Clone)]
pub enum Endpoint {
    Active(ActiveEndpoint),
    /// Stands in for a location without a known installation
    Placeholder(PlaceholderEndpoint),
}

#[derive(Clone)]
pub struct ActiveEndpoint {
    location_id: String,
    uri: String,
    cloud: Arc<dyn DeviceCloud>,
}

#[derive(Debug, Clone)]
pub struct PlaceholderEndpoint {
    location_id: String,
    created: Instant,
}

impl ActiveEndpoint {
    pub fn new(location_id: impl Into<String>, uri: impl Into<String>, cloud: Arc<dyn DeviceCloud>) -> Self {
        Self {
            location_id: location_id.into(),
            uri: uri.into(),
            cloud,
        }
    }
}

impl PlaceholderEndpoint {
    pub fn new(location_id: impl Into<String>) -> Self {
        Self {
            location_id: location_id.into(),
            created: Instant::now(),
        }
    }

    pub fn is_stale(&self) -> bool {
        Instant::now() >= self.created + INVALID_ENDPOINT_DURATION
    }
}

impl Endpoint {
    pub fn location_id(&self) -> &str {
        match self {
            Endpoint::Active(active) => &active.location_id,
            Endpoint::Placeholder(placeholder) => &placeholder.location_id,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Endpoint::Placeholder(_))
    }

    /// Whether the endpoint can be handed out without asking the SmartApp again
    pub fn is_valid(&self) -> bool {
        match self {
            Endpoint::Active(_) => true,
            Endpoint::Placeholder(placeholder) => !placeholder.is_stale(),
        }
    }

    /// Runs `command` on a device. A placeholder only logs the command.
    pub async fn execute(
        &self,
        ct: &CancellationToken,
        device_id: &str,
        command: &Command,
    ) -> Result<(), EndpointError> {
        match self {
            Endpoint::Active(active) => tokio::select! {
                _ = ct.cancelled() => Err(EndpointError::Cancelled),
                result = active.cloud.execute(&active.uri, device_id, command) => Ok(result?),
            },
            Endpoint::Placeholder(placeholder) => {
                info!(
                    "No endpoint for location {}, dropping {} on device {}",
                    placeholder.location_id, command.name, device_id
                );
                Ok(())
            }
        }
    }

    pub async fn list_devices(
        &self,
        ct: &CancellationToken,
        detailed: bool,
    ) -> Result<Vec<Device>, EndpointError> {
        match self {
            Endpoint::Active(active) => tokio::select! {
                _ = ct.cancelled() => Err(EndpointError::Cancelled),
                result = active.cloud.list_devices(&active.uri, detailed) => Ok(result?),
            },
            Endpoint::Placeholder(placeholder) => {
                Err(EndpointError::Placeholder(placeholder.location_id.clone()))
            }
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Active(active) => f
                .debug_struct("Active")
                .field("location_id", &active.location_id)
                .field("uri", &active.uri)
                .finish(),
            Endpoint::Placeholder(placeholder) => f
                .debug_struct("Placeholder")
                .field("location_id", &placeholder.location_id)
                .field("created", &placeholder.created)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCloud;

    #[tokio::test(start_paused = true)]
    async fn placeholder_goes_stale_after_ten_minutes() {
        let placeholder = PlaceholderEndpoint::new("home");
        assert!(!placeholder.is_stale());

        tokio::time::advance(INVALID_ENDPOINT_DURATION - Duration::from_secs(1)).await;
        assert!(!placeholder.is_stale());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(placeholder.is_stale());
    }

    #[tokio::test]
    async fn placeholder_drops_commands_but_cannot_list_devices() {
        let endpoint = Endpoint::Placeholder(PlaceholderEndpoint::new("home"));
        let ct = CancellationToken::new();

        endpoint.execute(&ct, "abc", &Command::new("on")).await.unwrap();
        assert!(matches!(
            endpoint.list_devices(&ct, true).await,
            Err(EndpointError::Placeholder(_))
        ));
    }

    #[tokio::test]
    async fn active_endpoint_forwards_to_the_cloud() {
        let cloud = FakeCloud::new();
        cloud.set_devices("https://st/app", vec![Device::new("abc", "Lamp")]);
        let endpoint = Endpoint::Active(ActiveEndpoint::new("home", "https://st/app", cloud.clone()));
        let ct = CancellationToken::new();

        let devices = endpoint.list_devices(&ct, true).await.unwrap();
        assert_eq!(devices.len(), 1);

        endpoint.execute(&ct, "abc", &Command::new("off")).await.unwrap();
        assert_eq!(
            cloud.executed(),
            vec![("https://st/app".to_string(), "abc".to_string(), Command::new("off"))]
        );
    }
}
