//! HTTP access to the SmartApp
//!
//! [`DeviceCloud`] is what the endpoint cache and the endpoints need from the
//! vendor cloud. [`SmartAppClient`] implements it with `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::error::ApiError;
use super::model::{Device, DevicesResponse, EndpointInfo};
use crate::sync::command::Command;

pub const DEFAULT_ENDPOINTS_URL: &str = "https://graph.api.smartthings.com/api/smartapps/endpoints";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait DeviceCloud: Send + Sync + 'static {
    /// Every SmartApp installation the token grants access to
    async fn list_endpoints(&self) -> Result<Vec<EndpointInfo>, ApiError>;

    async fn list_devices(&self, uri: &str, detailed: bool) -> Result<Vec<Device>, ApiError>;

    async fn execute(&self, uri: &str, device_id: &str, command: &Command) -> Result<(), ApiError>;
}

pub struct SmartAppClient {
    http: Client,
    endpoints_url: String,
}

impl SmartAppClient {
    pub fn new(token: &str, endpoints_url: impl Into<String>) -> Result<Self, ApiError> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| ApiError::Config(format!("invalid access token: {}", e)))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let http = Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            endpoints_url: endpoints_url.into(),
        })
    }

    async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let response = Self::check(response)?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }

    fn check(response: Response) -> Result<Response, ApiError> {
        match response.status() {
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
            status if status.is_success() => Ok(response),
            status => Err(ApiError::Status(status)),
        }
    }
}

fn join(uri: &str, segments: &[&str]) -> String {
    let mut url = uri.trim_end_matches('/').to_string();
    for segment in segments {
        url.push('/');
        url.push_str(segment.trim_matches('/'));
    }
    url
}

#[async_trait]
impl DeviceCloud for SmartAppClient {
    async fn list_endpoints(&self) -> Result<Vec<EndpointInfo>, ApiError> {
        debug!("Listing SmartApp endpoints from {}", self.endpoints_url);
        let response = self.http.get(&self.endpoints_url).send().await?;
        Self::read_json(response).await
    }

    async fn list_devices(&self, uri: &str, detailed: bool) -> Result<Vec<Device>, ApiError> {
        let url = join(uri, &["items"]);
        let response = self
            .http
            .get(&url)
            .query(&[("details", detailed)])
            .send()
            .await?;
        let devices: DevicesResponse = Self::read_json(response).await?;
        Ok(devices.devices)
    }

    async fn execute(&self, uri: &str, device_id: &str, command: &Command) -> Result<(), ApiError> {
        let url = join(uri, &["device", device_id, &command.name]);
        let response = self
            .http
            .put(&url)
            .json(&command.parameters)
            .send()
            .await?;
        Self::check(response)?;
        Ok(())
    }
}
