//! HTTP entry point the SmartApp notifies
//!
//! `GET /api/smartthings` answers `Running!`. `POST /api/smartthings` takes a
//! [`HookRequest`] authenticated with the `st_to_bridge` bearer token and hands it
//! to the synchronizer.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::smartthings::HookRequest;
use crate::sync::{SyncError, Synchronizer};

pub const HOOK_PATH: &str = "/api/smartthings";

#[derive(Clone)]
pub struct WebhookState {
    sync: Arc<Synchronizer>,
    expected_auth: String,
    shutdown: CancellationToken,
}

impl WebhookState {
    pub fn new(sync: Arc<Synchronizer>, auth_token: &str, shutdown: CancellationToken) -> Self {
        Self {
            sync,
            expected_auth: format!("Bearer {}", auth_token),
            shutdown,
        }
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid notification: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::Unauthorized => StatusCode::UNAUTHORIZED,
            WebhookError::Payload(_) => StatusCode::BAD_REQUEST,
            WebhookError::Sync(SyncError::MalformedRequest(_)) => StatusCode::BAD_REQUEST,
            WebhookError::Sync(SyncError::Cancelled) => StatusCode::SERVICE_UNAVAILABLE,
            WebhookError::Sync(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route(HOOK_PATH, get(status).post(notify))
        .with_state(state)
}

async fn status() -> &'static str {
    "Running!"
}

async fn notify(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, WebhookError> {
    let authorized = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == state.expected_auth);
    if !authorized {
        warn!("Rejected SmartApp notification: unauthorized");
        return Err(WebhookError::Unauthorized);
    }

    let request: HookRequest = serde_json::from_slice(&body).map_err(|e| {
        warn!("Rejected SmartApp notification: {}", e);
        WebhookError::from(e)
    })?;
    debug!("SmartApp notification: {:?}", request.kind);
    let ct = state.shutdown.child_token();
    state.sync.dispatch(&ct, request).await.map_err(|e| {
        error!("Failed to handle SmartApp notification: {}", e);
        WebhookError::from(e)
    })?;

    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::{MqttSession, MqttSessionSettings};
    use crate::smartthings::EndpointCache;
    use crate::sync::SyncSettings;
    use crate::testing::{FakeCloud, FakeTransport};
    use serde_json::json;

    const TOKEN: &str = "s3cret";

    async fn serve() -> (String, FakeTransport) {
        let broker = FakeTransport::new();
        let mqtt = MqttSession::spawn(broker.clone(), MqttSessionSettings::new("bridge/status"));
        let endpoints = EndpointCache::new(FakeCloud::new());
        let sync = Arc::new(Synchronizer::new(
            mqtt,
            endpoints,
            SyncSettings::new("smartthings", "home"),
        ));
        let app = router(WebhookState::new(sync, TOKEN, CancellationToken::new()));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}{}", listener.local_addr().unwrap(), HOOK_PATH);
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        (url, broker)
    }

    fn device_hook() -> serde_json::Value {
        json!({
            "kind": "device",
            "device": { "id": "Fan1", "name": "Fan", "properties": { "switch": "On" } }
        })
    }

    #[tokio::test]
    async fn get_reports_running() {
        let (url, _) = serve().await;
        let body = reqwest::get(&url).await.unwrap().text().await.unwrap();
        assert_eq!(body, "Running!");
    }

    #[tokio::test]
    async fn authorized_device_update_is_published() {
        let (url, broker) = serve().await;

        let response = reqwest::Client::new()
            .post(&url)
            .bearer_auth(TOKEN)
            .json(&device_hook())
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            broker.published_on("smartthings/"),
            vec![("smartthings/fan1/switch".to_string(), "on".to_string())]
        );
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let (url, broker) = serve().await;

        let response = reqwest::Client::new()
            .post(&url)
            .bearer_auth("guess")
            .json(&device_hook())
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn token_is_checked_before_the_body() {
        let (url, _) = serve().await;

        let response = reqwest::Client::new()
            .post(&url)
            .body("not json")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unreadable_body_is_a_bad_request() {
        let (url, broker) = serve().await;

        let response = reqwest::Client::new()
            .post(&url)
            .bearer_auth(TOKEN)
            .body("not json")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn request_without_its_payload_is_a_bad_request() {
        let (url, _) = serve().await;

        let response = reqwest::Client::new()
            .post(&url)
            .bearer_auth(TOKEN)
            .json(&json!({ "kind": "routine" }))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
