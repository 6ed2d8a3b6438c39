// Integration tests for `SmartAppClient` using wiremock.

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use smartthings2mqtt::smartthings::{ApiError, DeviceCloud, SmartAppClient};
use smartthings2mqtt::sync::Command;

const TOKEN: &str = "bridge-token";

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, SmartAppClient) {
    let server = MockServer::start().await;
    let client = SmartAppClient::new(TOKEN, format!("{}/api/smartapps/endpoints", server.uri())).unwrap();
    (server, client)
}

fn installation(server: &MockServer) -> String {
    format!("{}/api/smartapps/installations/42", server.uri())
}

// ── Endpoints ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_list_endpoints_sends_bearer_token() {
    let (server, client) = setup().await;

    let body = json!([
        {
            "oauthClient": { "clientId": "abc" },
            "location": { "id": "home-id", "name": "Home" },
            "uri": "https://graph.api.smartthings.com:443/api/smartapps/installations/42",
            "base_url": "https://graph.api.smartthings.com:443",
            "url": "/api/smartapps/installations/42"
        }
    ]);

    Mock::given(method("GET"))
        .and(path("/api/smartapps/endpoints"))
        .and(header("authorization", "Bearer bridge-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&body))
        .expect(1)
        .mount(&server)
        .await;

    let endpoints = client.list_endpoints().await.unwrap();

    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].location.id, "home-id");
    assert!(endpoints[0].uri.ends_with("/installations/42"));
}

#[tokio::test]
async fn test_list_endpoints_unauthorized() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/smartapps/endpoints"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    assert!(matches!(
        client.list_endpoints().await,
        Err(ApiError::Unauthorized)
    ));
}

#[tokio::test]
async fn test_list_endpoints_server_error() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/smartapps/endpoints"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    match client.list_endpoints().await {
        Err(ApiError::Status(status)) => assert_eq!(status.as_u16(), 503),
        other => panic!("expected status error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_list_endpoints_garbage_body() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/smartapps/endpoints"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    assert!(matches!(
        client.list_endpoints().await,
        Err(ApiError::Decode(_))
    ));
}

// ── Devices ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_list_devices_detailed() {
    let (server, client) = setup().await;

    let body = json!({
        "devices": [
            { "id": "Abc123", "name": "Lamp", "properties": { "Switch": "on", "level": 40 } },
            { "id": "Fan1", "name": "Fan", "properties": { "switch": null } }
        ]
    });

    Mock::given(method("GET"))
        .and(path("/api/smartapps/installations/42/items"))
        .and(query_param("details", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&body))
        .mount(&server)
        .await;

    let devices = client.list_devices(&installation(&server), true).await.unwrap();

    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].property("switch"), Some("on"));
    assert_eq!(devices[0].property("level"), Some("40"));
    assert_eq!(devices[1].property("switch"), None);
}

#[tokio::test]
async fn test_list_devices_without_details() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/smartapps/installations/42/items"))
        .and(query_param("details", "false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "devices": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let devices = client.list_devices(&installation(&server), false).await.unwrap();
    assert!(devices.is_empty());
}

// ── Commands ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_execute_puts_parameters() {
    let (server, client) = setup().await;

    Mock::given(method("PUT"))
        .and(path("/api/smartapps/installations/42/device/Abc123/setLevel"))
        .and(body_json(json!({ "level": 75 })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let command = Command::new("setLevel").with_parameter("level", 75);
    client
        .execute(&installation(&server), "Abc123", &command)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_execute_failure_status() {
    let (server, client) = setup().await;

    Mock::given(method("PUT"))
        .and(path("/api/smartapps/installations/42/device/Abc123/on"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let result = client
        .execute(&installation(&server), "Abc123", &Command::new("on"))
        .await;
    assert!(matches!(result, Err(ApiError::Status(_))));
}
