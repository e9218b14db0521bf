//! Negotiation against a mock HTTP server.

use assert_matches::assert_matches;
use courselink_client::ws::negotiate::negotiate;
use courselink_client::ConnectionError;
use serde_json::json;
use url::Url;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn websockets() -> serde_json::Value {
    json!([{ "transport": "WebSockets", "transferFormats": ["Text", "Binary"] }])
}

fn hub(server: &MockServer) -> Url {
    Url::parse(&format!("{}/hubs/notifications", server.uri())).unwrap()
}

#[tokio::test]
async fn appends_the_connection_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hubs/notifications/negotiate"))
        .and(query_param("negotiateVersion", "1"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "negotiateVersion": 1,
            "connectionId": "conn-id",
            "connectionToken": "conn-token",
            "availableTransports": websockets()
        })))
        .expect(1)
        .mount(&server)
        .await;

    let negotiated = negotiate(&reqwest::Client::new(), &hub(&server), Some("secret"))
        .await
        .unwrap();

    assert_eq!(negotiated.url.path(), "/hubs/notifications");
    assert_eq!(negotiated.url.query(), Some("id=conn-token"));
    assert_eq!(negotiated.access_token.as_deref(), Some("secret"));
}

#[tokio::test]
async fn follows_redirects_with_the_new_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hubs/notifications/negotiate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": format!("{}/edge/notifications", server.uri()),
            "accessToken": "edge-token"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/edge/notifications/negotiate"))
        .and(header("authorization", "Bearer edge-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "connectionId": "legacy-id",
            "availableTransports": websockets()
        })))
        .expect(1)
        .mount(&server)
        .await;

    let negotiated = negotiate(&reqwest::Client::new(), &hub(&server), Some("original"))
        .await
        .unwrap();

    assert_eq!(negotiated.url.path(), "/edge/notifications");
    assert_eq!(negotiated.url.query(), Some("id=legacy-id"));
    assert_eq!(negotiated.access_token.as_deref(), Some("edge-token"));
}

#[tokio::test]
async fn redirect_loops_are_cut_off() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hubs/notifications/negotiate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": format!("{}/hubs/notifications", server.uri())
        })))
        .mount(&server)
        .await;

    let err = negotiate(&reqwest::Client::new(), &hub(&server), None)
        .await
        .unwrap_err();
    assert_matches!(err, ConnectionError::Negotiate(reason) if reason.contains("redirects"));
}

#[tokio::test]
async fn rejected_token_is_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = negotiate(&reqwest::Client::new(), &hub(&server), Some("expired"))
        .await
        .unwrap_err();
    assert_matches!(err, ConnectionError::Unauthorized(_));
}

#[tokio::test]
async fn server_errors_and_missing_websockets_fail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hubs/notifications/negotiate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": "Negotiate was rejected by the hub"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/polling/negotiate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "connectionToken": "t",
            "availableTransports": [{ "transport": "LongPolling", "transferFormats": ["Text"] }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/broken/negotiate"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let http = reqwest::Client::new();
    let err = negotiate(&http, &hub(&server), None).await.unwrap_err();
    assert_eq!(
        err,
        ConnectionError::Negotiate("Negotiate was rejected by the hub".to_string())
    );

    let polling = Url::parse(&format!("{}/polling", server.uri())).unwrap();
    let err = negotiate(&http, &polling, None).await.unwrap_err();
    assert_matches!(err, ConnectionError::Negotiate(reason) if reason.contains("WebSockets"));

    let broken = Url::parse(&format!("{}/broken", server.uri())).unwrap();
    let err = negotiate(&http, &broken, None).await.unwrap_err();
    assert_matches!(err, ConnectionError::Negotiate(reason) if reason.contains("500"));
}
