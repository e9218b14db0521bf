//! WsTransport against a real tokio-tungstenite server on localhost.

use std::time::Duration;

use assert_matches::assert_matches;
use courselink_client::ws::{Transport, WsTransport};
use courselink_client::{ClientConfig, ConnectionError};
use courselink_shared::{encode_message, handshake_request, handshake_response, HubMessage, Invocation};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, accept_hdr_async, WebSocketStream};

fn transport(config: ClientConfig) -> WsTransport {
    WsTransport::new(&ClientConfig {
        skip_negotiation: true,
        ..config
    })
}

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/hubs/notifications", listener.local_addr().unwrap());
    (listener, url)
}

/// Read the client handshake and answer it, optionally with trailing records.
async fn answer_handshake(ws: &mut WebSocketStream<TcpStream>, error: Option<&str>, trailing: &str) {
    let request = ws.next().await.unwrap().unwrap();
    assert_eq!(request.to_text().unwrap(), handshake_request());
    ws.send(Message::text(format!("{}{}", handshake_response(error), trailing)))
        .await
        .unwrap();
}

fn invocation(target: &str, arguments: Vec<serde_json::Value>) -> String {
    encode_message(&HubMessage::Invocation(Invocation::new(target, arguments)))
}

#[tokio::test]
async fn sends_bearer_token_and_delivers_invocations() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut authorization = None;
        let mut ws = accept_hdr_async(stream, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            authorization = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(resp)
        })
        .await
        .unwrap();

        answer_handshake(&mut ws, None, &invocation("Early", vec![])).await;
        ws.send(Message::text(invocation(
            "ReceiveNotification",
            vec![json!({ "title": "Quiz opens" })],
        )))
        .await
        .unwrap();

        // Runs until the client closes its side.
        while let Some(Ok(message)) = ws.next().await {
            if message.is_close() {
                break;
            }
        }
        authorization
    });

    let mut session = transport(ClientConfig::default())
        .connect(&url, Some("secret".to_string()))
        .await
        .unwrap();

    assert_matches!(session.next().await, Some(HubMessage::Invocation(inv)) if inv.target == "Early");
    match session.next().await {
        Some(HubMessage::Invocation(inv)) => {
            assert_eq!(inv.target, "ReceiveNotification");
            assert_eq!(inv.arguments[0]["title"], "Quiz opens");
        }
        other => panic!("expected an invocation, got {other:?}"),
    }

    drop(session);
    let authorization = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(authorization.as_deref(), Some("Bearer secret"));
}

#[tokio::test]
async fn rejected_upgrade_is_unauthorized() {
    let (listener, url) = listen().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ = accept_hdr_async(stream, |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
            let mut denied = ErrorResponse::new(Some("token expired".to_string()));
            *denied.status_mut() = StatusCode::UNAUTHORIZED;
            Err(denied)
        })
        .await;
    });

    let err = transport(ClientConfig::default())
        .connect(&url, Some("stale".to_string()))
        .await
        .unwrap_err();
    assert_matches!(err, ConnectionError::Unauthorized(_));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn handshake_error_fails_the_connect() {
    let (listener, url) = listen().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        answer_handshake(&mut ws, Some("Requested protocol 'json' is not available."), "").await;
    });

    let err = transport(ClientConfig::default())
        .connect(&url, None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ConnectionError::Handshake("Requested protocol 'json' is not available.".to_string())
    );
}

#[tokio::test]
async fn server_close_ends_the_session() {
    let (listener, url) = listen().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        answer_handshake(&mut ws, None, "").await;
        ws.close(None).await.unwrap();
    });

    let mut session = transport(ClientConfig::default())
        .connect(&url, None)
        .await
        .unwrap();
    let next = tokio::time::timeout(Duration::from_secs(5), session.next())
        .await
        .unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn pings_and_drops_a_silent_server() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        answer_handshake(&mut ws, None, "").await;
        let mut pings = 0;
        while let Some(Ok(message)) = ws.next().await {
            if message.is_text() && message.to_text().unwrap() == encode_message(&HubMessage::Ping) {
                pings += 1;
            }
        }
        pings
    });

    let config = ClientConfig {
        keep_alive_interval: Duration::from_millis(50),
        server_timeout: Duration::from_millis(300),
        ..ClientConfig::default()
    };
    let mut session = transport(config).connect(&url, None).await.unwrap();
    let next = tokio::time::timeout(Duration::from_secs(5), session.next())
        .await
        .unwrap();
    assert!(next.is_none());

    drop(session);
    let pings = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert!(pings >= 2, "expected keep-alive pings, got {pings}");
}

#[tokio::test]
async fn unreachable_host_is_a_connect_error() {
    let (listener, url) = listen().await;
    drop(listener);

    let err = transport(ClientConfig::default())
        .connect(&url, None)
        .await
        .unwrap_err();
    assert_matches!(err, ConnectionError::Connect { .. });
    assert!(!err.is_fatal());
}
