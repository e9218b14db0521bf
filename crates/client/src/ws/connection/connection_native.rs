//! Native WebSocket transport using tokio-tungstenite.

use std::time::Duration;

use async_trait::async_trait;
use courselink_shared::{encode_message, handshake_request, parse_handshake, parse_messages, HubMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{HubSession, Transport};
use crate::config::ClientConfig;
use crate::error::ConnectionError;
use crate::ws::negotiate::negotiate;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Hub transport over a real WebSocket.
#[derive(Debug, Clone)]
pub struct WsTransport {
    http: reqwest::Client,
    skip_negotiation: bool,
    keep_alive_interval: Duration,
    server_timeout: Duration,
    handshake_timeout: Duration,
}

impl WsTransport {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            skip_negotiation: config.skip_negotiation,
            keep_alive_interval: config.keep_alive_interval,
            server_timeout: config.server_timeout,
            handshake_timeout: config.handshake_timeout,
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        url: &str,
        access_token: Option<String>,
    ) -> Result<HubSession, ConnectionError> {
        let hub_url = Url::parse(url).map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;

        let (target, token) = if self.skip_negotiation {
            (hub_url, access_token)
        } else {
            let negotiated = negotiate(&self.http, &hub_url, access_token.as_deref()).await?;
            (negotiated.url, negotiated.access_token)
        };

        let ws_url = websocket_url(target)?;
        let endpoint = redacted(&ws_url);

        let mut request = ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;
        if let Some(token) = token.as_deref() {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                ConnectionError::Unauthorized("access token is not a valid header value".to_string())
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (mut stream, _response) = connect_async(request)
            .await
            .map_err(|e| connect_error(&endpoint, e))?;

        let early = tokio::time::timeout(self.handshake_timeout, handshake(&mut stream))
            .await
            .map_err(|_| ConnectionError::Handshake("timed out waiting for the handshake reply".to_string()))??;
        crate::log_debug!("Handshake with {} complete", endpoint);

        let (events, session) = HubSession::channel();
        for message in early {
            let _ = events.send(message);
        }

        tokio::spawn(pump(
            stream,
            events,
            self.keep_alive_interval,
            self.server_timeout,
            endpoint,
        ));

        Ok(session)
    }
}

/// Map http(s) hub URLs to ws(s).
pub(crate) fn websocket_url(mut url: Url) -> Result<Url, ConnectionError> {
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(ConnectionError::InvalidUrl(format!(
                "unsupported scheme '{other}'"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| ConnectionError::InvalidUrl(format!("cannot use scheme '{scheme}'")))?;
    Ok(url)
}

/// URL without query, safe to log.
fn redacted(url: &Url) -> String {
    let mut clean = url.clone();
    clean.set_query(None);
    clean.to_string()
}

fn connect_error(endpoint: &str, err: tungstenite::Error) -> ConnectionError {
    if let tungstenite::Error::Http(response) = &err {
        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return ConnectionError::Unauthorized(format!("upgrade rejected with HTTP {status}"));
        }
    }
    ConnectionError::Connect {
        url: endpoint.to_string(),
        reason: err.to_string(),
    }
}

/// Send the handshake and wait for the reply. Returns any hub messages that
/// arrived in the same frame.
async fn handshake(stream: &mut WsStream) -> Result<Vec<HubMessage>, ConnectionError> {
    stream
        .send(Message::text(handshake_request()))
        .await
        .map_err(|e| ConnectionError::Handshake(e.to_string()))?;

    while let Some(frame) = stream.next().await {
        match frame.map_err(|e| ConnectionError::Handshake(e.to_string()))? {
            Message::Text(text) => {
                let (_, rest) = parse_handshake(text.as_str())?;
                return Ok(parse_messages(rest)?);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(ConnectionError::Handshake(
        "socket closed during handshake".to_string(),
    ))
}

/// Own the socket: forward decoded messages, send keep-alive pings, enforce
/// the server timeout. Returns (dropping `events`) when the connection ends.
async fn pump(
    mut stream: WsStream,
    events: UnboundedSender<HubMessage>,
    keep_alive: Duration,
    server_timeout: Duration,
    endpoint: String,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + keep_alive, keep_alive);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ping_record = encode_message(&HubMessage::Ping);
    let mut deadline = Instant::now() + server_timeout;

    loop {
        tokio::select! {
            () = events.closed() => {
                let _ = stream.close(None).await;
                crate::log_debug!("Closed socket to {}", endpoint);
                return;
            }
            _ = ping.tick() => {
                if let Err(e) = stream.send(Message::text(ping_record.clone())).await {
                    crate::log_warn!("Keep-alive to {} failed: {}", endpoint, e);
                    return;
                }
            }
            () = tokio::time::sleep_until(deadline) => {
                crate::log_warn!(
                    "No frames from {} for {}ms, dropping connection",
                    endpoint,
                    server_timeout.as_millis()
                );
                return;
            }
            frame = stream.next() => {
                let Some(frame) = frame else {
                    crate::log_info!("WebSocket to {} closed", endpoint);
                    return;
                };
                deadline = Instant::now() + server_timeout;
                match frame {
                    Ok(Message::Text(text)) => match parse_messages(text.as_str()) {
                        Ok(messages) => {
                            for message in messages {
                                if events.send(message).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => crate::log_error!("Dropping malformed frame from {}: {}", endpoint, e),
                    },
                    Ok(Message::Close(_)) => {
                        crate::log_info!("WebSocket to {} received close frame", endpoint);
                        return;
                    }
                    Ok(_) => {
                        // Binary, ping, pong: pongs are answered by tungstenite
                    }
                    Err(e) => {
                        crate::log_error!("WebSocket read error from {}: {}", endpoint, e);
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_schemes_map_to_websocket_schemes() {
        let secure = websocket_url(Url::parse("https://api.example.edu/hubs/notifications").unwrap()).unwrap();
        assert_eq!(secure.as_str(), "wss://api.example.edu/hubs/notifications");

        let local = websocket_url(Url::parse("http://localhost:5000/hubs/notifications?id=abc").unwrap()).unwrap();
        assert_eq!(local.as_str(), "ws://localhost:5000/hubs/notifications?id=abc");
    }

    #[test]
    fn other_schemes_are_rejected() {
        let err = websocket_url(Url::parse("ftp://example.edu/hub").unwrap()).unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidUrl(_)));
    }

    #[test]
    fn redaction_drops_query() {
        let url = Url::parse("wss://api.example.edu/hubs/notifications?id=secret").unwrap();
        assert_eq!(redacted(&url), "wss://api.example.edu/hubs/notifications");
    }
}
