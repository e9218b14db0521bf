//! JSON hub protocol definitions.
//!
//! Every record on the wire is a JSON document terminated by the ASCII record
//! separator (`0x1E`). A single WebSocket text frame may carry several records.
//! The connection opens with a handshake record in each direction before any
//! hub message is exchanged.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ProtocolError;

/// Terminates every record.
pub const RECORD_SEPARATOR: char = '\u{1e}';

pub const PROTOCOL_NAME: &str = "json";
pub const PROTOCOL_VERSION: u32 = 1;

/// Message type discriminators.
pub const MESSAGE_INVOCATION: u64 = 1;
pub const MESSAGE_PING: u64 = 6;
pub const MESSAGE_CLOSE: u64 = 7;

/// Transport name the negotiate endpoint must offer.
pub const WEBSOCKETS_TRANSPORT: &str = "WebSockets";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION,
        }
    }
}

/// Server reply to the handshake. An empty object means accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A server-to-client method call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub invocation_id: Option<String>,
    pub target: String,
    pub arguments: Vec<Value>,
}

impl Invocation {
    pub fn new(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            invocation_id: None,
            target: target.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseMessage {
    pub error: Option<String>,
    pub allow_reconnect: bool,
}

/// Decoded hub message. Kinds the client does not act on (stream items,
/// completions, acks) are kept as `Other` so callers can log them.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation(Invocation),
    Ping,
    Close(CloseMessage),
    Other { kind: u64 },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u64,
    #[serde(default)]
    invocation_id: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: bool,
}

impl TryFrom<RawMessage> for HubMessage {
    type Error = ProtocolError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        match raw.kind {
            MESSAGE_INVOCATION => {
                let target = raw.target.ok_or(ProtocolError::MissingField {
                    kind: raw.kind,
                    field: "target",
                })?;
                Ok(HubMessage::Invocation(Invocation {
                    invocation_id: raw.invocation_id,
                    target,
                    arguments: raw.arguments,
                }))
            }
            MESSAGE_PING => Ok(HubMessage::Ping),
            MESSAGE_CLOSE => Ok(HubMessage::Close(CloseMessage {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect,
            })),
            kind => Ok(HubMessage::Other { kind }),
        }
    }
}

/// Splits a frame into its records. A trailing fragment without a separator
/// is an error.
fn records(text: &str) -> Result<Vec<&str>, ProtocolError> {
    let mut parts: Vec<&str> = text.split(RECORD_SEPARATOR).collect();
    // The piece after the last separator must be empty.
    match parts.pop() {
        Some(tail) if !tail.trim().is_empty() => Err(ProtocolError::Incomplete),
        _ => Ok(parts),
    }
}

/// Encode the client handshake record.
pub fn handshake_request() -> String {
    let body = serde_json::to_string(&HandshakeRequest::default())
        .unwrap_or_else(|_| format!(r#"{{"protocol":"{PROTOCOL_NAME}","version":{PROTOCOL_VERSION}}}"#));
    format!("{body}{RECORD_SEPARATOR}")
}

/// Encode a handshake reply, as a hub would send it.
pub fn handshake_response(error: Option<&str>) -> String {
    let body = match error {
        Some(error) => json!({ "error": error }),
        None => json!({}),
    };
    format!("{body}{RECORD_SEPARATOR}")
}

/// Parse the handshake reply at the start of `text`.
///
/// Returns the reply and whatever follows it in the same frame, which may
/// already contain hub messages.
pub fn parse_handshake(text: &str) -> Result<(HandshakeResponse, &str), ProtocolError> {
    let Some(end) = text.find(RECORD_SEPARATOR) else {
        return Err(ProtocolError::Incomplete);
    };
    let response: HandshakeResponse = serde_json::from_str(&text[..end])?;
    if let Some(error) = response.error.as_ref() {
        return Err(ProtocolError::Handshake(error.clone()));
    }
    let rest = &text[end + RECORD_SEPARATOR.len_utf8()..];
    Ok((response, rest))
}

/// Decode every record in a text frame.
pub fn parse_messages(text: &str) -> Result<Vec<HubMessage>, ProtocolError> {
    records(text)?
        .into_iter()
        .filter(|record| !record.trim().is_empty())
        .map(|record| {
            let raw: RawMessage = serde_json::from_str(record)?;
            HubMessage::try_from(raw)
        })
        .collect()
}

/// Encode a hub message as one record.
pub fn encode_message(message: &HubMessage) -> String {
    let body = match message {
        HubMessage::Invocation(invocation) => {
            let mut value = json!({
                "type": MESSAGE_INVOCATION,
                "target": invocation.target,
                "arguments": invocation.arguments,
            });
            if let Some(id) = invocation.invocation_id.as_ref() {
                value["invocationId"] = json!(id);
            }
            value
        }
        HubMessage::Ping => json!({ "type": MESSAGE_PING }),
        HubMessage::Close(close) => {
            let mut value = json!({ "type": MESSAGE_CLOSE });
            if let Some(error) = close.error.as_ref() {
                value["error"] = json!(error);
            }
            if close.allow_reconnect {
                value["allowReconnect"] = json!(true);
            }
            value
        }
        HubMessage::Other { kind } => json!({ "type": kind }),
    };
    format!("{body}{RECORD_SEPARATOR}")
}

/// Reply from `POST {hub}/negotiate?negotiateVersion=1`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub connection_token: Option<String>,
    #[serde(default)]
    pub negotiate_version: u32,
    #[serde(default)]
    pub available_transports: Vec<AvailableTransport>,
    /// Redirect target, paired with `access_token`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl NegotiateResponse {
    /// Whether the server offers WebSockets with text frames.
    pub fn supports_websockets(&self) -> bool {
        self.available_transports.iter().any(|t| {
            t.transport == WEBSOCKETS_TRANSPORT && t.transfer_formats.iter().any(|f| f == "Text")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTransport {
    pub transport: String,
    #[serde(default)]
    pub transfer_formats: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_request_is_terminated() {
        let record = handshake_request();
        assert_eq!(record, "{\"protocol\":\"json\",\"version\":1}\u{1e}");
    }

    #[test]
    fn handshake_keeps_trailing_messages() {
        let frame = format!("{{}}\u{1e}{}", encode_message(&HubMessage::Ping));
        let (response, rest) = parse_handshake(&frame).unwrap();
        assert_eq!(response, HandshakeResponse::default());
        assert_eq!(parse_messages(rest).unwrap(), vec![HubMessage::Ping]);
    }

    #[test]
    fn handshake_error_is_rejected() {
        let frame = handshake_response(Some("Requested protocol 'json' is not available."));
        let err = parse_handshake(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::Handshake(msg) if msg.contains("not available")));
    }

    #[test]
    fn parses_several_records_in_one_frame() {
        let frame = concat!(
            r#"{"type":1,"target":"ReceiveNotification","arguments":[{"title":"Hi"}]}"#,
            "\u{1e}",
            r#"{"type":6}"#,
            "\u{1e}",
            r#"{"type":3,"invocationId":"7"}"#,
            "\u{1e}",
        );
        let messages = parse_messages(frame).unwrap();
        assert_eq!(messages.len(), 3);
        match &messages[0] {
            HubMessage::Invocation(inv) => {
                assert_eq!(inv.target, "ReceiveNotification");
                assert_eq!(inv.arguments[0]["title"], "Hi");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(messages[1], HubMessage::Ping);
        assert_eq!(messages[2], HubMessage::Other { kind: 3 });
    }

    #[test]
    fn invocation_without_target_is_an_error() {
        let err = parse_messages("{\"type\":1,\"arguments\":[]}\u{1e}").unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField { field: "target", .. }));
    }

    #[test]
    fn unterminated_record_is_incomplete() {
        let err = parse_messages("{\"type\":6}").unwrap_err();
        assert!(matches!(err, ProtocolError::Incomplete));
    }

    #[test]
    fn close_carries_reconnect_flag() {
        let frame = encode_message(&HubMessage::Close(CloseMessage {
            error: Some("server shutting down".into()),
            allow_reconnect: true,
        }));
        let messages = parse_messages(&frame).unwrap();
        assert_eq!(
            messages,
            vec![HubMessage::Close(CloseMessage {
                error: Some("server shutting down".into()),
                allow_reconnect: true,
            })]
        );
    }

    #[test]
    fn negotiate_requires_text_websockets() {
        let body = r#"{
            "connectionId": "abc",
            "connectionToken": "tok",
            "negotiateVersion": 1,
            "availableTransports": [
                { "transport": "ServerSentEvents", "transferFormats": ["Text"] },
                { "transport": "WebSockets", "transferFormats": ["Text", "Binary"] }
            ]
        }"#;
        let response: NegotiateResponse = serde_json::from_str(body).unwrap();
        assert!(response.supports_websockets());
        assert_eq!(response.connection_token.as_deref(), Some("tok"));

        let long_polling_only: NegotiateResponse = serde_json::from_str(
            r#"{"availableTransports":[{"transport":"LongPolling","transferFormats":["Text"]}]}"#,
        )
        .unwrap();
        assert!(!long_polling_only.supports_websockets());
    }
}
