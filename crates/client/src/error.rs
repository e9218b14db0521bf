//! Error types for the realtime client.

use std::time::Duration;

use courselink_shared::ProtocolError;
use thiserror::Error;

use crate::ws::HandlerId;

/// Failure to establish or keep the hub connection.
///
/// `Clone` because one failed start is reported to every caller awaiting it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("hub rejected the credentials: {0}")]
    Unauthorized(String),
    #[error("negotiation failed: {0}")]
    Negotiate(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("server closed the connection: {0}")]
    Closed(String),
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("connection was stopped")]
    Stopped,
    #[error("invalid hub url: {0}")]
    InvalidUrl(String),
}

impl ConnectionError {
    /// Errors the reconnect loop must not retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectionError::Unauthorized(_) | ConnectionError::Stopped | ConnectionError::InvalidUrl(_)
        )
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Handshake(reason) => ConnectionError::Handshake(reason),
            other => ConnectionError::Protocol(other.to_string()),
        }
    }
}

/// The wait for `Connected` expired before a subscriber could attach.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("gave up attaching '{event}' after {waited:?} without a connection")]
pub struct AttachmentTimeoutError {
    pub event: String,
    pub waited: Duration,
}

/// A single handler failed while processing an event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("handler {handler} for '{event}' failed: {reason}")]
pub struct HandlerInvocationError {
    pub event: String,
    pub handler: HandlerId,
    pub reason: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid hub url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}
