//! Shared error types.

use thiserror::Error;

/// Failure to decode or encode a hub protocol record.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid hub message json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("hub message of type {kind} is missing `{field}`")]
    MissingField { kind: u64, field: &'static str },
    #[error("record is not terminated by the record separator")]
    Incomplete,
    #[error("handshake rejected by server: {0}")]
    Handshake(String),
}
