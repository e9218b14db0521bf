//! Hub connection with state management and auto-reconnect.
//!
//! This module provides the shared types and includes the connection state
//! machine, the transport seam and the native WebSocket transport.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

mod connection_native;
mod hub;
mod transport;

pub use connection_native::WsTransport;
pub use hub::HubConnection;
pub(crate) use hub::lock;
pub use transport::{HubSession, Transport};

/// Connection state for the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting for or running reconnect attempt `attempt` (1-based).
    Reconnecting { attempt: u32 },
    Disconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }
}

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u32,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u32,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 1.5,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for a given attempt number (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_delay_ms as f32 * self.backoff_multiplier.powi(exponent);
        let capped = if delay.is_finite() {
            (delay as u32).min(self.max_delay_ms)
        } else {
            self.max_delay_ms
        };
        Duration::from_millis(u64::from(capped))
    }

    /// Whether `attempts` already made reach the limit.
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }
}

/// Opaque token identifying one handler registration.
///
/// Ids are allocated from a process-wide counter, so ordering ids orders
/// registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

impl HandlerId {
    pub fn next() -> Self {
        HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handler for a named server event. Receives the invocation arguments.
pub type EventCallback = Arc<dyn Fn(&[Value]) -> anyhow::Result<()> + Send + Sync>;

/// Runs after the transport re-established a dropped connection.
pub type ReconnectedCallback = Arc<dyn Fn() + Send + Sync>;

/// Runs once the connection ended for good, with the terminal error if any.
pub type ClosedCallback = Arc<dyn Fn(Option<&crate::error::ConnectionError>) + Send + Sync>;

/// Hub method names match case-insensitively.
pub(crate) fn event_key(event: &str) -> String {
    event.to_ascii_lowercase()
}
