//! Courselink realtime client
//!
//! Keeps one authenticated hub connection per process, fans server-pushed
//! events out to subscribers, and turns forced-logout notifications into a
//! re-login decision for the UI.

#[macro_use]
pub mod logging;

pub mod auth_session;
pub mod config;
pub mod error;
pub mod realtime;
pub mod stores;
pub mod ws;

pub use auth_session::{AuthProvider, AuthSession};
pub use config::{ClientConfig, EventRoutes};
pub use error::{AttachmentTimeoutError, ConfigError, ConnectionError, HandlerInvocationError};
pub use realtime::{NotificationSink, RealtimeClient};
pub use stores::{NotificationFeed, ReLoginPolicy};
pub use ws::{ConnectionState, EventRegistry, HubConnection, HubManager, Subscription};
