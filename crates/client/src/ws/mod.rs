//! Hub connection, dispatch and reconnection for the notification channel.
//!
//! This module provides:
//! - One shared hub connection per process with auto-reconnect
//! - Subscriptions that tolerate mounting before the connection is up
//! - Re-attachment of every live subscription after a reconnect
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    HubManager                       │
//! │        (owns the single HubConnection slot)         │
//! └─────────────────────────────────────────────────────┘
//!                         │
//!                         ▼
//!              ┌─────────────────────┐      ┌──────────────┐
//!              │    HubConnection    │─────▶│  Transport   │
//!              │ (state + handlers)  │      │ (WsTransport)│
//!              └─────────────────────┘      └──────────────┘
//!                         │ on / off / on_reconnected
//!                         ▼
//!              ┌──────────────────────┐
//!              │    EventRegistry     │
//!              │ (bounded attach and  │
//!              │ reconnect re-attach) │
//!              └──────────────────────┘
//!                         │ Subscription guards
//!          ┌──────────────┼──────────────┐
//!          ▼              ▼              ▼
//!   ┌────────────┐ ┌────────────┐ ┌────────────┐
//!   │ ReLogin    │ │Notification│ │ Component  │
//!   │ Policy     │ │ Feed       │ │ handler    │
//!   └────────────┘ └────────────┘ └────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = HubManager::new(&config, auth, Arc::new(WsTransport::new(&config)))?;
//! let registry = EventRegistry::new(manager.get_or_create(), config.attach_timeout);
//!
//! // Safe before the connection is up; attaches once it is.
//! let subscription = registry.subscribe("Notice", |args| {
//!     println!("notice: {args:?}");
//!     Ok(())
//! });
//! manager.ensure_started().await?;
//!
//! // Later: removes exactly this handler.
//! drop(subscription);
//! ```

mod connection;
#[cfg(feature = "dioxus")]
mod hooks;
mod manager;
pub mod negotiate;
mod registry;

// Re-export connection types
pub use connection::{
    ClosedCallback, ConnectionState, EventCallback, HandlerId, HubConnection, HubSession,
    ReconnectConfig, ReconnectedCallback, Transport, WsTransport,
};

pub use manager::HubManager;
pub use registry::{AttachPhase, EventRegistry, Subscription};

#[cfg(feature = "dioxus")]
pub use hooks::{
    use_connection_state, use_event_subscription, use_notifications, use_realtime_provider,
    use_relogin_decision, RealtimeContext,
};
