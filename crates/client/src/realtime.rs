//! The realtime client for one login session.
//!
//! Wires the pieces together: one [`HubManager`] connection, an
//! [`EventRegistry`] over it, the [`ReLoginPolicy`] and the routing
//! subscriptions that feed notifications and forced-logout signals to the UI.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use courselink_shared::{Notification, NotificationPayload, ReLoginDecision};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;

use crate::auth_session::AuthProvider;
use crate::config::{ClientConfig, EventRoutes};
use crate::error::{ConfigError, ConnectionError};
use crate::stores::ReLoginPolicy;
use crate::ws::{ConnectionState, EventRegistry, HubConnection, HubManager, Subscription, Transport, WsTransport};

/// Where routed events end up, usually a toast area and a modal.
pub trait NotificationSink: Send + Sync + 'static {
    fn notify(&self, notification: Notification);

    /// A forced logout was decided. The decision is also available from
    /// [`RealtimeClient::relogin`].
    fn relogin_required(&self, _decision: &ReLoginDecision) {}
}

pub struct RealtimeClient {
    config: ClientConfig,
    auth: Arc<dyn AuthProvider>,
    manager: HubManager,
    registry: EventRegistry,
    relogin: ReLoginPolicy,
    routes: Vec<Subscription>,
    closed: AtomicBool,
}

impl RealtimeClient {
    /// Build the client and register its routing subscriptions.
    ///
    /// Must run inside a tokio runtime: subscriptions made before the hub
    /// connects wait on a spawned task.
    pub fn new(
        config: ClientConfig,
        auth: Arc<dyn AuthProvider>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, ConfigError> {
        let manager = HubManager::new(&config, Arc::clone(&auth), transport)?;
        let registry = EventRegistry::new(manager.get_or_create(), config.attach_timeout);
        let relogin = ReLoginPolicy::new();

        let routes = config
            .events
            .all_events()
            .into_iter()
            .map(|event| route(&registry, &config.events, &event, relogin.clone(), Arc::clone(&sink)))
            .collect();

        Ok(Self {
            config,
            auth,
            manager,
            registry,
            relogin,
            routes,
            closed: AtomicBool::new(false),
        })
    }

    /// [`RealtimeClient::new`] over the native WebSocket transport.
    pub fn connect(
        config: ClientConfig,
        auth: Arc<dyn AuthProvider>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, ConfigError> {
        let transport = Arc::new(WsTransport::new(&config));
        Self::new(config, auth, transport, sink)
    }

    /// Start the shared connection, or join a start already in progress.
    ///
    /// Goes through the manager, so a connection it replaced is never
    /// revived. The registry moves its subscriptions to whatever connection
    /// the manager hands out.
    pub async fn start(&self) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Stopped);
        }
        self.registry.follow(self.manager.get_or_create());
        let connection = self.manager.ensure_started().await?;
        self.registry.follow(connection);
        Ok(())
    }

    pub fn subscribe<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.subscribe(event, handler)
    }

    pub fn subscribe_json<T, F>(&self, event: &str, handler: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.subscribe_json(event, handler)
    }

    pub fn state(&self) -> ConnectionState {
        self.registry.connection().state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.registry.connection().watch_state()
    }

    pub fn relogin(&self) -> &ReLoginPolicy {
        &self.relogin
    }

    pub fn connection(&self) -> HubConnection {
        self.registry.connection()
    }

    pub fn manager(&self) -> &HubManager {
        &self.manager
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// End the session: close the hub connection, log out, clear the decision.
    ///
    /// The client cannot be started again afterwards.
    pub fn logout(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        crate::log_info!("Logging out, closing realtime connection");
        self.manager.shutdown();
        self.relogin.complete_logout(self.auth.as_ref());
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("hub", &self.manager.hub_url())
            .field("state", &self.state())
            .field("routes", &self.routes.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Subscribe the routing handler for one event name.
///
/// A payload that raises a re-login decision is not also shown as a regular
/// notification.
fn route(
    registry: &EventRegistry,
    routes: &EventRoutes,
    event: &str,
    relogin: ReLoginPolicy,
    sink: Arc<dyn NotificationSink>,
) -> Subscription {
    let is_relogin = routes.is_relogin(event);
    let is_notification = routes.is_notification(event);
    let name = event.to_string();

    registry.subscribe_json(event, move |payload: NotificationPayload| {
        if is_relogin {
            if let Some(decision) = relogin.apply(&payload) {
                sink.relogin_required(&decision);
                return Ok(());
            }
        }
        if is_notification {
            sink.notify(Notification::from_payload(name.clone(), payload));
        }
        Ok(())
    })
}
