//! Process-wide owner of the single hub connection.

use std::sync::{Arc, Mutex};

use super::connection::{lock, HubConnection, ReconnectConfig, Transport};
use crate::auth_session::{token_supplier, AuthProvider, TokenSupplier};
use crate::config::ClientConfig;
use crate::error::{ConfigError, ConnectionError};

/// The singleton slot: the live connection and how many were ever built.
#[derive(Default)]
struct ConnectionHandle {
    connection: Option<HubConnection>,
    created: usize,
}

/// Hands out the one shared [`HubConnection`].
///
/// Every subscriber and every `ensure_started` caller goes through the same
/// manager, so there is never more than one live connection.
pub struct HubManager {
    url: String,
    tokens: TokenSupplier,
    transport: Arc<dyn Transport>,
    reconnect: ReconnectConfig,
    handle: Mutex<ConnectionHandle>,
}

impl HubManager {
    /// Resolve the hub endpoint. Nothing connects yet.
    pub fn new(
        config: &ClientConfig,
        auth: Arc<dyn AuthProvider>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        let url = config.hub_url()?;
        Ok(Self {
            url: url.to_string(),
            tokens: token_supplier(auth),
            transport,
            reconnect: config.reconnect.clone(),
            handle: Mutex::new(ConnectionHandle::default()),
        })
    }

    pub fn hub_url(&self) -> &str {
        &self.url
    }

    /// The live connection, created on first use.
    ///
    /// A connection that was stopped is released and replaced.
    pub fn get_or_create(&self) -> HubConnection {
        let mut handle = lock(&self.handle);
        if let Some(existing) = handle.connection.as_ref() {
            if !existing.is_stopped() {
                return existing.clone();
            }
            crate::log_debug!("Releasing stopped hub connection {}", existing.id());
        }

        let connection = HubConnection::new(
            self.url.clone(),
            Arc::clone(&self.tokens),
            Arc::clone(&self.transport),
            self.reconnect.clone(),
        );
        handle.created += 1;
        crate::log_info!(
            "Created hub connection {} for {} (#{})",
            connection.id(),
            self.url,
            handle.created
        );
        handle.connection = Some(connection.clone());
        connection
    }

    /// Get the connection and make sure it is started.
    ///
    /// Concurrent callers share one in-flight start.
    pub async fn ensure_started(&self) -> Result<HubConnection, ConnectionError> {
        let connection = self.get_or_create();
        connection.start().await?;
        Ok(connection)
    }

    /// The connection if one exists, without creating it.
    pub fn current(&self) -> Option<HubConnection> {
        lock(&self.handle).connection.clone()
    }

    /// Stop and release the connection.
    pub fn shutdown(&self) {
        let connection = lock(&self.handle).connection.take();
        if let Some(connection) = connection {
            crate::log_info!("Shutting down hub connection {}", connection.id());
            connection.stop();
        }
    }

    /// Number of connections built over the manager's life.
    pub fn connections_created(&self) -> usize {
        lock(&self.handle).created
    }
}

impl std::fmt::Debug for HubManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubManager")
            .field("url", &self.url)
            .field("connections_created", &self.connections_created())
            .finish_non_exhaustive()
    }
}
