//! Authentication boundary.
//!
//! The realtime client never stores or rotates credentials. It asks the
//! [`AuthProvider`] for the current token on every connect and reconnect, and
//! hands logout back to it once the UI has acted on a re-login decision.

use std::sync::{Arc, RwLock};

/// Supplies bearer tokens and performs logout.
pub trait AuthProvider: Send + Sync + 'static {
    /// Current access token, `None` when signed out.
    fn access_token(&self) -> Option<String>;

    /// Drop the session. Called by the UI, never by the connection itself.
    fn logout(&self);
}

/// Closure producing the token for one connect attempt.
pub type TokenSupplier = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Build a [`TokenSupplier`] that reads from `auth` each time it is called.
pub fn token_supplier(auth: Arc<dyn AuthProvider>) -> TokenSupplier {
    Arc::new(move || auth.access_token())
}

/// In-memory session holding the current bearer token.
///
/// Hosts that refresh tokens call [`AuthSession::set_token`]; the next
/// reconnect picks the new value up.
#[derive(Debug, Default)]
pub struct AuthSession {
    token: RwLock<Option<String>>,
}

impl AuthSession {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    /// Replace the token after a refresh.
    pub fn set_token(&self, token: impl Into<String>) {
        let mut guard = self.token.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Some(token.into());
    }

    /// Check if a token is present
    pub fn is_authenticated(&self) -> bool {
        self.access_token().is_some()
    }
}

impl AuthProvider for AuthSession {
    fn access_token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn logout(&self) {
        let mut guard = self.token.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = None;
        crate::log_info!("Session cleared");
    }
}
