//! Session-invalidation policy.
//!
//! Turns forced-logout notifications into a [`ReLoginDecision`] the UI reads.
//! The policy never logs anyone out: the UI shows its dialog, runs the logout
//! and then calls [`ReLoginPolicy::acknowledge`] (or
//! [`ReLoginPolicy::complete_logout`], which does both).

use std::sync::Arc;

use courselink_shared::{NotificationPayload, ReLoginDecision};
use tokio::sync::watch;

use crate::auth_session::AuthProvider;

pub const DEFAULT_RELOGIN_TITLE: &str = "Session expired";
pub const DEFAULT_RELOGIN_DESCRIPTION: &str =
    "Your session is no longer valid. Please sign in again to continue.";

/// Holds the current decision. Clones share the same state.
#[derive(Debug, Clone)]
pub struct ReLoginPolicy {
    decision: Arc<watch::Sender<ReLoginDecision>>,
}

impl Default for ReLoginPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ReLoginPolicy {
    pub fn new() -> Self {
        let (decision, _) = watch::channel(ReLoginDecision::default());
        Self {
            decision: Arc::new(decision),
        }
    }

    /// Decision implied by `payload`, `None` when it is not a forced logout.
    pub fn evaluate(payload: &NotificationPayload) -> Option<ReLoginDecision> {
        if !payload.requires_re_login() {
            return None;
        }
        Some(ReLoginDecision::required(
            non_blank(payload.title.as_deref()).unwrap_or(DEFAULT_RELOGIN_TITLE),
            non_blank(payload.message.as_deref()).unwrap_or(DEFAULT_RELOGIN_DESCRIPTION),
        ))
    }

    /// Feed one payload. Returns the new decision if it demanded re-login;
    /// any other payload leaves the state untouched.
    pub fn apply(&self, payload: &NotificationPayload) -> Option<ReLoginDecision> {
        let decision = Self::evaluate(payload)?;
        crate::log_warn!("Server requires re-login: {}", decision.title);
        self.decision.send_replace(decision.clone());
        Some(decision)
    }

    pub fn decision(&self) -> ReLoginDecision {
        self.decision.borrow().clone()
    }

    pub fn is_required(&self) -> bool {
        self.decision.borrow().required
    }

    /// Receiver notified on every change.
    pub fn watch(&self) -> watch::Receiver<ReLoginDecision> {
        self.decision.subscribe()
    }

    /// Reset after the UI acted on the decision.
    pub fn acknowledge(&self) {
        self.decision.send_if_modified(|decision| {
            if *decision == ReLoginDecision::default() {
                return false;
            }
            *decision = ReLoginDecision::default();
            true
        });
    }

    /// Run the provider's logout, then acknowledge.
    pub fn complete_logout(&self, auth: &dyn AuthProvider) {
        auth.logout();
        self.acknowledge();
    }
}

fn non_blank(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|t| !t.is_empty())
}
