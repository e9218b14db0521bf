//! Dioxus hooks over the realtime client.
//!
//! The client lives in context; components read reactive snapshots of its
//! watch channels and tie subscriptions to their own lifetime.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use courselink_shared::{Notification, ReLoginDecision};
use dioxus::prelude::*;
use serde_json::Value;

use super::connection::ConnectionState;
use super::registry::Subscription;
use crate::realtime::RealtimeClient;
use crate::stores::NotificationFeed;

/// Context handle shared by every component under the provider.
#[derive(Clone)]
pub struct RealtimeContext(pub Arc<RealtimeClient>);

/// Provide the client to the component tree and start it once.
pub fn use_realtime_provider(init: impl FnOnce() -> Arc<RealtimeClient>) -> RealtimeContext {
    let context = use_context_provider(|| RealtimeContext(init()));
    let client = context.0.clone();
    use_hook(move || {
        spawn(async move {
            if let Err(e) = client.start().await {
                crate::log_warn!("Realtime start failed: {}", e);
            }
        });
    });
    context
}

/// Subscribe for as long as the calling component is mounted.
///
/// Only the handler from the first render is used.
pub fn use_event_subscription<F>(event: &str, handler: F)
where
    F: Fn(&[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let context = use_context::<RealtimeContext>();
    let slot: Rc<RefCell<Option<Subscription>>> =
        use_hook(|| Rc::new(RefCell::new(Some(context.0.subscribe(event, handler)))));
    use_drop(move || {
        slot.borrow_mut().take();
    });
}

/// Current connection state (reactive - updates on every transition)
pub fn use_connection_state() -> Signal<ConnectionState> {
    let context = use_context::<RealtimeContext>();
    let mut state = use_signal(|| context.0.state());
    use_future(move || {
        let mut rx = context.0.watch_state();
        async move {
            while rx.changed().await.is_ok() {
                let next = rx.borrow_and_update().clone();
                state.set(next);
            }
        }
    });
    state
}

/// Current re-login decision. The modal opens while `required` is true.
pub fn use_relogin_decision() -> Signal<ReLoginDecision> {
    let context = use_context::<RealtimeContext>();
    let mut decision = use_signal(|| context.0.relogin().decision());
    use_future(move || {
        let mut rx = context.0.relogin().watch();
        async move {
            while rx.changed().await.is_ok() {
                let next = rx.borrow_and_update().clone();
                decision.set(next);
            }
        }
    });
    decision
}

/// Recent notifications from `feed`, oldest first.
pub fn use_notifications(feed: NotificationFeed) -> Signal<Vec<Notification>> {
    let mut items = use_signal(|| feed.snapshot());
    use_future(move || {
        let mut rx = feed.watch();
        async move {
            while rx.changed().await.is_ok() {
                let next: Vec<Notification> = rx.borrow_and_update().iter().cloned().collect();
                items.set(next);
            }
        }
    });
    items
}
