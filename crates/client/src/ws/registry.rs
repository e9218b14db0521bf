//! Subscriber-facing event registry.
//!
//! UI code subscribes whenever it mounts, which is usually before the hub is
//! connected. The registry hides that: a subscription waits (bounded by
//! `attach_timeout`) for `Connected` and attaches its handler then. The
//! returned [`Subscription`] guard removes exactly that handler again, and
//! cancels the wait if it is still pending.
//!
//! The registry also owns the reconnection coordinator. After the transport
//! re-establishes a dropped connection, each attached subscription is
//! re-attached under its original [`HandlerId`], so a reconnect can never
//! leave two copies of one handler registered.
//!
//! When the manager replaces a stopped connection, [`EventRegistry::follow`]
//! moves every subscription that is still waiting or attached over to the new
//! one.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::connection::{lock, EventCallback, HandlerId, HubConnection};
use crate::error::AttachmentTimeoutError;

/// Where a subscription is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachPhase {
    /// Waiting for the connection.
    Pending,
    /// Handler is registered on the connection.
    Attached,
    /// The wait expired. The handler stays detached until the caller
    /// subscribes again.
    TimedOut,
    /// Unsubscribed.
    Released,
}

pub struct EventRegistry {
    shared: Arc<RegistryShared>,
}

/// The connection subscriptions attach to, and the reconnect hook installed
/// on it.
struct Binding {
    connection: HubConnection,
    reconnect_hook: HandlerId,
}

struct RegistryShared {
    binding: Mutex<Binding>,
    attach_timeout: Duration,
    live: Mutex<BTreeMap<HandlerId, Weak<SubscriptionInner>>>,
}

struct SubscriptionInner {
    id: HandlerId,
    event: String,
    callback: EventCallback,
    phase: watch::Sender<AttachPhase>,
    waiter: Mutex<Option<JoinHandle<()>>>,
}

impl EventRegistry {
    /// Bind a registry to `connection` and install its reconnect hook.
    pub fn new(connection: HubConnection, attach_timeout: Duration) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<RegistryShared>| RegistryShared {
            binding: Mutex::new(Binding {
                reconnect_hook: install_reconnect_hook(&connection, weak.clone()),
                connection,
            }),
            attach_timeout,
            live: Mutex::new(BTreeMap::new()),
        });
        Self { shared }
    }

    /// The connection subscriptions currently attach to.
    pub fn connection(&self) -> HubConnection {
        self.shared.connection()
    }

    /// Rebind to `connection` if it replaced the current one.
    ///
    /// Subscriptions that were waiting or attached move over: they attach
    /// right away when `connection` is connected and start a fresh bounded
    /// wait otherwise. Timed-out subscriptions stay detached.
    pub fn follow(&self, connection: HubConnection) {
        let previous = {
            let mut binding = lock(&self.shared.binding);
            if binding.connection.id() == connection.id() {
                return;
            }
            let hook = install_reconnect_hook(&connection, Arc::downgrade(&self.shared));
            let previous = std::mem::replace(
                &mut *binding,
                Binding {
                    connection,
                    reconnect_hook: hook,
                },
            );
            previous.connection.off_reconnected(previous.reconnect_hook);
            previous.connection
        };

        let live: Vec<Arc<SubscriptionInner>> = lock(&self.shared.live)
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        let mut moved = 0;
        for subscription in live {
            if let Some(waiter) = lock(&subscription.waiter).take() {
                waiter.abort();
            }
            let mut movable = false;
            subscription.phase.send_if_modified(|phase| {
                if !matches!(phase, AttachPhase::Pending | AttachPhase::Attached) {
                    return false;
                }
                movable = true;
                previous.off(&subscription.event, subscription.id);
                let changed = *phase != AttachPhase::Pending;
                *phase = AttachPhase::Pending;
                changed
            });
            if movable {
                self.schedule(&subscription);
                moved += 1;
            }
        }
        crate::log_info!(
            "Registry moved {} subscriptions from hub connection {} to {}",
            moved,
            previous.id(),
            self.shared.connection().id()
        );
    }

    /// Subscribe `handler` to `event`.
    ///
    /// Attaches immediately when connected. Otherwise spawns a bounded wait on
    /// the current tokio runtime; if it expires a warning is logged and the
    /// subscription stays detached for good.
    pub fn subscribe<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let (phase, _) = watch::channel(AttachPhase::Pending);
        let inner = Arc::new(SubscriptionInner {
            id: HandlerId::next(),
            event: event.to_string(),
            callback: Arc::new(handler),
            phase,
            waiter: Mutex::new(None),
        });
        lock(&self.shared.live).insert(inner.id, Arc::downgrade(&inner));
        self.schedule(&inner);

        Subscription {
            inner,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Attach now if connected, otherwise spawn the bounded wait.
    fn schedule(&self, subscription: &Arc<SubscriptionInner>) {
        let connection = self.shared.connection();
        if connection.state().is_connected() {
            self.shared.attach(subscription);
            return;
        }
        crate::log_debug!(
            "Deferring '{}' handler {} until the hub connects",
            subscription.event,
            subscription.id
        );
        let task = tokio::spawn(wait_and_attach(
            Arc::clone(&self.shared),
            connection,
            Arc::downgrade(subscription),
        ));
        *lock(&subscription.waiter) = Some(task);
    }

    /// Subscribe with the first invocation argument decoded into `T`.
    ///
    /// A payload that does not decode is reported like any other handler
    /// failure.
    pub fn subscribe_json<T, F>(&self, event: &str, handler: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = event.to_string();
        self.subscribe(event, move |arguments| {
            let first = arguments.first().cloned().unwrap_or(Value::Null);
            let payload = serde_json::from_value::<T>(first)
                .with_context(|| format!("decoding '{name}' payload"))?;
            handler(payload)
        })
    }

    /// Subscriptions not yet released.
    pub fn live_subscriptions(&self) -> usize {
        lock(&self.shared.live).len()
    }
}

impl Drop for EventRegistry {
    fn drop(&mut self) {
        let binding = lock(&self.shared.binding);
        binding.connection.off_reconnected(binding.reconnect_hook);
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("connection", &self.shared.connection().id())
            .field("attach_timeout", &self.shared.attach_timeout)
            .field("live", &self.live_subscriptions())
            .finish()
    }
}

fn install_reconnect_hook(connection: &HubConnection, registry: Weak<RegistryShared>) -> HandlerId {
    connection.on_reconnected(move || {
        if let Some(shared) = registry.upgrade() {
            shared.reattach_all();
        }
    })
}

async fn wait_and_attach(
    shared: Arc<RegistryShared>,
    connection: HubConnection,
    subscription: Weak<SubscriptionInner>,
) {
    let waited = tokio::time::timeout(shared.attach_timeout, connection.wait_until_connected()).await;
    let Some(subscription) = subscription.upgrade() else {
        return;
    };

    match waited {
        Ok(()) => {
            shared.attach(&subscription);
        }
        Err(_) => {
            let timed_out = subscription.phase.send_if_modified(|phase| {
                if *phase != AttachPhase::Pending {
                    return false;
                }
                *phase = AttachPhase::TimedOut;
                true
            });
            if timed_out {
                let err = AttachmentTimeoutError {
                    event: subscription.event.clone(),
                    waited: shared.attach_timeout,
                };
                crate::log_warn!("{}", err);
            }
        }
    }
}

impl RegistryShared {
    fn connection(&self) -> HubConnection {
        lock(&self.binding).connection.clone()
    }

    /// Register the handler unless the subscription was released or timed
    /// out. Replaces any handler already registered under the same id.
    fn attach(&self, subscription: &SubscriptionInner) -> bool {
        let connection = self.connection();
        let mut attached = false;
        subscription.phase.send_if_modified(|phase| {
            if matches!(phase, AttachPhase::Released | AttachPhase::TimedOut) {
                return false;
            }
            connection.attach(
                &subscription.event,
                subscription.id,
                Arc::clone(&subscription.callback),
            );
            attached = true;
            let changed = *phase != AttachPhase::Attached;
            *phase = AttachPhase::Attached;
            changed
        });
        if attached {
            crate::log_debug!(
                "Attached '{}' handler {}",
                subscription.event,
                subscription.id
            );
        }
        attached
    }

    /// Detach then attach every attached subscription under its own id.
    ///
    /// Timed-out subscriptions are left alone, and pending ones attach through
    /// their own wait.
    fn reattach_all(&self) {
        let connection = self.connection();
        if !connection.state().is_connected() {
            crate::log_info!(
                "Skipping re-attach on {}: connection is {:?}",
                connection.id(),
                connection.state()
            );
            return;
        }

        let live: Vec<Arc<SubscriptionInner>> = lock(&self.live)
            .values()
            .filter_map(Weak::upgrade)
            .collect();

        let mut count = 0;
        for subscription in live {
            subscription.phase.send_if_modified(|phase| {
                if *phase != AttachPhase::Attached {
                    return false;
                }
                connection.off(&subscription.event, subscription.id);
                connection.attach(
                    &subscription.event,
                    subscription.id,
                    Arc::clone(&subscription.callback),
                );
                count += 1;
                false
            });
        }
        crate::log_info!("Re-attached {} subscriptions after reconnect", count);
    }
}

/// Live registration returned by [`EventRegistry::subscribe`].
///
/// Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
    shared: Arc<RegistryShared>,
}

impl Subscription {
    pub fn id(&self) -> HandlerId {
        self.inner.id
    }

    pub fn event(&self) -> &str {
        &self.inner.event
    }

    pub fn phase(&self) -> AttachPhase {
        *self.inner.phase.borrow()
    }

    pub fn is_attached(&self) -> bool {
        self.phase() == AttachPhase::Attached
    }

    /// Resolve once the initial wait is over: `true` if the handler got
    /// attached, `false` if the wait timed out.
    pub async fn wait_attached(&self) -> bool {
        let mut rx = self.inner.phase.subscribe();
        let attached = match rx.wait_for(|phase| *phase != AttachPhase::Pending).await {
            Ok(phase) => *phase == AttachPhase::Attached,
            Err(_) => false,
        };
        attached
    }

    pub fn unsubscribe(self) {
        drop(self);
    }

    fn release(&self) {
        if let Some(waiter) = lock(&self.inner.waiter).take() {
            waiter.abort();
        }
        let connection = self.shared.connection();
        let inner = &self.inner;
        inner.phase.send_if_modified(|phase| {
            if *phase == AttachPhase::Released {
                return false;
            }
            connection.off(&inner.event, inner.id);
            *phase = AttachPhase::Released;
            true
        });
        lock(&self.shared.live).remove(&inner.id);
        crate::log_debug!("Released '{}' handler {}", inner.event, inner.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("event", &self.inner.event)
            .field("phase", &self.phase())
            .finish()
    }
}
