//! Hub connection state machine.
//!
//! A [`HubConnection`] owns at most one live [`HubSession`] at a time. The
//! session is pumped by a background task that also runs the reconnect loop,
//! so reconnected handlers always finish before the first event of the new
//! session is dispatched.
//!
//! Every lifecycle (one `start()` up to the matching `stop()` or terminal
//! failure) gets an epoch number. State writes carry the epoch they belong to
//! and are dropped once a newer lifecycle began, so a slow connect attempt can
//! never overwrite the state left by `stop()`.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use courselink_shared::{CloseMessage, HubMessage, Invocation};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
    event_key, ClosedCallback, ConnectionState, EventCallback, HandlerId, HubSession,
    ReconnectConfig, ReconnectedCallback, Transport,
};
use crate::auth_session::TokenSupplier;
use crate::error::{ConnectionError, HandlerInvocationError};

type StartFuture = Shared<BoxFuture<'static, Result<(), ConnectionError>>>;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Why a session stopped producing messages.
enum SessionEnd {
    /// Socket dropped, errored or timed out.
    Lost,
    /// Server sent a close message.
    Closed(CloseMessage),
}

enum StartPlan {
    Done,
    AwaitReconnect,
    Await(StartFuture),
}

/// A single logical connection to the hub, shared by every subscriber.
///
/// Cloning is cheap and yields another handle to the same connection.
#[derive(Clone)]
pub struct HubConnection {
    inner: Arc<Inner>,
}

struct Inner {
    id: Uuid,
    url: String,
    tokens: TokenSupplier,
    transport: Arc<dyn Transport>,
    reconnect: ReconnectConfig,
    state: watch::Sender<ConnectionState>,
    epoch: AtomicU64,
    stopped: AtomicBool,
    handlers: Mutex<HashMap<String, BTreeMap<HandlerId, EventCallback>>>,
    reconnected: Mutex<BTreeMap<HandlerId, ReconnectedCallback>>,
    closed: Mutex<BTreeMap<HandlerId, ClosedCallback>>,
    /// In-flight start, awaited by every concurrent caller.
    pending_start: Mutex<Option<StartFuture>>,
    /// Session pump for the epoch it was spawned in.
    run_task: Mutex<Option<(u64, JoinHandle<()>)>>,
    last_error: Mutex<Option<ConnectionError>>,
}

impl HubConnection {
    /// Create a connection. No network I/O happens until [`HubConnection::start`].
    pub fn new(
        url: impl Into<String>,
        tokens: TokenSupplier,
        transport: Arc<dyn Transport>,
        reconnect: ReconnectConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                url: url.into(),
                tokens,
                transport,
                reconnect,
                state,
                epoch: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                handlers: Mutex::new(HashMap::new()),
                reconnected: Mutex::new(BTreeMap::new()),
                closed: Mutex::new(BTreeMap::new()),
                pending_start: Mutex::new(None),
                run_task: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
        }
    }

    /// Identifier used in logs.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Whether [`HubConnection::stop`] was called. A stopped connection
    /// never connects again; the manager hands out a fresh one instead.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Error that ended the last lifecycle, if any.
    pub fn last_error(&self) -> Option<ConnectionError> {
        lock(&self.inner.last_error).clone()
    }

    /// Resolve once the state is `Connected`. Never resolves otherwise; wrap
    /// it in a timeout.
    pub async fn wait_until_connected(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(ConnectionState::is_connected).await;
    }

    /// Connect, or join the connect already in progress.
    ///
    /// Returns immediately when connected. While the reconnect loop runs, waits
    /// for its outcome instead of opening a second socket. Fails with
    /// [`ConnectionError::Stopped`] once the connection was stopped.
    ///
    /// The attempt runs on its own task, so it reaches `Connected` or
    /// `Disconnected` even if every caller stops waiting.
    pub async fn start(&self) -> Result<(), ConnectionError> {
        let plan = {
            let mut slot = lock(&self.inner.pending_start);
            if self.is_stopped() {
                return Err(ConnectionError::Stopped);
            }
            if let Some(pending) = slot.as_ref() {
                StartPlan::Await(pending.clone())
            } else {
                match self.state() {
                    ConnectionState::Connected => StartPlan::Done,
                    ConnectionState::Reconnecting { .. } => StartPlan::AwaitReconnect,
                    _ => {
                        let (epoch, _) = self.inner.begin_epoch(ConnectionState::Connecting);
                        let attempt = tokio::spawn(Arc::clone(&self.inner).connect(epoch));
                        let pending = async move {
                            attempt.await.unwrap_or(Err(ConnectionError::Stopped))
                        }
                        .boxed()
                        .shared();
                        *slot = Some(pending.clone());
                        StartPlan::Await(pending)
                    }
                }
            }
        };

        match plan {
            StartPlan::Done => Ok(()),
            StartPlan::AwaitReconnect => self.wait_for_reconnect().await,
            StartPlan::Await(pending) => pending.await,
        }
    }

    /// Tear the connection down.
    ///
    /// Closes the socket, cancels the reconnect loop and fails any in-flight
    /// start with [`ConnectionError::Stopped`]. Stopping is final: later
    /// `start()` calls fail too.
    pub fn stop(&self) {
        let inner = &self.inner;
        let (epoch, previous) = {
            let mut slot = lock(&inner.pending_start);
            inner.stopped.store(true, Ordering::SeqCst);
            slot.take();
            inner.begin_epoch(ConnectionState::Disconnecting)
        };
        if let Some((_, task)) = lock(&inner.run_task).take() {
            // Dropping the session inside the task closes the socket.
            task.abort();
        }

        let error = (previous != ConnectionState::Disconnected).then_some(ConnectionError::Stopped);
        if inner.disconnect(epoch, error.as_ref()) && error.is_some() {
            crate::log_info!("Hub connection {} to {} stopped", inner.id, inner.url);
            inner.fire_closed(None);
        }
    }

    /// Register a handler for a named server event.
    pub fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId::next();
        self.attach(event, id, Arc::new(handler));
        id
    }

    /// Insert or replace the handler registered under `id`.
    pub fn attach(&self, event: &str, id: HandlerId, handler: EventCallback) {
        lock(&self.inner.handlers)
            .entry(event_key(event))
            .or_default()
            .insert(id, handler);
    }

    /// Remove exactly the handler registered under `id`.
    pub fn off(&self, event: &str, id: HandlerId) -> bool {
        let key = event_key(event);
        let mut handlers = lock(&self.inner.handlers);
        let Some(set) = handlers.get_mut(&key) else {
            return false;
        };
        let removed = set.remove(&id).is_some();
        if set.is_empty() {
            handlers.remove(&key);
        }
        removed
    }

    /// Number of handlers currently registered for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        lock(&self.inner.handlers)
            .get(&event_key(event))
            .map_or(0, BTreeMap::len)
    }

    pub fn on_reconnected<F>(&self, handler: F) -> HandlerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = HandlerId::next();
        lock(&self.inner.reconnected).insert(id, Arc::new(handler));
        id
    }

    pub fn off_reconnected(&self, id: HandlerId) -> bool {
        lock(&self.inner.reconnected).remove(&id).is_some()
    }

    pub fn on_closed<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(Option<&ConnectionError>) + Send + Sync + 'static,
    {
        let id = HandlerId::next();
        lock(&self.inner.closed).insert(id, Arc::new(handler));
        id
    }

    pub fn off_closed(&self, id: HandlerId) -> bool {
        lock(&self.inner.closed).remove(&id).is_some()
    }

    async fn wait_for_reconnect(&self) -> Result<(), ConnectionError> {
        let mut rx = self.inner.state.subscribe();
        let connected = match rx
            .wait_for(|state| !matches!(state, ConnectionState::Reconnecting { .. }))
            .await
        {
            Ok(state) => state.is_connected(),
            Err(_) => false,
        };
        if connected {
            Ok(())
        } else {
            Err(self.last_error().unwrap_or(ConnectionError::Stopped))
        }
    }
}

impl std::fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnection")
            .field("id", &self.inner.id)
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Start a new lifecycle. Returns its epoch and the state it replaced.
    fn begin_epoch(&self, next: ConnectionState) -> (u64, ConnectionState) {
        let mut epoch = 0;
        let mut previous = ConnectionState::Disconnected;
        self.state.send_modify(|state| {
            epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            previous = std::mem::replace(state, next);
        });
        (epoch, previous)
    }

    /// Apply `next` if `epoch` is still current.
    fn transition(&self, epoch: u64, next: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            *state = next;
            true
        })
    }

    /// Move to `Disconnected` if `epoch` is still current, recording `error`
    /// before any watcher can observe the new state.
    fn disconnect(&self, epoch: u64, error: Option<&ConnectionError>) -> bool {
        self.state.send_if_modified(|state| {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            if let Some(err) = error {
                *lock(&self.last_error) = Some(err.clone());
            }
            *state = ConnectionState::Disconnected;
            true
        })
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Resolves when a newer lifecycle replaced `epoch`.
    async fn superseded(&self, epoch: u64) {
        let mut rx = self.state.subscribe();
        while self.is_current(epoch) {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn open_session(&self) -> Result<HubSession, ConnectionError> {
        // Fetched per attempt: the token may have rotated since the last one.
        let token = (self.tokens)();
        if token.is_none() {
            crate::log_debug!("No access token available for {}", self.url);
        }
        self.transport.connect(&self.url, token).await
    }

    async fn connect(self: Arc<Self>, epoch: u64) -> Result<(), ConnectionError> {
        crate::log_info!("Connecting hub {} to {}", self.id, self.url);

        let attempt = tokio::select! {
            result = self.open_session() => result,
            () = self.superseded(epoch) => Err(ConnectionError::Stopped),
        };

        let outcome = match attempt {
            Ok(session) => {
                if self.transition(epoch, ConnectionState::Connected) {
                    crate::log_info!("Hub {} connected to {}", self.id, self.url);
                    let task = tokio::spawn(Arc::clone(&self).run(session, epoch));
                    let mut slot = lock(&self.run_task);
                    if self.is_current(epoch) {
                        if let Some((_, previous)) = slot.replace((epoch, task)) {
                            previous.abort();
                        }
                    } else {
                        task.abort();
                    }
                    Ok(())
                } else {
                    Err(ConnectionError::Stopped)
                }
            }
            Err(err) => {
                if self.disconnect(epoch, Some(&err)) {
                    crate::log_warn!("Hub {} failed to connect to {}: {}", self.id, self.url, err);
                }
                Err(err)
            }
        };

        if self.is_current(epoch) {
            lock(&self.pending_start).take();
        }
        outcome
    }

    async fn run(self: Arc<Self>, session: HubSession, epoch: u64) {
        let mut session = session;
        loop {
            let end = self.pump(&mut session, epoch).await;
            drop(session);
            if !self.is_current(epoch) {
                return;
            }

            match end {
                SessionEnd::Closed(close) if !close.allow_reconnect => {
                    let reason = close
                        .error
                        .unwrap_or_else(|| "closed by server".to_string());
                    self.finish(epoch, ConnectionError::Closed(reason));
                    return;
                }
                SessionEnd::Closed(close) => crate::log_warn!(
                    "Hub {} closed the connection ({}), reconnecting",
                    self.url,
                    close.error.as_deref().unwrap_or("no reason")
                ),
                SessionEnd::Lost => crate::log_warn!("Lost connection to {}, reconnecting", self.url),
            }

            match self.reconnect(epoch).await {
                Ok(next) => {
                    if !self.transition(epoch, ConnectionState::Connected) {
                        return;
                    }
                    crate::log_info!("Hub {} reconnected to {}", self.id, self.url);
                    self.fire_reconnected();
                    session = next;
                }
                Err(err) => {
                    self.finish(epoch, err);
                    return;
                }
            }
        }
    }

    async fn pump(&self, session: &mut HubSession, epoch: u64) -> SessionEnd {
        while let Some(message) = session.next().await {
            if !self.is_current(epoch) {
                return SessionEnd::Lost;
            }
            match message {
                HubMessage::Invocation(invocation) => self.dispatch(&invocation),
                HubMessage::Close(close) => return SessionEnd::Closed(close),
                HubMessage::Ping => {}
                HubMessage::Other { kind } => {
                    crate::log_debug!("Ignoring hub message of type {}", kind);
                }
            }
        }
        SessionEnd::Lost
    }

    /// Fan an invocation out to its handlers in registration order. A failing
    /// handler is logged and does not stop the others.
    fn dispatch(&self, invocation: &Invocation) {
        let handlers: Vec<(HandlerId, EventCallback)> = lock(&self.handlers)
            .get(&event_key(&invocation.target))
            .map(|set| set.iter().map(|(id, cb)| (*id, Arc::clone(cb))).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            crate::log_debug!("No handler registered for '{}'", invocation.target);
            return;
        }

        for (id, callback) in handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&invocation.arguments)));
            let reason = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{err:#}"),
                Err(payload) => panic_message(payload.as_ref()),
            };
            let err = HandlerInvocationError {
                event: invocation.target.clone(),
                handler: id,
                reason,
            };
            crate::log_error!("{}", err);
        }
    }

    async fn reconnect(&self, epoch: u64) -> Result<HubSession, ConnectionError> {
        let mut attempt = 0u32;
        loop {
            if self.reconnect.exhausted(attempt) {
                return Err(ConnectionError::ReconnectExhausted { attempts: attempt });
            }
            if !self.transition(epoch, ConnectionState::Reconnecting { attempt: attempt + 1 }) {
                return Err(ConnectionError::Stopped);
            }

            let delay = self.reconnect.delay_for_attempt(attempt);
            crate::log_info!(
                "Reconnecting to {} in {}ms (attempt {})",
                self.url,
                delay.as_millis(),
                attempt + 1
            );
            tokio::time::sleep(delay).await;

            match self.open_session().await {
                Ok(session) => return Ok(session),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    crate::log_warn!("Reconnect attempt {} to {} failed: {}", attempt + 1, self.url, err);
                }
            }
            attempt += 1;
        }
    }

    fn finish(&self, epoch: u64, error: ConnectionError) {
        if !self.disconnect(epoch, Some(&error)) {
            return;
        }
        crate::log_error!("Hub connection to {} ended: {}", self.url, error);
        self.fire_closed(Some(&error));
    }

    fn fire_reconnected(&self) {
        let callbacks: Vec<ReconnectedCallback> = lock(&self.reconnected).values().cloned().collect();
        for callback in callbacks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback())) {
                crate::log_error!("Reconnected handler panicked: {}", panic_message(payload.as_ref()));
            }
        }
    }

    fn fire_closed(&self, error: Option<&ConnectionError>) {
        let callbacks: Vec<ClosedCallback> = lock(&self.closed).values().cloned().collect();
        for callback in callbacks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(error))) {
                crate::log_error!("Closed handler panicked: {}", panic_message(payload.as_ref()));
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}
