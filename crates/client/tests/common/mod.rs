//! Scripted in-memory transport and helpers shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use courselink_client::auth_session::{token_supplier, AuthProvider};
use courselink_client::ws::{HubConnection, HubSession, ReconnectConfig, Transport};
use courselink_client::ConnectionError;
use courselink_shared::{CloseMessage, HubMessage, Invocation};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

pub const HUB_URL: &str = "http://hub.test/hubs/notifications";

/// What the next connect attempt does.
#[derive(Debug, Clone)]
pub enum Outcome {
    Accept { delay: Duration },
    Fail { delay: Duration, error: ConnectionError },
}

impl Outcome {
    pub fn accept() -> Self {
        Outcome::Accept { delay: Duration::ZERO }
    }

    pub fn accept_after(ms: u64) -> Self {
        Outcome::Accept { delay: Duration::from_millis(ms) }
    }

    pub fn refuse() -> Self {
        Outcome::Fail {
            delay: Duration::ZERO,
            error: ConnectionError::Connect {
                url: HUB_URL.to_string(),
                reason: "connection refused".to_string(),
            },
        }
    }

    pub fn refuse_after(ms: u64) -> Self {
        match Self::refuse() {
            Outcome::Fail { error, .. } => Outcome::Fail {
                delay: Duration::from_millis(ms),
                error,
            },
            accept => accept,
        }
    }

    pub fn fail(error: ConnectionError) -> Self {
        Outcome::Fail { delay: Duration::ZERO, error }
    }
}

/// Transport that follows a script. Once the script runs out every attempt
/// is accepted immediately.
#[derive(Default)]
pub struct FakeTransport {
    script: Mutex<VecDeque<Outcome>>,
    attempts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    tokens: Mutex<Vec<Option<String>>>,
    sessions: Mutex<Vec<UnboundedSender<HubMessage>>>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(outcomes: impl IntoIterator<Item = Outcome>) -> Arc<Self> {
        let transport = Self::new();
        transport.script(outcomes);
        transport
    }

    pub fn script(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Token passed to each attempt, in order.
    pub fn tokens(&self) -> Vec<Option<String>> {
        self.tokens.lock().unwrap().clone()
    }

    /// Sessions whose consumer is still attached.
    pub fn open_sessions(&self) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Deliver a message on the newest session.
    pub fn send(&self, message: HubMessage) {
        let sessions = self.sessions.lock().unwrap();
        let tx = sessions.last().expect("no session established");
        tx.send(message).expect("session already gone");
    }

    pub fn push(&self, target: &str, arguments: Vec<Value>) {
        self.send(HubMessage::Invocation(Invocation::new(target, arguments)));
    }

    pub fn close(&self, error: Option<&str>, allow_reconnect: bool) {
        self.send(HubMessage::Close(CloseMessage {
            error: error.map(str::to_string),
            allow_reconnect,
        }));
    }

    /// Simulate the socket dropping.
    pub fn drop_session(&self) {
        self.sessions.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        _url: &str,
        access_token: Option<String>,
    ) -> Result<HubSession, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(access_token);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(Outcome::accept);

        match outcome {
            Outcome::Accept { delay } => {
                tokio::time::sleep(delay).await;
                let (tx, session) = HubSession::channel();
                self.sessions.lock().unwrap().push(tx);
                Ok(session)
            }
            Outcome::Fail { delay, error } => {
                tokio::time::sleep(delay).await;
                Err(error)
            }
        }
    }
}

/// Short, bounded backoff for tests.
pub fn fast_reconnect(max_attempts: u32) -> ReconnectConfig {
    ReconnectConfig {
        max_attempts,
        initial_delay_ms: 100,
        max_delay_ms: 1000,
        backoff_multiplier: 2.0,
    }
}

pub fn connection(
    transport: Arc<FakeTransport>,
    auth: Arc<dyn AuthProvider>,
    reconnect: ReconnectConfig,
) -> HubConnection {
    HubConnection::new(HUB_URL, token_supplier(auth), transport, reconnect)
}

/// Let every runnable task finish. With a paused clock this only returns
/// once the runtime is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Thread-safe call log.
#[derive(Clone, Default)]
pub struct Calls(Arc<Mutex<Vec<String>>>);

impl Calls {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}
