//! Transport seam between the connection state machine and the network.

use async_trait::async_trait;
use courselink_shared::HubMessage;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::error::ConnectionError;

/// Opens physical hub connections.
///
/// One call is one connect attempt: negotiate if needed, upgrade, handshake.
/// Implementations must not retry internally; the connection owns the retry
/// policy.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(
        &self,
        url: &str,
        access_token: Option<String>,
    ) -> Result<HubSession, ConnectionError>;
}

/// Inbound side of one established connection.
///
/// The session ends (`next` returns `None`) when the peer side of the channel
/// goes away. Dropping the session tells the producer to close the socket.
pub struct HubSession {
    events: UnboundedReceiver<HubMessage>,
}

impl HubSession {
    /// Create a session and the sender a transport feeds it through.
    ///
    /// The producer should watch [`UnboundedSender::closed`] to learn that the
    /// session was dropped.
    pub fn channel() -> (UnboundedSender<HubMessage>, HubSession) {
        let (tx, rx) = unbounded_channel();
        (tx, HubSession { events: rx })
    }

    /// Next decoded message, `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<HubMessage> {
        self.events.recv().await
    }
}

impl std::fmt::Debug for HubSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubSession").finish_non_exhaustive()
    }
}
