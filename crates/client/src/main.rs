//! courselink-listen - print hub notifications from the command line
//!
//! Reads the usual `COURSELINK_*` variables plus `COURSELINK_ACCESS_TOKEN`,
//! connects, and prints every notification and re-login decision until
//! Ctrl-C or until the connection ends for good.

use std::sync::Arc;

use anyhow::Context;
use courselink_client::{
    logging, AuthSession, ClientConfig, NotificationSink, RealtimeClient,
};
use courselink_shared::{Notification, ReLoginDecision};
use tokio::sync::mpsc;

struct StdoutSink;

impl NotificationSink for StdoutSink {
    fn notify(&self, notification: Notification) {
        println!(
            "[{}] {}: {}",
            notification.received_at.format("%H:%M:%S"),
            notification.title.as_deref().unwrap_or("(untitled)"),
            notification.message.as_deref().unwrap_or("")
        );
    }

    fn relogin_required(&self, decision: &ReLoginDecision) {
        println!("!! {}: {}", decision.title, decision.description);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = ClientConfig::from_env();
    let auth = Arc::new(match std::env::var("COURSELINK_ACCESS_TOKEN") {
        Ok(token) if !token.trim().is_empty() => AuthSession::new(token.trim()),
        _ => {
            courselink_client::log_warn!("COURSELINK_ACCESS_TOKEN is not set, connecting anonymously");
            AuthSession::signed_out()
        }
    });

    let client = RealtimeClient::connect(config, auth, Arc::new(StdoutSink))
        .context("invalid hub configuration")?;

    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    client.connection().on_closed(move |error| {
        let _ = closed_tx.send(error.map(ToString::to_string));
    });

    client.start().await.context("could not connect to the hub")?;
    courselink_client::log_info!("Listening on {}", client.manager().hub_url());

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            courselink_client::log_info!("Interrupted, shutting down");
            client.logout();
        }
        reason = closed_rx.recv() => {
            match reason.flatten() {
                Some(reason) => anyhow::bail!("hub connection ended: {reason}"),
                None => courselink_client::log_info!("Hub connection closed"),
            }
        }
    }

    Ok(())
}
