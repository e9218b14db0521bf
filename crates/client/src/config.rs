//! Client configuration from environment variables.

use std::time::Duration;

use url::Url;

use crate::error::ConfigError;
use crate::ws::ReconnectConfig;

pub const DEFAULT_BASE_URL: &str = "http://localhost:5000";
pub const DEFAULT_HUB_PATH: &str = "/hubs/notifications";
pub const DEFAULT_NOTIFICATION_EVENT: &str = "ReceiveNotification";
pub const DEFAULT_RELOGIN_EVENT: &str = "RequireReLogin";

/// Which hub methods feed which consumer.
///
/// The backend decides event names; the same name may appear in both lists,
/// in which case the payload's `requireReLogin` flag picks the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRoutes {
    /// Informational notifications handed to the UI sink.
    pub notification_events: Vec<String>,
    /// Events inspected for a forced re-login.
    pub relogin_events: Vec<String>,
}

impl Default for EventRoutes {
    fn default() -> Self {
        Self {
            notification_events: vec![DEFAULT_NOTIFICATION_EVENT.to_string()],
            relogin_events: vec![
                DEFAULT_NOTIFICATION_EVENT.to_string(),
                DEFAULT_RELOGIN_EVENT.to_string(),
            ],
        }
    }
}

impl EventRoutes {
    /// Every routed event name once, case-insensitively, in first-seen order.
    pub fn all_events(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in self.notification_events.iter().chain(&self.relogin_events) {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                names.push(name.clone());
            }
        }
        names
    }

    pub fn is_notification(&self, event: &str) -> bool {
        self.notification_events.iter().any(|n| n.eq_ignore_ascii_case(event))
    }

    pub fn is_relogin(&self, event: &str) -> bool {
        self.relogin_events.iter().any(|n| n.eq_ignore_ascii_case(event))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend origin, e.g. `https://api.example.edu`.
    pub base_url: String,
    /// Hub path appended to `base_url`.
    pub hub_path: String,
    /// Connect straight to the WebSocket endpoint without `POST /negotiate`.
    pub skip_negotiation: bool,
    pub reconnect: ReconnectConfig,
    /// Ceiling for a subscriber waiting on `Connected`.
    pub attach_timeout: Duration,
    pub keep_alive_interval: Duration,
    /// Connection is considered lost after this long without any frame.
    pub server_timeout: Duration,
    pub handshake_timeout: Duration,
    pub events: EventRoutes,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            hub_path: DEFAULT_HUB_PATH.to_string(),
            skip_negotiation: false,
            reconnect: ReconnectConfig::default(),
            attach_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
            events: EventRoutes::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Parse configuration from the process environment.
    ///
    /// Environment variables (all optional):
    /// - `COURSELINK_API_BASE_URL`: backend origin (default: "http://localhost:5000")
    /// - `COURSELINK_HUB_PATH`: hub path (default: "/hubs/notifications")
    /// - `COURSELINK_SKIP_NEGOTIATION`: "true" | "false" (default: "false")
    /// - `COURSELINK_RECONNECT_MAX_ATTEMPTS`: 0 retries forever (default: 10)
    /// - `COURSELINK_RECONNECT_INITIAL_DELAY_MS` / `COURSELINK_RECONNECT_MAX_DELAY_MS`
    /// - `COURSELINK_ATTACH_TIMEOUT_MS`, `COURSELINK_KEEP_ALIVE_MS`, `COURSELINK_SERVER_TIMEOUT_MS`
    /// - `COURSELINK_NOTIFICATION_EVENTS` / `COURSELINK_RELOGIN_EVENTS`: comma-separated names
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(base_url) = lookup("COURSELINK_API_BASE_URL") {
            config.base_url = base_url;
        }
        if let Some(hub_path) = lookup("COURSELINK_HUB_PATH") {
            config.hub_path = hub_path;
        }
        if let Some(skip) = lookup("COURSELINK_SKIP_NEGOTIATION") {
            config.skip_negotiation = parse_or(&skip, "COURSELINK_SKIP_NEGOTIATION", config.skip_negotiation);
        }
        if let Some(raw) = lookup("COURSELINK_RECONNECT_MAX_ATTEMPTS") {
            config.reconnect.max_attempts =
                parse_or(&raw, "COURSELINK_RECONNECT_MAX_ATTEMPTS", config.reconnect.max_attempts);
        }
        if let Some(raw) = lookup("COURSELINK_RECONNECT_INITIAL_DELAY_MS") {
            config.reconnect.initial_delay_ms = parse_or(
                &raw,
                "COURSELINK_RECONNECT_INITIAL_DELAY_MS",
                config.reconnect.initial_delay_ms,
            );
        }
        if let Some(raw) = lookup("COURSELINK_RECONNECT_MAX_DELAY_MS") {
            config.reconnect.max_delay_ms =
                parse_or(&raw, "COURSELINK_RECONNECT_MAX_DELAY_MS", config.reconnect.max_delay_ms);
        }
        if let Some(raw) = lookup("COURSELINK_ATTACH_TIMEOUT_MS") {
            config.attach_timeout = millis_or(&raw, "COURSELINK_ATTACH_TIMEOUT_MS", config.attach_timeout);
        }
        if let Some(raw) = lookup("COURSELINK_KEEP_ALIVE_MS") {
            config.keep_alive_interval = millis_or(&raw, "COURSELINK_KEEP_ALIVE_MS", config.keep_alive_interval);
        }
        if let Some(raw) = lookup("COURSELINK_SERVER_TIMEOUT_MS") {
            config.server_timeout = millis_or(&raw, "COURSELINK_SERVER_TIMEOUT_MS", config.server_timeout);
        }
        if let Some(raw) = lookup("COURSELINK_NOTIFICATION_EVENTS") {
            config.events.notification_events = split_names(&raw);
        }
        if let Some(raw) = lookup("COURSELINK_RELOGIN_EVENTS") {
            config.events.relogin_events = split_names(&raw);
        }

        config
    }

    /// Resolve the hub endpoint from base URL and hub path.
    pub fn hub_url(&self) -> Result<Url, ConfigError> {
        let base = self.base_url.trim().trim_end_matches('/');
        let path = self.hub_path.trim().trim_start_matches('/');
        let joined = format!("{base}/{path}");
        let url = Url::parse(&joined).map_err(|e| ConfigError::InvalidUrl {
            url: joined.clone(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" | "ws" | "wss" => Ok(url),
            other => Err(ConfigError::InvalidUrl {
                url: joined,
                reason: format!("unsupported scheme '{other}'"),
            }),
        }
    }
}

fn parse_or<T: std::str::FromStr + Copy>(raw: &str, key: &str, fallback: T) -> T {
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            crate::log_warn!("Ignoring invalid {}='{}', keeping default", key, raw);
            fallback
        }
    }
}

fn millis_or(raw: &str, key: &str, fallback: Duration) -> Duration {
    let fallback_ms = u64::try_from(fallback.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(parse_or(raw, key, fallback_ms))
}

fn split_names(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}
