//! Notification payloads pushed over the hub and the re-login decision they
//! may produce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// First argument of a notification invocation.
///
/// Hubs configured with the default .NET casing send PascalCase keys, so both
/// spellings are accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    #[serde(default, alias = "Title")]
    pub title: Option<String>,
    #[serde(default, alias = "Message")]
    pub message: Option<String>,
    #[serde(default, alias = "Metadata")]
    pub metadata: Option<NotificationMetadata>,
}

impl NotificationPayload {
    /// True only when the server explicitly sets `metadata.requireReLogin`.
    pub fn requires_re_login(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.require_re_login)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NotificationMetadata {
    #[serde(
        default,
        rename = "requireReLogin",
        alias = "RequireReLogin",
        skip_serializing_if = "Option::is_none"
    )]
    pub require_re_login: Option<bool>,
    /// Everything else the backend attaches (course ids, links, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An informational notification as handed to the UI sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Hub method name the payload arrived on.
    pub event: String,
    pub title: Option<String>,
    pub message: Option<String>,
    pub metadata: Option<NotificationMetadata>,
    pub received_at: DateTime<Utc>,
}

impl Notification {
    pub fn from_payload(event: impl Into<String>, payload: NotificationPayload) -> Self {
        Self {
            event: event.into(),
            title: payload.title,
            message: payload.message,
            metadata: payload.metadata,
            received_at: Utc::now(),
        }
    }
}

/// Whether the UI must force the user through logout and sign-in again.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReLoginDecision {
    pub required: bool,
    pub title: String,
    pub description: String,
}

impl ReLoginDecision {
    pub fn required(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            required: true,
            title: title.into(),
            description: description.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_camel_case_payload() {
        let payload: NotificationPayload = serde_json::from_value(json!({
            "title": "Session ended",
            "message": "Your role changed",
            "metadata": { "requireReLogin": true, "courseId": 42 }
        }))
        .unwrap();
        assert!(payload.requires_re_login());
        let metadata = payload.metadata.unwrap();
        assert_eq!(metadata.extra.get("courseId"), Some(&json!(42)));
    }

    #[test]
    fn decodes_pascal_case_payload() {
        let payload: NotificationPayload = serde_json::from_value(json!({
            "Title": "Heads up",
            "Message": "New prompt published",
            "Metadata": { "RequireReLogin": false }
        }))
        .unwrap();
        assert_eq!(payload.title.as_deref(), Some("Heads up"));
        assert!(!payload.requires_re_login());
    }

    #[test]
    fn missing_or_null_flag_means_no_re_login() {
        let bare: NotificationPayload = serde_json::from_value(json!({})).unwrap();
        assert!(!bare.requires_re_login());

        let null_flag: NotificationPayload =
            serde_json::from_value(json!({ "metadata": { "requireReLogin": null } })).unwrap();
        assert!(!null_flag.requires_re_login());
    }
}
