//! Client-side state fed by the hub.

pub mod notifications;
pub mod relogin;

pub use notifications::{NotificationFeed, DEFAULT_FEED_CAPACITY};
pub use relogin::{ReLoginPolicy, DEFAULT_RELOGIN_DESCRIPTION, DEFAULT_RELOGIN_TITLE};
