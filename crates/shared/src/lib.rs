//! Shared wire types for the courselink realtime client.
//!
//! Hub protocol framing lives in [`protocol`], notification payloads and the
//! re-login decision in [`models`].

pub mod models;
pub mod protocol;
pub mod error;

pub use models::*;
pub use protocol::*;
pub use error::*;
