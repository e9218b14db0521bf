//! Logging setup and macros.
//!
//! The macros forward to `tracing` under the `courselink_client` target so a
//! host application can filter realtime chatter independently of its own logs.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "courselink_client=info";

/// Install a fmt subscriber honouring `RUST_LOG`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[doc(hidden)]
pub fn log_info_impl(msg: &str) {
    tracing::info!(target: "courselink_client", "{}", msg);
}

#[doc(hidden)]
pub fn log_error_impl(msg: &str) {
    tracing::error!(target: "courselink_client", "{}", msg);
}

#[doc(hidden)]
pub fn log_warn_impl(msg: &str) {
    tracing::warn!(target: "courselink_client", "{}", msg);
}

#[doc(hidden)]
pub fn log_debug_impl(msg: &str) {
    tracing::debug!(target: "courselink_client", "{}", msg);
}

/// Log an info message
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_info_impl(&format!($($arg)*))
    };
}

/// Log an error message
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_error_impl(&format!($($arg)*))
    };
}

/// Log a warning message
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::log_warn_impl(&format!($($arg)*))
    };
}

/// Log a debug message
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log_debug_impl(&format!($($arg)*))
    };
}
