//! Guest log capture.
//!
//! Messages a guest emits through `env.log` are kept in the store's
//! [`HostContext`] and mirrored to `tracing`, tagged with the store id.

use grammar_bridge_core::{HostContext, LogLevel};
use tracing::{debug, error, info, warn};

/// Host side of the guest logging import.
pub struct LoggingHost;

impl LoggingHost {
    /// Record `message` at `level` for the store owning `ctx`.
    pub fn log(ctx: &mut HostContext, level: LogLevel, message: &str) {
        let store_id = ctx.store_id.as_str();
        match level {
            LogLevel::Debug => debug!(store_id, guest_log = true, "{}", message),
            LogLevel::Info => info!(store_id, guest_log = true, "{}", message),
            LogLevel::Warn => warn!(store_id, guest_log = true, "{}", message),
            LogLevel::Error => error!(store_id, guest_log = true, "{}", message),
        }

        ctx.log(level, message.to_string());
    }
}

/// Map the guest's numeric level (0=debug, 1=info, 2=warn, 3=error).
///
/// Unknown values are treated as info.
pub fn level_from_i32(level: i32) -> LogLevel {
    match level {
        0 => LogLevel::Debug,
        2 => LogLevel::Warn,
        3 => LogLevel::Error,
        _ => LogLevel::Info,
    }
}
