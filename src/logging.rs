//! Tracing bootstrap for hosts embedding this crate.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber: env-filtered, `info` by default.
///
/// Safe to call more than once; repeated calls are no-ops, which lets tests
/// initialize logging without coordinating.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
