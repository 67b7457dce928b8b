//! Process-wide tracing setup. Logs go to stderr; tests that want silence
//! use the discarding variant.

use tracing_subscriber::EnvFilter;

/// Install the stderr subscriber, honoring RUST_LOG and defaulting to
/// "info". A no-op if a subscriber is already installed.
pub fn init() {
    init_with_filter("info");
}

/// Install the stderr subscriber with an explicit default filter, e.g.
/// "ldapserver=debug,info". RUST_LOG still takes precedence.
pub fn init_with_filter(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Discard all log output. For tests.
pub fn init_discarding() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("off"))
        .with_writer(std::io::sink)
        .try_init();
}
