//! Diagnostic logging.
//!
//! Logs go to stderr so JSON output on stdout stays clean. The level comes
//! from `CHATSTATS_LOG`, then `RUST_LOG`, then `--verbose`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "CHATSTATS_LOG";

fn filter(verbose: bool) -> EnvFilter {
    let fallback = if verbose { "chatstats=debug" } else { "chatstats=warn" };
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Initialize logging. Call once at startup.
pub fn init(verbose: bool) {
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    // A subscriber may already be installed when embedded; keep it.
    let _ = tracing_subscriber::registry()
        .with(filter(verbose))
        .with(layer)
        .try_init();
}
