//! Setup for the application logging.
//!
//! It redirects the tracing events to the standard output with the
//! level taken from `RUST_LOG`, defaulting to `info`. Initialization
//! happens at most once per process; later calls are no-ops so tests
//! can call it freely.
use std::sync::Once;

use tracing::info;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// It initializes the global tracing subscriber.
pub fn setup() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .init();

        info!("logging initialized.");
    });
}
