use std::sync::Arc;

use tracing_subscriber::EnvFilter;

/// Callback receiving human-readable panel log lines (the on-screen log).
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

const DEFAULT_FILTER: &str = "linepanel=info";

/// Installs the global fmt subscriber. Safe to call more than once.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// A sink that only forwards to tracing.
pub fn tracing_sink() -> LogSink {
    Arc::new(|line: &str| tracing::info!(target: "linepanel::panel", "{line}"))
}
