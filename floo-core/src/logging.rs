//! Structured logging setup

use crate::config::LoggingConfig;

/// Initialize logging based on configuration.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(config: &LoggingConfig) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.level.clone());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .try_init();
}

/// Initialize with default settings
pub fn init_default() {
    init(&LoggingConfig::default());
}
