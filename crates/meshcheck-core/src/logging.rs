use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

pub const DEFAULT_FILTER: &str = "meshcheck=info";

fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.filter.as_deref().unwrap_or(DEFAULT_FILTER))
    })
}

/// Install the global subscriber. Safe to call more than once; later calls are
/// ignored.
pub fn init(config: &LogConfig) {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter(config));
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("logging: subscriber already installed");
    }
}

/// Subscriber variant that routes output through the libtest capture.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(&LogConfig::default()))
        .with_test_writer()
        .try_init();
}
