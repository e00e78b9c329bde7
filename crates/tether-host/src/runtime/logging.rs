//! Tracing subscriber setup.
//!
//! `TETHER_LOG` takes an `EnvFilter` directive string. Without it the filter
//! is `debug` when `TETHER_DEBUG` is set, `warn` otherwise.

use tracing_subscriber::EnvFilter;

use super::config::RuntimeConfig;

pub const ENV_LOG: &str = "TETHER_LOG";

/// Install the global fmt subscriber. Later calls are no-ops.
pub fn init(config: &RuntimeConfig) {
    let filter = EnvFilter::try_from_env(ENV_LOG)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}

fn default_directive(config: &RuntimeConfig) -> &'static str {
    if config.debug {
        "debug"
    } else {
        "warn"
    }
}
