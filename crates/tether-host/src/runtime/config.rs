//! Runtime configuration shared by every context opened on a registry.

use std::time::Duration;

pub const ENV_STRICT_IDENTITY: &str = "TETHER_STRICT_IDENTITY";
pub const ENV_POLL_MS: &str = "TETHER_POLL_MS";
pub const ENV_DEBUG: &str = "TETHER_DEBUG";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Return the existing live proxy when the same core is wrapped twice.
    pub strict_identity: bool,
    /// Upper bound on how long `Host::run` sleeps before re-checking liveness.
    pub poll_interval: Duration,
    /// Verbose lifecycle logging when no explicit filter is given.
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            strict_identity: cfg!(feature = "strict-identity"),
            poll_interval: DEFAULT_POLL_INTERVAL,
            debug: false,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `TETHER_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(v) = lookup(ENV_STRICT_IDENTITY) {
            config.strict_identity = parse_flag(&v);
        }
        if let Some(ms) = lookup(ENV_POLL_MS).and_then(|v| v.trim().parse::<u64>().ok()) {
            config.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(v) = lookup(ENV_DEBUG) {
            config.debug = parse_flag(&v);
        }
        config
    }

    pub fn with_strict_identity(mut self, enabled: bool) -> Self {
        self.strict_identity = enabled;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = RuntimeConfig::from_lookup(lookup(&[]));
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.strict_identity, cfg!(feature = "strict-identity"));
        assert_eq!(config.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn env_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (ENV_STRICT_IDENTITY, "yes"),
            (ENV_POLL_MS, "25"),
            (ENV_DEBUG, "1"),
        ]));
        assert!(config.strict_identity);
        assert_eq!(config.poll_interval, Duration::from_millis(25));
        assert!(config.debug);
    }

    #[test]
    fn malformed_values_fall_back() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (ENV_STRICT_IDENTITY, "nope"),
            (ENV_POLL_MS, "soon"),
        ]));
        assert!(!config.strict_identity);
        assert_eq!(config.poll_interval, Duration::from_millis(10));

        let config = RuntimeConfig::from_lookup(lookup(&[(ENV_POLL_MS, "0")]));
        assert_eq!(config.poll_interval, Duration::from_millis(1));
    }
}
