//! Configuration for the orchestrator.

use std::time::Duration;

use anyhow::{Context, Result};
use stumatch_reconcile::{
    DEFAULT_BASE_PORT, DEFAULT_MAX_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL, DEFAULT_RETIRE_DELAY,
};

/// Orchestrator configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Storage network API base URL (example: http://localhost:8081/api).
    pub api_url: String,

    /// HTTP request timeout.
    pub http_timeout: Duration,

    /// First port tried for a new node.
    pub base_port: u32,

    /// Storage hint sent with start requests, in GB.
    pub node_storage_gb: u32,

    /// RAM hint sent with start requests, in GB.
    pub node_ram_gb: u32,

    /// Cadence of the authoritative state refresh.
    pub refresh_interval: Duration,

    /// Spacing between registration checks.
    pub poll_interval: Duration,

    /// Registration checks before a node is declared failed.
    pub poll_max_attempts: u32,

    /// How long an active lifecycle entry lingers before it is retired.
    pub retire_delay: Duration,

    /// Delay before re-syncing after a start/restart request.
    pub settle_delay: Duration,

    /// Spacing between chunk confirmations in a distribution reveal.
    pub reveal_step: Duration,

    /// Extra time a finished reveal stays visible.
    pub reveal_tail: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8081/api".to_string(),
            http_timeout: Duration::from_secs(30),
            base_port: DEFAULT_BASE_PORT,
            node_storage_gb: 5,
            node_ram_gb: 8,
            refresh_interval: Duration::from_secs(5),
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_max_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
            retire_delay: DEFAULT_RETIRE_DELAY,
            settle_delay: Duration::from_secs(3),
            reveal_step: Duration::from_millis(500),
            reveal_tail: Duration::from_millis(1000),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let number = |key: &str| -> Result<Option<u64>> {
            lookup(key)
                .map(|v| v.trim().parse::<u64>())
                .transpose()
                .with_context(|| format!("{key} must be a non-negative integer."))
        };
        let millis = |key: &str, default: Duration| -> Result<Duration> {
            Ok(number(key)?.map(Duration::from_millis).unwrap_or(default))
        };
        let small = |key: &str, default: u32| -> Result<u32> {
            match number(key)? {
                Some(v) => u32::try_from(v).with_context(|| format!("{key} is out of range.")),
                None => Ok(default),
            }
        };

        let api_url = lookup("STUMATCH_API_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_url);

        let http_timeout = number("STUMATCH_HTTP_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.http_timeout);

        let base_port = small("STUMATCH_BASE_PORT", defaults.base_port)?;
        if base_port == 0 || base_port > u32::from(u16::MAX) {
            anyhow::bail!("STUMATCH_BASE_PORT must be between 1 and 65535.");
        }

        let node_storage_gb = small("STUMATCH_NODE_STORAGE_GB", defaults.node_storage_gb)?;
        let node_ram_gb = small("STUMATCH_NODE_RAM_GB", defaults.node_ram_gb)?;

        // Keep timers from spinning on a zero interval.
        let refresh_interval = millis("STUMATCH_REFRESH_INTERVAL_MS", defaults.refresh_interval)?
            .max(Duration::from_millis(100));
        let poll_interval = millis("STUMATCH_POLL_INTERVAL_MS", defaults.poll_interval)?
            .max(Duration::from_millis(10));
        let poll_max_attempts =
            small("STUMATCH_POLL_MAX_ATTEMPTS", defaults.poll_max_attempts)?.max(1);

        let retire_delay = millis("STUMATCH_RETIRE_DELAY_MS", defaults.retire_delay)?;
        let settle_delay = millis("STUMATCH_SETTLE_DELAY_MS", defaults.settle_delay)?;
        let reveal_step = millis("STUMATCH_REVEAL_STEP_MS", defaults.reveal_step)?;
        let reveal_tail = millis("STUMATCH_REVEAL_TAIL_MS", defaults.reveal_tail)?;

        let log_level = lookup("STUMATCH_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            api_url,
            http_timeout,
            base_port,
            node_storage_gb,
            node_ram_gb,
            refresh_interval,
            poll_interval,
            poll_max_attempts,
            retire_delay,
            settle_delay,
            reveal_step,
            reveal_tail,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.api_url, "http://localhost:8081/api");
        assert_eq!(config.base_port, 50051);
        assert_eq!(config.node_storage_gb, 5);
        assert_eq!(config.node_ram_gb, 8);
        assert_eq!(config.refresh_interval, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.poll_max_attempts, 15);
        assert_eq!(config.retire_delay, Duration::from_secs(3));
        assert_eq!(config.reveal_step, Duration::from_millis(500));
        assert_eq!(config.reveal_tail, Duration::from_millis(1000));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("STUMATCH_API_URL", "http://storage.internal:9000/api/"),
            ("STUMATCH_BASE_PORT", "6000"),
            ("STUMATCH_POLL_MAX_ATTEMPTS", "30"),
            ("STUMATCH_REFRESH_INTERVAL_MS", "2500"),
        ]))
        .unwrap();

        assert_eq!(config.api_url, "http://storage.internal:9000/api");
        assert_eq!(config.base_port, 6000);
        assert_eq!(config.poll_max_attempts, 30);
        assert_eq!(config.refresh_interval, Duration::from_millis(2500));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_lookup(lookup(&[("STUMATCH_BASE_PORT", "abc")])).is_err());
        assert!(Config::from_lookup(lookup(&[("STUMATCH_BASE_PORT", "70000")])).is_err());
        assert!(Config::from_lookup(lookup(&[("STUMATCH_POLL_INTERVAL_MS", "-5")])).is_err());
    }

    #[test]
    fn test_zero_intervals_are_floored() {
        let config = Config::from_lookup(lookup(&[
            ("STUMATCH_REFRESH_INTERVAL_MS", "0"),
            ("STUMATCH_POLL_MAX_ATTEMPTS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.refresh_interval, Duration::from_millis(100));
        assert_eq!(config.poll_max_attempts, 1);
    }
}
