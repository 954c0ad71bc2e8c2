//! Aggregator configuration from environment variables
//!
//! Scalar knobs only. Correlation expressions, predicates and merge
//! strategies are wired in code through `AggregationCoreBuilder`.

use super::store::RecoverySettings;
use super::timeout::DEFAULT_TIMEOUT_POLL_INTERVAL;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Aggregation behaviour knobs
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorConfig {
    /// Fixed completion size (0 = disabled)
    pub completion_size: usize,

    /// Fixed inactivity timeout in milliseconds (0 = disabled)
    pub completion_timeout_ms: u64,

    /// Period for completing every pending group (0 = disabled)
    pub completion_interval_ms: u64,

    /// Sweep period of the timeout scheduler
    pub timeout_poll_interval_ms: u64,

    /// Evaluate completion against the incoming item before merging
    pub eager_check_completion: bool,

    /// Drop items whose correlation key is missing instead of failing
    pub ignore_invalid_correlation_keys: bool,

    pub close_correlation_key_on_completion: bool,

    /// Capacity of the closed-key cache (0 = unbounded)
    pub closed_key_capacity: usize,

    /// Complete when the external batch-size hint is reached
    pub completion_from_batch_consumer: bool,

    /// Complete all pending groups during shutdown
    pub force_completion_on_stop: bool,

    /// Drop groups completed by timeout instead of dispatching them
    pub discard_on_completion_timeout: bool,

    /// Maximum concurrent downstream deliveries
    pub worker_pool_size: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            completion_size: 0,
            completion_timeout_ms: 0,
            completion_interval_ms: 0,
            timeout_poll_interval_ms: DEFAULT_TIMEOUT_POLL_INTERVAL.as_millis() as u64,
            eager_check_completion: false,
            ignore_invalid_correlation_keys: false,
            close_correlation_key_on_completion: false,
            closed_key_capacity: 0,
            completion_from_batch_consumer: false,
            force_completion_on_stop: false,
            discard_on_completion_timeout: false,
            worker_pool_size: 10,
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    match lookup(name) {
        Some(raw) => match raw.trim().to_lowercase().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Invalid {} '{}', using default", name, raw);
                default
            }
        },
        None => default,
    }
}

impl AggregatorConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `GROUPFLOW_COMPLETION_SIZE` (default: 0)
    /// - `GROUPFLOW_COMPLETION_TIMEOUT_MS` (default: 0)
    /// - `GROUPFLOW_COMPLETION_INTERVAL_MS` (default: 0)
    /// - `GROUPFLOW_TIMEOUT_POLL_INTERVAL_MS` (default: 1000)
    /// - `GROUPFLOW_EAGER_CHECK_COMPLETION` (default: false)
    /// - `GROUPFLOW_IGNORE_INVALID_CORRELATION_KEYS` (default: false)
    /// - `GROUPFLOW_CLOSE_CORRELATION_KEY_ON_COMPLETION` (default: false)
    /// - `GROUPFLOW_CLOSED_KEY_CAPACITY` (default: 0, unbounded)
    /// - `GROUPFLOW_COMPLETION_FROM_BATCH_CONSUMER` (default: false)
    /// - `GROUPFLOW_FORCE_COMPLETION_ON_STOP` (default: false)
    /// - `GROUPFLOW_DISCARD_ON_COMPLETION_TIMEOUT` (default: false)
    /// - `GROUPFLOW_WORKER_POOL_SIZE` (default: 10)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as `from_env` with a custom variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            completion_size: parse_or(&lookup, "GROUPFLOW_COMPLETION_SIZE", defaults.completion_size),
            completion_timeout_ms: parse_or(
                &lookup,
                "GROUPFLOW_COMPLETION_TIMEOUT_MS",
                defaults.completion_timeout_ms,
            ),
            completion_interval_ms: parse_or(
                &lookup,
                "GROUPFLOW_COMPLETION_INTERVAL_MS",
                defaults.completion_interval_ms,
            ),
            timeout_poll_interval_ms: parse_or(
                &lookup,
                "GROUPFLOW_TIMEOUT_POLL_INTERVAL_MS",
                defaults.timeout_poll_interval_ms,
            ),
            eager_check_completion: parse_or(
                &lookup,
                "GROUPFLOW_EAGER_CHECK_COMPLETION",
                defaults.eager_check_completion,
            ),
            ignore_invalid_correlation_keys: parse_or(
                &lookup,
                "GROUPFLOW_IGNORE_INVALID_CORRELATION_KEYS",
                defaults.ignore_invalid_correlation_keys,
            ),
            close_correlation_key_on_completion: parse_or(
                &lookup,
                "GROUPFLOW_CLOSE_CORRELATION_KEY_ON_COMPLETION",
                defaults.close_correlation_key_on_completion,
            ),
            closed_key_capacity: parse_or(
                &lookup,
                "GROUPFLOW_CLOSED_KEY_CAPACITY",
                defaults.closed_key_capacity,
            ),
            completion_from_batch_consumer: parse_or(
                &lookup,
                "GROUPFLOW_COMPLETION_FROM_BATCH_CONSUMER",
                defaults.completion_from_batch_consumer,
            ),
            force_completion_on_stop: parse_or(
                &lookup,
                "GROUPFLOW_FORCE_COMPLETION_ON_STOP",
                defaults.force_completion_on_stop,
            ),
            discard_on_completion_timeout: parse_or(
                &lookup,
                "GROUPFLOW_DISCARD_ON_COMPLETION_TIMEOUT",
                defaults.discard_on_completion_timeout,
            ),
            worker_pool_size: parse_or(
                &lookup,
                "GROUPFLOW_WORKER_POOL_SIZE",
                defaults.worker_pool_size,
            ),
        }
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn completion_interval(&self) -> Duration {
        Duration::from_millis(self.completion_interval_ms)
    }

    pub fn timeout_poll_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_poll_interval_ms)
    }
}

/// Store selection and recovery settings
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// SQLite database path; `None` selects the in-memory store
    pub db_path: Option<String>,
    pub recovery_enabled: bool,
    pub recovery_interval_ms: u64,
    /// 0 = unlimited
    pub max_redeliveries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            recovery_enabled: true,
            recovery_interval_ms: 5_000,
            max_redeliveries: 0,
        }
    }
}

impl StoreConfig {
    /// Environment variables:
    /// - `GROUPFLOW_DB_PATH` (default: unset, in-memory store)
    /// - `GROUPFLOW_RECOVERY_ENABLED` (default: true)
    /// - `GROUPFLOW_RECOVERY_INTERVAL_MS` (default: 5000, 0 = scan once)
    /// - `GROUPFLOW_MAX_REDELIVERIES` (default: 0, unlimited)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            db_path: lookup("GROUPFLOW_DB_PATH").filter(|p| !p.trim().is_empty()),
            recovery_enabled: parse_or(&lookup, "GROUPFLOW_RECOVERY_ENABLED", defaults.recovery_enabled),
            recovery_interval_ms: parse_or(
                &lookup,
                "GROUPFLOW_RECOVERY_INTERVAL_MS",
                defaults.recovery_interval_ms,
            ),
            max_redeliveries: parse_or(&lookup, "GROUPFLOW_MAX_REDELIVERIES", defaults.max_redeliveries),
        }
    }

    pub fn recovery_settings(&self) -> RecoverySettings {
        RecoverySettings {
            enabled: self.recovery_enabled,
            interval: Duration::from_millis(self.recovery_interval_ms),
            max_redeliveries: (self.max_redeliveries > 0).then_some(self.max_redeliveries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = AggregatorConfig::from_lookup(|_| None);
        assert_eq!(config, AggregatorConfig::default());
        assert_eq!(config.timeout_poll_interval(), Duration::from_millis(1000));
        assert_eq!(config.worker_pool_size, 10);
        assert!(!config.eager_check_completion);
    }

    #[test]
    fn test_custom_config() {
        let config = AggregatorConfig::from_lookup(lookup_from(&[
            ("GROUPFLOW_COMPLETION_SIZE", "5"),
            ("GROUPFLOW_COMPLETION_TIMEOUT_MS", "250"),
            ("GROUPFLOW_EAGER_CHECK_COMPLETION", "TRUE"),
            ("GROUPFLOW_CLOSE_CORRELATION_KEY_ON_COMPLETION", "true"),
            ("GROUPFLOW_CLOSED_KEY_CAPACITY", "100"),
            ("GROUPFLOW_WORKER_POOL_SIZE", "not-a-number"),
        ]));

        assert_eq!(config.completion_size, 5);
        assert_eq!(config.completion_timeout(), Duration::from_millis(250));
        assert!(config.eager_check_completion);
        assert!(config.close_correlation_key_on_completion);
        assert_eq!(config.closed_key_capacity, 100);
        // Invalid values fall back to defaults
        assert_eq!(config.worker_pool_size, 10);
    }

    #[test]
    fn test_store_config() {
        let config = StoreConfig::from_lookup(|_| None);
        assert_eq!(config.db_path, None);
        assert_eq!(config.recovery_settings().max_redeliveries, None);

        let config = StoreConfig::from_lookup(lookup_from(&[
            ("GROUPFLOW_DB_PATH", "/tmp/groupflow.db"),
            ("GROUPFLOW_RECOVERY_INTERVAL_MS", "0"),
            ("GROUPFLOW_MAX_REDELIVERIES", "3"),
        ]));
        let recovery = config.recovery_settings();
        assert_eq!(config.db_path.as_deref(), Some("/tmp/groupflow.db"));
        assert!(recovery.enabled);
        assert!(recovery.interval.is_zero());
        assert_eq!(recovery.max_redeliveries, Some(3));
    }
}
