//! Broker configuration: naming of buried queues, header names, drain-loop
//! tuning and the reconnection backoff.

use crate::backoff::BackoffConfig;
use crate::error::{QueueError, Result};
use crate::job::Priority;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings shared by a `Broker` and every queue derived from it.
///
/// Use `Configuration::builder()` or `Configuration::from_env()` to construct it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Appended to a queue name to form its buried queue name.
    pub buried_queue_suffix: String,
    /// Appended to a queue name to form its dead-letter exchange name.
    pub buried_exchange_suffix: String,
    /// Consecutive empty polls tolerated before the buried queue counts as drained.
    pub buried_non_blocking_retries: u32,
    /// Sleep between empty polls while draining the buried queue.
    pub buried_poll_interval: Duration,
    /// Header carrying the retry count of a job.
    pub retries_header: String,
    /// Header carrying the error type of a job.
    pub error_header: String,
    /// Reconnection backoff schedule.
    pub backoff: BackoffConfig,
    /// `x-max-priority` declared on every queue.
    pub max_priority: Priority,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            buried_queue_suffix: ".buriedQueue".to_string(),
            buried_exchange_suffix: ".buriedExchange".to_string(),
            buried_non_blocking_retries: 3,
            buried_poll_interval: Duration::from_millis(50),
            retries_header: "x-retries".to_string(),
            error_header: "x-error-type".to_string(),
            backoff: BackoffConfig::default(),
            max_priority: Priority::URGENT,
        }
    }
}

impl Configuration {
    /// Creates a new `ConfigurationBuilder` with every option unset.
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    /// Reads the configuration from `AMQP_*` environment variables, falling
    /// back to the defaults for unset ones.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();

        if let Some(v) = lookup("AMQP_BURIED_QUEUE_SUFFIX") {
            builder = builder.buried_queue_suffix(v);
        }
        if let Some(v) = lookup("AMQP_BURIED_EXCHANGE_SUFFIX") {
            builder = builder.buried_exchange_suffix(v);
        }
        if let Some(v) = lookup("AMQP_BURIED_BLOCKING_RETRIES") {
            let retries = parse_number("AMQP_BURIED_BLOCKING_RETRIES", &v)?;
            builder = builder.buried_non_blocking_retries(retries);
        }
        if let Some(v) = lookup("AMQP_BURIED_POLL_INTERVAL") {
            let interval = parse_duration("AMQP_BURIED_POLL_INTERVAL", &v)?;
            builder = builder.buried_poll_interval(interval);
        }
        if let Some(v) = lookup("AMQP_RETRIES_HEADER") {
            builder = builder.retries_header(v);
        }
        if let Some(v) = lookup("AMQP_ERROR_HEADER") {
            builder = builder.error_header(v);
        }

        let defaults = BackoffConfig::default();
        let backoff = BackoffConfig::new(
            match lookup("AMQP_BACKOFF_MIN") {
                Some(v) => parse_duration("AMQP_BACKOFF_MIN", &v)?,
                None => defaults.min,
            },
            match lookup("AMQP_BACKOFF_MAX") {
                Some(v) => parse_duration("AMQP_BACKOFF_MAX", &v)?,
                None => defaults.max,
            },
            match lookup("AMQP_BACKOFF_FACTOR") {
                Some(v) => parse_number("AMQP_BACKOFF_FACTOR", &v)?,
                None => defaults.factor,
            },
        );

        Ok(builder.backoff(backoff).build())
    }

    /// Name of the buried queue paired with `queue`.
    pub fn buried_queue_name(&self, queue: &str) -> String {
        format!("{}{}", queue, self.buried_queue_suffix)
    }

    /// Name of the dead-letter exchange routing `queue` into its buried queue.
    pub fn buried_exchange_name(&self, queue: &str) -> String {
        format!("{}{}", queue, self.buried_exchange_suffix)
    }
}

/// A builder for creating `Configuration` instances.
#[derive(Debug, Default)]
pub struct ConfigurationBuilder {
    buried_queue_suffix: Option<String>,
    buried_exchange_suffix: Option<String>,
    buried_non_blocking_retries: Option<u32>,
    buried_poll_interval: Option<Duration>,
    retries_header: Option<String>,
    error_header: Option<String>,
    backoff: Option<BackoffConfig>,
    max_priority: Option<Priority>,
}

impl ConfigurationBuilder {
    /// Defaults to `.buriedQueue`.
    pub fn buried_queue_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.buried_queue_suffix = Some(suffix.into());
        self
    }

    /// Defaults to `.buriedExchange`.
    pub fn buried_exchange_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.buried_exchange_suffix = Some(suffix.into());
        self
    }

    /// Defaults to 3.
    pub fn buried_non_blocking_retries(mut self, retries: u32) -> Self {
        self.buried_non_blocking_retries = Some(retries);
        self
    }

    /// Defaults to 50ms.
    pub fn buried_poll_interval(mut self, interval: Duration) -> Self {
        self.buried_poll_interval = Some(interval);
        self
    }

    /// Defaults to `x-retries`.
    pub fn retries_header(mut self, header: impl Into<String>) -> Self {
        self.retries_header = Some(header.into());
        self
    }

    /// Defaults to `x-error-type`.
    pub fn error_header(mut self, header: impl Into<String>) -> Self {
        self.error_header = Some(header.into());
        self
    }

    /// Defaults to `BackoffConfig::default()`.
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Defaults to `Priority::URGENT`.
    pub fn max_priority(mut self, priority: Priority) -> Self {
        self.max_priority = Some(priority);
        self
    }

    /// Builds the final `Configuration`, applying defaults for any unset options.
    pub fn build(self) -> Configuration {
        let defaults = Configuration::default();
        Configuration {
            buried_queue_suffix: self.buried_queue_suffix.unwrap_or(defaults.buried_queue_suffix),
            buried_exchange_suffix: self
                .buried_exchange_suffix
                .unwrap_or(defaults.buried_exchange_suffix),
            buried_non_blocking_retries: self
                .buried_non_blocking_retries
                .unwrap_or(defaults.buried_non_blocking_retries),
            buried_poll_interval: self
                .buried_poll_interval
                .unwrap_or(defaults.buried_poll_interval),
            retries_header: self.retries_header.unwrap_or(defaults.retries_header),
            error_header: self.error_header.unwrap_or(defaults.error_header),
            backoff: self.backoff.unwrap_or(defaults.backoff),
            max_priority: self.max_priority.unwrap_or(defaults.max_priority),
        }
    }
}

fn parse_number<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| QueueError::Config {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Parses `250ms`, `2s`, `1.5s`, `5m` or `1h`.
fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    let value = value.trim();
    let invalid = || QueueError::Config {
        key: key.to_string(),
        message: format!("'{}' is not a duration (expected e.g. 200ms, 30s, 5m)", value),
    };

    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(invalid)?;
    let (amount, unit) = value.split_at(split);
    let amount: f64 = amount.parse().map_err(|_| invalid())?;
    let scale = match unit {
        "ms" => 0.001,
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        _ => return Err(invalid()),
    };

    Duration::try_from_secs_f64(amount * scale).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_configuration_builder_defaults() {
        let config = Configuration::builder().build();

        assert_eq!(config, Configuration::default());
        assert_eq!(config.buried_queue_suffix, ".buriedQueue");
        assert_eq!(config.buried_exchange_suffix, ".buriedExchange");
        assert_eq!(config.buried_non_blocking_retries, 3);
        assert_eq!(config.buried_poll_interval, Duration::from_millis(50));
        assert_eq!(config.retries_header, "x-retries");
        assert_eq!(config.error_header, "x-error-type");
        assert_eq!(config.max_priority, Priority::URGENT);
    }

    #[test]
    fn test_configuration_builder_custom_values() {
        let config = Configuration::builder()
            .buried_queue_suffix("_dlq")
            .buried_exchange_suffix("_dlx")
            .buried_non_blocking_retries(7)
            .retries_header("x-attempts")
            .error_header("x-failure")
            .backoff(BackoffConfig::new(Duration::from_millis(10), Duration::from_secs(1), 3.0))
            .build();

        assert_eq!(config.buried_queue_name("jobs"), "jobs_dlq");
        assert_eq!(config.buried_exchange_name("jobs"), "jobs_dlx");
        assert_eq!(config.buried_non_blocking_retries, 7);
        assert_eq!(config.retries_header, "x-attempts");
        assert_eq!(config.error_header, "x-failure");
        assert_eq!(config.backoff.factor, 3.0);
    }

    #[test]
    fn test_lookup_overrides_defaults() {
        let config = Configuration::from_lookup(lookup_from(&[
            ("AMQP_BURIED_QUEUE_SUFFIX", ".dead"),
            ("AMQP_BURIED_BLOCKING_RETRIES", "5"),
            ("AMQP_BACKOFF_MIN", "1s"),
            ("AMQP_BACKOFF_MAX", "2m"),
            ("AMQP_BACKOFF_FACTOR", "1.5"),
            ("AMQP_BURIED_POLL_INTERVAL", "10ms"),
        ]))
        .unwrap();

        assert_eq!(config.buried_queue_suffix, ".dead");
        assert_eq!(config.buried_exchange_suffix, ".buriedExchange");
        assert_eq!(config.buried_non_blocking_retries, 5);
        assert_eq!(config.buried_poll_interval, Duration::from_millis(10));
        assert_eq!(config.backoff.min, Duration::from_secs(1));
        assert_eq!(config.backoff.max, Duration::from_secs(120));
        assert_eq!(config.backoff.factor, 1.5);
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        let err = Configuration::from_lookup(lookup_from(&[("AMQP_BACKOFF_MIN", "soon")]))
            .unwrap_err();
        assert!(matches!(err, QueueError::Config { ref key, .. } if key == "AMQP_BACKOFF_MIN"));

        let err = Configuration::from_lookup(lookup_from(&[("AMQP_BURIED_BLOCKING_RETRIES", "-1")]))
            .unwrap_err();
        assert!(matches!(err, QueueError::Config { .. }));
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("k", "200ms").unwrap(), Duration::from_millis(200));
        assert_eq!(parse_duration("k", "30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("k", "1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("k", "30").is_err());
        assert!(parse_duration("k", "ms").is_err());
        assert!(parse_duration("k", "3d").is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_reads_process_environment() {
        std::env::set_var("AMQP_RETRIES_HEADER", "x-env-retries");
        let config = Configuration::from_env();
        std::env::remove_var("AMQP_RETRIES_HEADER");

        assert_eq!(config.unwrap().retries_header, "x-env-retries");
    }

    #[test]
    #[serial]
    fn test_from_env_without_variables_is_default() {
        assert_eq!(Configuration::from_env().unwrap(), Configuration::default());
    }
}
