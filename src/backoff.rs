//! Exponential backoff used between reconnection attempts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounds of the reconnection delay schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub min: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl BackoffConfig {
    /// Creates a new backoff configuration.
    ///
    /// # Arguments
    /// * `min` - Delay before the first retry.
    /// * `max` - Upper bound for any single delay.
    /// * `factor` - Multiplier applied to the delay after every attempt.
    pub fn new(min: Duration, max: Duration, factor: f64) -> Self {
        Self { min, max, factor }
    }
}

impl Default for BackoffConfig {
    /// 200ms doubling up to 30s.
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(30), 2.0)
    }
}

/// Stateful delay schedule: `min * factor^attempt`, capped at `max`, no jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Returns the delay for the current attempt and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Restarts the schedule from `min`.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let min = self.config.min.as_secs_f64();
        let max = self.config.max.as_secs_f64();
        if min >= max {
            return self.config.max;
        }

        let factor = if self.config.factor < 1.0 { 1.0 } else { self.config.factor };
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = min * factor.powi(exponent);
        if !secs.is_finite() || secs >= max {
            self.config.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}
