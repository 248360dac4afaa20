//! Orchestrator configuration.
//!
//! Supplied once at startup and immutable for the lifetime of an
//! [`Orchestrator`](crate::Orchestrator).

use std::time::Duration;

use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_instances must be at least 1")]
    NoCapacity,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("heartbeat_timeout ({timeout:?}) must exceed heartbeat_interval ({interval:?})")]
    TimeoutNotAboveInterval { interval: Duration, timeout: Duration },

    #[error("reconnect.max_attempts must be at least 1")]
    NoReconnectAttempts,
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hard ceiling on Starting + Active worker instances.
    pub max_instances: usize,

    /// Expected heartbeat cadence from workers (also the liveness check period).
    pub heartbeat_interval: Duration,

    /// Silence after which an Active worker is marked Failed.
    pub heartbeat_timeout: Duration,

    /// Period of the supervision cycle.
    pub cycle_interval: Duration,

    /// How long a Draining worker may keep in-flight work before it is
    /// force-terminated.
    pub grace_period: Duration,

    /// Age after which an incomplete aggregation raises a Timeout fault.
    pub stale_task_threshold: Duration,

    /// How long completed aggregations are retained.
    pub aggregation_ttl: Duration,

    /// Upper bound on a single readiness probe.
    pub probe_timeout: Duration,

    /// Retained completed aggregations above which resources count as exhausted.
    pub max_retained_aggregations: usize,

    /// Queued tasks above which resources count as exhausted.
    pub max_queued_tasks: usize,

    /// Backoff used when recreating a worker connection.
    pub reconnect: BackoffPolicy,

    /// HTTP server bind address for the read-only ops surface.
    pub http_bind_addr: String,
}

impl Config {
    /// Check the invariants the components rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_instances == 0 {
            return Err(ConfigError::NoCapacity);
        }
        let durations = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("cycle_interval", self.cycle_interval),
            ("grace_period", self.grace_period),
            ("stale_task_threshold", self.stale_task_threshold),
            ("aggregation_ttl", self.aggregation_ttl),
            ("probe_timeout", self.probe_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::TimeoutNotAboveInterval {
                interval: self.heartbeat_interval,
                timeout: self.heartbeat_timeout,
            });
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::NoReconnectAttempts);
        }
        Ok(())
    }

    /// `heartbeat_timeout` as a chrono duration for timestamp arithmetic.
    pub fn heartbeat_timeout_delta(&self) -> chrono::Duration {
        to_delta(self.heartbeat_timeout)
    }

    /// `stale_task_threshold` as a chrono duration.
    pub fn stale_task_delta(&self) -> chrono::Duration {
        to_delta(self.stale_task_threshold)
    }

    /// `aggregation_ttl` as a chrono duration.
    pub fn aggregation_ttl_delta(&self) -> chrono::Duration {
        to_delta(self.aggregation_ttl)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_instances: 8,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            cycle_interval: Duration::from_secs(2),
            grace_period: Duration::from_secs(30),
            stale_task_threshold: Duration::from_secs(300),
            aggregation_ttl: Duration::from_secs(600),
            probe_timeout: Duration::from_secs(5),
            max_retained_aggregations: 10_000,
            max_queued_tasks: 1_000,
            reconnect: BackoffPolicy::default(),
            http_bind_addr: "[::1]:50060".to_string(),
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Total attempts before giving up.
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based),
    /// doubling from `initial_delay` and capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

/// Convert a std duration, saturating instead of failing on overflow.
pub(crate) fn to_delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let config = Config {
            max_instances: 0,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoCapacity));
    }

    #[test]
    fn test_rejects_timeout_below_interval() {
        let config = Config {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(10),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TimeoutNotAboveInterval { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_grace() {
        let config = Config {
            grace_period: Duration::ZERO,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroDuration("grace_period")));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            max_attempts: 6,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }
}
