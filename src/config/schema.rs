//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the toolkit.
//! All types derive Serde traits for deserialization from config files.
//! Every value struct is fully specified at construction and never mutated
//! afterward by the component that owns it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resilience::classify::FailureClass;

/// Root configuration for a resilience pipeline.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ToolkitConfig {
    /// Retry policy for the protected operation.
    pub retry: RetryPolicy,

    /// Circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Queue capacity and rate limiting.
    pub backpressure: BackpressureConfig,

    /// Priority-aware load shedding.
    pub load_shedding: LoadSheddingPolicy,

    /// Idempotency cache settings.
    pub idempotency: IdempotencyConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Constant,
    Linear,
    #[default]
    Exponential,
}

/// How much of the failure history an exhausted retry reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReport {
    /// Only the last attempt's error.
    #[default]
    Last,
    /// The last error plus the rendered message of every earlier attempt.
    All,
}

/// Attempt ceilings per failure class. Permanent failures are never retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClassLimits {
    pub transient: Option<u32>,
    pub rate_limit: Option<u32>,
    pub validation: Option<u32>,
    pub unknown: Option<u32>,
}

impl ClassLimits {
    pub fn get(&self, class: FailureClass) -> Option<u32> {
        match class {
            FailureClass::Transient => self.transient,
            FailureClass::RateLimit => self.rate_limit,
            FailureClass::Validation => self.validation,
            FailureClass::Unknown => self.unknown,
            FailureClass::Permanent => None,
        }
    }
}

/// Retry policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempt ceiling for classes without an override (includes the first call).
    pub max_attempts: u32,

    /// Base delay in milliseconds.
    pub base_delay_ms: u64,

    /// Upper bound on the computed delay in milliseconds (before jitter).
    pub max_delay_ms: u64,

    /// Delay growth strategy.
    pub backoff_strategy: BackoffStrategy,

    /// Growth factor for the exponential strategy.
    pub multiplier: f64,

    /// Add `uniform(0, 0.25 * delay)` to every delay.
    pub jitter: bool,

    /// Per-class attempt ceilings, overriding the built-in defaults.
    pub class_max_attempts: ClassLimits,

    /// Error history carried by an exhausted retry.
    pub error_report: ErrorReport,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff_strategy: BackoffStrategy::Exponential,
            multiplier: 2.0,
            jitter: true,
            class_max_attempts: ClassLimits::default(),
            error_report: ErrorReport::Last,
        }
    }
}

impl RetryPolicy {
    /// Attempt ceiling for a failure class.
    ///
    /// Validation failures fail fast and rate-limit failures get at least
    /// five attempts unless the configuration says otherwise.
    pub fn max_attempts_for(&self, class: FailureClass) -> u32 {
        if let Some(limit) = self.class_max_attempts.get(class) {
            return limit;
        }
        match class {
            FailureClass::Permanent | FailureClass::Validation => 1,
            FailureClass::RateLimit => self.max_attempts.max(5),
            FailureClass::Transient | FailureClass::Unknown => self.max_attempts,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures inside `failure_window` that open the breaker.
    pub failure_threshold: u32,

    /// Half-open successes that close the breaker.
    pub success_threshold: u32,

    /// Time the breaker stays open before allowing trial calls (ms).
    pub timeout_ms: u64,

    /// Sliding window over which failures are counted (ms).
    pub failure_window_ms: u64,

    /// Concurrent trial calls allowed while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 60_000,
            failure_window_ms: 60_000,
            half_open_max_calls: 2,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }
}

/// Queue capacity and request-rate limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// In-flight operations that correspond to 100% utilization.
    pub max_queue_length: usize,

    /// Utilization at which a warning is logged.
    pub warning_threshold: f64,

    /// Utilization at which non-critical work is refused.
    pub critical_threshold: f64,

    /// Requests admitted per sliding window.
    pub max_requests_per_window: usize,

    /// Sliding window length (ms).
    pub window_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_queue_length: 1000,
            warning_threshold: 0.7,
            critical_threshold: 0.9,
            max_requests_per_window: 100,
            window_ms: 1000,
        }
    }
}

impl BackpressureConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Priority-aware load shedding.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadSheddingPolicy {
    /// Enable shedding.
    pub enabled: bool,

    /// Shed non-critical requests once `shed_threshold` is reached.
    pub shed_non_critical: bool,

    /// Utilization at which non-critical work is shed.
    pub shed_threshold: f64,
}

impl Default for LoadSheddingPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            shed_non_critical: true,
            shed_threshold: 0.8,
        }
    }
}

/// Idempotency cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Record lifetime in milliseconds. `None` keeps records until cleared.
    pub ttl_ms: Option<u64>,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_ms: Some(3_600_000),
        }
    }
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ToolkitConfig = toml::from_str(
            r#"
            [retry]
            max_attempts = 4
            backoff_strategy = "linear"

            [retry.class_max_attempts]
            transient = 6

            [circuit_breaker]
            failure_threshold = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.retry.max_attempts_for(FailureClass::Transient), 6);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.success_threshold, 2);
        assert_eq!(config.backpressure.max_queue_length, 1000);
    }

    #[test]
    fn test_class_ceilings() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts_for(FailureClass::Transient), 3);
        assert_eq!(policy.max_attempts_for(FailureClass::Unknown), 3);
        assert_eq!(policy.max_attempts_for(FailureClass::Validation), 1);
        assert_eq!(policy.max_attempts_for(FailureClass::Permanent), 1);
        assert_eq!(policy.max_attempts_for(FailureClass::RateLimit), 5);
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let rendered = toml::to_string(&ToolkitConfig::default()).unwrap();
        let parsed: ToolkitConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.idempotency.ttl(), Some(Duration::from_secs(3600)));
        assert_eq!(parsed.observability.log_format, LogFormat::Pretty);
    }
}
