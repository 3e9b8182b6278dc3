//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds > 0, ratios within (0, 1])
//! - Detect conflicting settings (warning above critical, max delay below base)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ToolkitConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{BackoffStrategy, ToolkitConfig};

/// A single semantic problem with a config value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &ToolkitConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let retry = &config.retry;
    if retry.max_attempts == 0 {
        errors.push(ValidationError::new("retry.max_attempts", "must be at least 1"));
    }
    if retry.max_delay_ms < retry.base_delay_ms {
        errors.push(ValidationError::new(
            "retry.max_delay_ms",
            format!("{} is below base_delay_ms {}", retry.max_delay_ms, retry.base_delay_ms),
        ));
    }
    if retry.backoff_strategy == BackoffStrategy::Exponential && !(retry.multiplier >= 1.0) {
        errors.push(ValidationError::new(
            "retry.multiplier",
            format!("{} must be >= 1.0 for exponential backoff", retry.multiplier),
        ));
    }
    let limits = &retry.class_max_attempts;
    for (field, limit) in [
        ("retry.class_max_attempts.transient", limits.transient),
        ("retry.class_max_attempts.rate_limit", limits.rate_limit),
        ("retry.class_max_attempts.validation", limits.validation),
        ("retry.class_max_attempts.unknown", limits.unknown),
    ] {
        if limit == Some(0) {
            errors.push(ValidationError::new(field, "must be at least 1"));
        }
    }

    let breaker = &config.circuit_breaker;
    if breaker.failure_threshold == 0 {
        errors.push(ValidationError::new("circuit_breaker.failure_threshold", "must be at least 1"));
    }
    if breaker.success_threshold == 0 {
        errors.push(ValidationError::new("circuit_breaker.success_threshold", "must be at least 1"));
    }
    if breaker.failure_window_ms == 0 {
        errors.push(ValidationError::new("circuit_breaker.failure_window_ms", "must be greater than 0"));
    }
    if breaker.half_open_max_calls == 0 {
        errors.push(ValidationError::new("circuit_breaker.half_open_max_calls", "must be at least 1"));
    }

    let backpressure = &config.backpressure;
    if backpressure.max_queue_length == 0 {
        errors.push(ValidationError::new("backpressure.max_queue_length", "must be at least 1"));
    }
    for (field, value) in [
        ("backpressure.warning_threshold", backpressure.warning_threshold),
        ("backpressure.critical_threshold", backpressure.critical_threshold),
    ] {
        if !(value > 0.0 && value <= 1.0) {
            errors.push(ValidationError::new(field, format!("{value} must be within (0, 1]")));
        }
    }
    if backpressure.warning_threshold > backpressure.critical_threshold {
        errors.push(ValidationError::new(
            "backpressure.warning_threshold",
            format!(
                "{} is above critical_threshold {}",
                backpressure.warning_threshold, backpressure.critical_threshold
            ),
        ));
    }
    if backpressure.max_requests_per_window == 0 {
        errors.push(ValidationError::new("backpressure.max_requests_per_window", "must be at least 1"));
    }
    if backpressure.window_ms == 0 {
        errors.push(ValidationError::new("backpressure.window_ms", "must be greater than 0"));
    }

    let shed_threshold = config.load_shedding.shed_threshold;
    if !(shed_threshold > 0.0 && shed_threshold <= 1.0) {
        errors.push(ValidationError::new(
            "load_shedding.shed_threshold",
            format!("{shed_threshold} must be within (0, 1]"),
        ));
    }

    if config.idempotency.ttl_ms == Some(0) {
        errors.push(ValidationError::new(
            "idempotency.ttl_ms",
            "must be greater than 0 (omit it to keep records forever)",
        ));
    }

    let observability = &config.observability;
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
