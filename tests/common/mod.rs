//! Shared utilities for integration and load testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use resilience_kit::config::{BackoffStrategy, CircuitBreakerConfig, RetryPolicy};

/// Errors a simulated dependency can return.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[allow(dead_code)]
pub enum DependencyError {
    #[error("connection refused")]
    Unavailable,
    #[error("request timed out")]
    Timeout,
    #[error("too many requests")]
    Throttled,
    #[error("payload failed schema validation")]
    Invalid,
}

/// A dependency that replays a scripted sequence of outcomes, then keeps
/// returning the fallback outcome.
#[derive(Clone)]
pub struct ScriptedDependency {
    script: Arc<Mutex<VecDeque<Result<u32, DependencyError>>>>,
    fallback: Result<u32, DependencyError>,
    calls: Arc<AtomicU32>,
    latency: Duration,
}

#[allow(dead_code)]
impl ScriptedDependency {
    pub fn new(script: Vec<Result<u32, DependencyError>>, fallback: Result<u32, DependencyError>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            fallback,
            calls: Arc::new(AtomicU32::new(0)),
            latency: Duration::ZERO,
        }
    }

    pub fn always(outcome: Result<u32, DependencyError>) -> Self {
        Self::new(Vec::new(), outcome)
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn call(&self) -> Result<u32, DependencyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Deterministic retry policy: constant 100ms delay, no jitter.
#[allow(dead_code)]
pub fn fast_retry_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay_ms: 100,
        backoff_strategy: BackoffStrategy::Constant,
        jitter: false,
        ..RetryPolicy::default()
    }
}

#[allow(dead_code)]
pub fn breaker_config(failure_threshold: u32, success_threshold: u32, timeout: Duration) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        success_threshold,
        timeout_ms: timeout.as_millis() as u64,
        ..CircuitBreakerConfig::default()
    }
}
