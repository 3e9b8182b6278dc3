//! Admission control.
//!
//! # Responsibilities
//! - Track in-flight operations against the queue capacity
//! - Shed non-critical work first as utilization climbs
//! - Enforce the sliding-window request rate
//!
//! # Admission Order
//! ```text
//! shed check → rate limit → capacity (non-critical only) → in-flight slot
//! ```
//!
//! # Design Decisions
//! - Every rejection happens before the operation runs
//! - The in-flight slot is an RAII guard, released on completion, error,
//!   panic or cancellation alike
//! - Capacity is reserved with a CAS loop so the counter never overshoots
//!   under concurrent admission

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::backpressure::rate_limit::SlidingWindowLimiter;
use crate::config::{BackpressureConfig, LoadSheddingPolicy};
use crate::observability::metrics;

/// Why a call was refused admission.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("load shed at {:.0}% utilization", .utilization * 100.0)]
    LoadShed { utilization: f64 },

    #[error("rate limit exceeded: {limit} requests per {window:?}")]
    RateLimited { limit: usize, window: Duration },

    #[error("queue at capacity ({:.0}% utilization)", .utilization * 100.0)]
    Backpressure { utilization: f64 },
}

impl Rejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::LoadShed { .. } => "load_shed",
            Rejection::RateLimited { .. } => "rate_limited",
            Rejection::Backpressure { .. } => "backpressure",
        }
    }
}

/// Errors returned by `execute_with_backpressure`.
#[derive(Debug, Error)]
pub enum BackpressureError<E> {
    #[error(transparent)]
    Rejected(Rejection),

    #[error("{0}")]
    Operation(E),
}

impl<E> BackpressureError<E> {
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            BackpressureError::Rejected(rejection) => Some(rejection),
            BackpressureError::Operation(_) => None,
        }
    }
}

/// Controller counters.
#[derive(Debug, Clone, Serialize)]
pub struct BackpressureStats {
    pub queue_length: usize,
    pub utilization: f64,
    pub total_processed: u64,
    pub total_shed: u64,
    pub total_rate_limited: u64,
    pub total_rejected: u64,
}

#[derive(Debug)]
struct Shared {
    config: BackpressureConfig,
    shedding: LoadSheddingPolicy,
    in_flight: AtomicUsize,
    limiter: SlidingWindowLimiter,
    total_processed: AtomicU64,
    total_shed: AtomicU64,
    total_rate_limited: AtomicU64,
    total_rejected: AtomicU64,
}

impl Shared {
    fn utilization_of(&self, length: usize) -> f64 {
        if self.config.max_queue_length == 0 {
            return 1.0;
        }
        length as f64 / self.config.max_queue_length as f64
    }

    fn release(&self) {
        let previous = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        metrics::record_queue_length(previous.saturating_sub(1));
    }
}

/// Holds one in-flight slot until dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    shared: Arc<Shared>,
    completed: bool,
}

impl InFlightGuard {
    /// Mark the guarded operation as processed. Dropping without completing
    /// still releases the slot but is not counted.
    pub fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.completed {
            self.shared.total_processed.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.release();
    }
}

/// Queue-utilization tracking, rate limiting and priority-aware shedding.
///
/// Cheap to clone; clones share counters.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    shared: Arc<Shared>,
}

impl BackpressureController {
    pub fn new(config: BackpressureConfig, shedding: LoadSheddingPolicy) -> Self {
        let limiter = SlidingWindowLimiter::new(config.max_requests_per_window, config.window());
        Self {
            shared: Arc::new(Shared {
                config,
                shedding,
                in_flight: AtomicUsize::new(0),
                limiter,
                total_processed: AtomicU64::new(0),
                total_shed: AtomicU64::new(0),
                total_rate_limited: AtomicU64::new(0),
                total_rejected: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.shared.config
    }

    pub fn queue_length(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn utilization(&self) -> f64 {
        self.shared.utilization_of(self.queue_length())
    }

    /// `(has_capacity, utilization)`. Warns above the warning threshold and
    /// reports no capacity at the critical threshold.
    pub fn check_capacity(&self) -> (bool, f64) {
        let utilization = self.utilization();
        let config = &self.shared.config;

        if utilization >= config.critical_threshold {
            tracing::warn!(utilization, threshold = config.critical_threshold, "Queue at critical utilization");
            return (false, utilization);
        }
        if utilization >= config.warning_threshold {
            tracing::warn!(utilization, threshold = config.warning_threshold, "Queue utilization high");
        }
        (true, utilization)
    }

    /// Whether a call of the given priority should be shed right now.
    pub fn should_shed_load(&self, is_critical: bool) -> bool {
        let policy = &self.shared.shedding;
        if !policy.enabled {
            return false;
        }
        let utilization = self.utilization();
        if is_critical {
            utilization >= 1.0
        } else {
            policy.shed_non_critical && utilization >= policy.shed_threshold
        }
    }

    /// Count a request against the window. Returns false when over the limit.
    pub fn check_rate_limit(&self) -> bool {
        self.shared.limiter.try_acquire()
    }

    /// Run the admission checks and reserve an in-flight slot.
    pub fn try_admit(&self, is_critical: bool) -> Result<InFlightGuard, Rejection> {
        let result = self.admit(is_critical);
        if let Err(rejection) = &result {
            let counter = match rejection {
                Rejection::LoadShed { .. } => {
                    tracing::warn!(is_critical, %rejection, "Shedding load");
                    &self.shared.total_shed
                }
                Rejection::RateLimited { .. } => {
                    tracing::warn!(is_critical, %rejection, "Rate limit exceeded");
                    &self.shared.total_rate_limited
                }
                Rejection::Backpressure { .. } => {
                    tracing::debug!(is_critical, %rejection, "Rejected for capacity");
                    &self.shared.total_rejected
                }
            };
            counter.fetch_add(1, Ordering::Relaxed);
            metrics::record_admission_rejection(rejection.reason());
        }
        result
    }

    /// Execute `operation` if admitted. The slot is released however the
    /// operation ends.
    pub async fn execute_with_backpressure<F, Fut, T, E>(
        &self,
        operation: F,
        is_critical: bool,
    ) -> Result<T, BackpressureError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let guard = self.try_admit(is_critical).map_err(BackpressureError::Rejected)?;
        let result = operation().await;
        guard.complete();
        result.map_err(BackpressureError::Operation)
    }

    pub fn get_stats(&self) -> BackpressureStats {
        let queue_length = self.queue_length();
        BackpressureStats {
            queue_length,
            utilization: self.shared.utilization_of(queue_length),
            total_processed: self.shared.total_processed.load(Ordering::Relaxed),
            total_shed: self.shared.total_shed.load(Ordering::Relaxed),
            total_rate_limited: self.shared.total_rate_limited.load(Ordering::Relaxed),
            total_rejected: self.shared.total_rejected.load(Ordering::Relaxed),
        }
    }

    fn admit(&self, is_critical: bool) -> Result<InFlightGuard, Rejection> {
        if self.should_shed_load(is_critical) {
            return Err(Rejection::LoadShed {
                utilization: self.utilization(),
            });
        }

        if !self.check_rate_limit() {
            return Err(Rejection::RateLimited {
                limit: self.shared.config.max_requests_per_window,
                window: self.shared.config.window(),
            });
        }

        if !is_critical {
            let (has_capacity, utilization) = self.check_capacity();
            if !has_capacity {
                return Err(Rejection::Backpressure { utilization });
            }
        }

        self.reserve(is_critical)
    }

    /// Reserve a slot. Non-critical calls stay below the critical threshold,
    /// critical calls may fill the queue.
    fn reserve(&self, is_critical: bool) -> Result<InFlightGuard, Rejection> {
        let shared = &self.shared;
        let mut prev = shared.in_flight.load(Ordering::Acquire);
        loop {
            let full = if is_critical {
                prev >= shared.config.max_queue_length
            } else {
                shared.utilization_of(prev) >= shared.config.critical_threshold
            };
            if full {
                return Err(Rejection::Backpressure {
                    utilization: shared.utilization_of(prev),
                });
            }
            match shared
                .in_flight
                .compare_exchange_weak(prev, prev + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
        metrics::record_queue_length(prev + 1);
        Ok(InFlightGuard {
            shared: shared.clone(),
            completed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max_queue_length: usize, shedding: bool) -> BackpressureController {
        BackpressureController::new(
            BackpressureConfig {
                max_queue_length,
                warning_threshold: 0.7,
                critical_threshold: 0.95,
                max_requests_per_window: 1000,
                window_ms: 1000,
            },
            LoadSheddingPolicy {
                enabled: shedding,
                shed_non_critical: true,
                shed_threshold: 0.8,
            },
        )
    }

    #[test]
    fn test_guard_releases_slot() {
        let controller = controller(4, false);
        let a = controller.try_admit(false).unwrap();
        let b = controller.try_admit(false).unwrap();
        assert_eq!(controller.queue_length(), 2);
        assert_eq!(controller.utilization(), 0.5);

        a.complete();
        drop(b);
        let stats = controller.get_stats();
        assert_eq!(stats.queue_length, 0);
        assert_eq!(stats.total_processed, 1);
    }

    #[test]
    fn test_non_critical_shed_before_capacity() {
        let controller = controller(10, true);
        let guards: Vec<_> = (0..8).map(|_| controller.try_admit(false).unwrap()).collect();

        assert!(controller.should_shed_load(false));
        assert!(!controller.should_shed_load(true));
        assert_eq!(
            controller.try_admit(false).unwrap_err(),
            Rejection::LoadShed { utilization: 0.8 }
        );

        // critical work still gets in until the queue is full
        let critical: Vec<_> = (0..2).map(|_| controller.try_admit(true).unwrap()).collect();
        assert!(controller.should_shed_load(true));
        assert!(matches!(controller.try_admit(true), Err(Rejection::LoadShed { .. })));

        assert_eq!(controller.get_stats().total_shed, 2);
        drop(guards);
        drop(critical);
        assert_eq!(controller.queue_length(), 0);
    }

    #[test]
    fn test_critical_capped_at_queue_length_without_shedding() {
        let controller = controller(2, false);
        let _a = controller.try_admit(true).unwrap();
        let _b = controller.try_admit(true).unwrap();
        assert_eq!(
            controller.try_admit(true).unwrap_err(),
            Rejection::Backpressure { utilization: 1.0 }
        );
        assert_eq!(controller.get_stats().total_rejected, 1);
    }

    #[test]
    fn test_shedding_disabled_never_sheds() {
        let controller = controller(1, false);
        let _guard = controller.try_admit(true).unwrap();
        assert!(!controller.should_shed_load(false));
        assert!(!controller.should_shed_load(true));
    }

    #[test]
    fn test_zero_capacity_is_always_full() {
        let controller = controller(0, false);
        assert_eq!(controller.check_capacity(), (false, 1.0));
        assert!(controller.try_admit(true).is_err());
    }

    #[tokio::test]
    async fn test_operation_error_releases_slot() {
        let controller = controller(4, false);
        let result: Result<(), _> = controller
            .execute_with_backpressure(|| async { Err::<(), _>("boom") }, false)
            .await;
        assert!(matches!(result, Err(BackpressureError::Operation("boom"))));
        assert_eq!(controller.queue_length(), 0);
        assert_eq!(controller.get_stats().total_processed, 1);
    }
}
