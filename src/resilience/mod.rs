//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to a dependency:
//!     → circuit_breaker.rs (fail fast while the dependency is down)
//!     → retries.rs (classify failure via classify.rs, back off via backoff.rs)
//!     → timeouts.rs (caller deadline bounds attempts and sleeps)
//!     → On exhaustion: poison message quarantined
//! ```
//!
//! # Design Decisions
//! - Failure classes, not error types, decide whether to retry
//! - Every wait is bounded by the caller's deadline
//! - Circuit breaker prevents cascading failures
//! - pipeline.rs composes the stages with backpressure and idempotency

pub mod backoff;
pub mod circuit_breaker;
pub mod classify;
pub mod pipeline;
pub mod registry;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitOpenError, CircuitState, CircuitStats};
pub use classify::{DefaultClassifier, FailureClass, FailureClassifier};
pub use pipeline::{PipelineError, PipelineStats, ResiliencePipeline};
pub use registry::CircuitBreakerRegistry;
pub use retries::{CallOptions, PoisonMessage, RetryError, RetryHandler};
pub use timeouts::DeadlineExceeded;
