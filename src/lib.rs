//! Resilience primitives for calls to unreliable dependencies.

pub mod backpressure;
pub mod config;
pub mod idempotency;
pub mod observability;
pub mod resilience;
pub mod state_machine;

pub use backpressure::BackpressureController;
pub use config::ToolkitConfig;
pub use idempotency::{IdempotencyHandler, IdempotencyKey};
pub use resilience::{CircuitBreaker, FailureClass, ResiliencePipeline, RetryHandler};
pub use state_machine::StateMachine;
