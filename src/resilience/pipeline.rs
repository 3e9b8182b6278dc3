//! Composition of the call-path primitives.
//!
//! # Data Flow
//! ```text
//! execute(key, is_critical, op)
//!     → BackpressureController::try_admit      (reject before anything runs)
//!     → IdempotencyHandler::execute(key)       (cached result short-circuits)
//!     → CircuitBreaker::execute                (open → CircuitOpen)
//!     → RetryHandler::execute_with_retry(op)   (classified retries)
//! ```
//!
//! The breaker sees one outcome per call, after retries are done, so a
//! single flaky request cannot open the circuit on its own.

use std::error::Error;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;

use crate::backpressure::{BackpressureController, BackpressureStats, Rejection};
use crate::config::ToolkitConfig;
use crate::idempotency::{IdempotencyHandler, IdempotencyKey};
use crate::observability::metrics;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitOpenError, CircuitStats};
use crate::resilience::retries::{CallOptions, PoisonMessage, RetryError, RetryHandler};

/// Errors returned by `ResiliencePipeline::execute`.
#[derive(Debug, Error)]
pub enum PipelineError<E> {
    #[error("rejected: {0}")]
    Rejected(Rejection),

    #[error(transparent)]
    CircuitOpen(CircuitOpenError),

    #[error(transparent)]
    Failed(RetryError<E>),
}

impl<E> PipelineError<E> {
    /// True when the operation never ran.
    pub fn is_rejection(&self) -> bool {
        matches!(self, PipelineError::Rejected(_) | PipelineError::CircuitOpen(_))
    }
}

/// One protected dependency: admission, deduplication, breaker and retries.
#[derive(Debug)]
pub struct ResiliencePipeline<T> {
    name: String,
    backpressure: BackpressureController,
    idempotency: IdempotencyHandler<T>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryHandler,
}

impl<T> ResiliencePipeline<T>
where
    T: Send + Sync,
{
    pub fn new(
        name: impl Into<String>,
        backpressure: BackpressureController,
        idempotency: IdempotencyHandler<T>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryHandler,
    ) -> Self {
        Self {
            name: name.into(),
            backpressure,
            idempotency,
            breaker,
            retry,
        }
    }

    /// Build every stage from a loaded config.
    pub fn from_config(name: impl Into<String>, config: &ToolkitConfig) -> Self {
        let name = name.into();
        Self {
            backpressure: BackpressureController::new(config.backpressure.clone(), config.load_shedding.clone()),
            idempotency: IdempotencyHandler::from_config(&config.idempotency),
            breaker: Arc::new(CircuitBreaker::new(name.clone(), config.circuit_breaker.clone())),
            retry: RetryHandler::new(config.retry.clone()),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backpressure(&self) -> &BackpressureController {
        &self.backpressure
    }

    pub fn idempotency(&self) -> &IdempotencyHandler<T> {
        &self.idempotency
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn retry(&self) -> &RetryHandler {
        &self.retry
    }

    /// Run `operation` through every stage. The key's message id is used
    /// for poison quarantine unless `options` names one.
    pub async fn execute<F, Fut, E>(
        &self,
        key: &IdempotencyKey,
        is_critical: bool,
        mut options: CallOptions,
        operation: F,
    ) -> Result<Arc<T>, PipelineError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        let guard = self.backpressure.try_admit(is_critical).map_err(PipelineError::Rejected)?;
        let start = std::time::Instant::now();

        if options.message_id.is_none() {
            options.message_id = Some(key.message_id.clone());
        }

        let result = self
            .idempotency
            .execute(key, || async move {
                self.breaker
                    .execute(|| self.retry.execute_with_retry(operation, options))
                    .await
                    .map_err(|error| match error {
                        CircuitBreakerError::Open(open) => PipelineError::CircuitOpen(open),
                        CircuitBreakerError::Operation(failed) | CircuitBreakerError::Fallback(failed) => {
                            PipelineError::Failed(failed)
                        }
                    })
            })
            .await;

        guard.complete();
        metrics::record_operation_duration(start);
        if let Err(error) = &result {
            tracing::debug!(pipeline = %self.name, key = %key, %error, "Pipeline call failed");
        }
        result
    }

    pub fn poison_messages(&self) -> Vec<PoisonMessage> {
        self.retry.get_poison_messages()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            name: self.name.clone(),
            backpressure: self.backpressure.get_stats(),
            circuit: self.breaker.get_stats(),
            idempotency_records: self.idempotency.len(),
            poison_messages: self.retry.get_poison_messages().len(),
        }
    }
}

/// Combined stats of every stage.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineStats {
    pub name: String,
    pub backpressure: BackpressureStats,
    pub circuit: CircuitStats,
    pub idempotency_records: usize,
    pub poison_messages: usize,
}
