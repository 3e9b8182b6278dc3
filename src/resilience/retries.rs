//! Retry logic.
//!
//! # Responsibilities
//! - Execute an operation, classifying every failure
//! - Retry with backoff up to the per-class attempt ceiling
//! - Quarantine calls that exhaust their budget as poison messages
//!
//! # Design Decisions
//! - Permanent failures are never retried
//! - Attempts within one call are strictly sequential
//! - The backoff sleep suspends only the calling task and respects the
//!   caller's deadline
//! - The original error is always returned to the caller, never stringified

use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{ErrorReport, RetryPolicy};
use crate::observability::metrics;
use crate::resilience::backoff::calculate_backoff;
use crate::resilience::classify::{render_chain, DefaultClassifier, FailureClass, FailureClassifier};
use crate::resilience::timeouts::{with_deadline, would_exceed};

/// A call that exhausted its retry budget.
#[derive(Debug, Clone, Serialize)]
pub struct PoisonMessage {
    pub message_id: String,
    pub failure_class: FailureClass,
    pub attempts: u32,
    pub last_error: String,
    pub quarantined_at: SystemTime,
    pub original_payload: Option<serde_json::Value>,
}

/// Errors returned by `RetryHandler`.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The failure was classified as permanent; no retry was made.
    #[error("permanent failure on attempt {attempts}: {source}")]
    Permanent { attempts: u32, source: E },

    /// The attempt ceiling for the failure class was reached.
    #[error("gave up after {attempts} attempt(s) ({class}): {source}")]
    Exhausted {
        class: FailureClass,
        attempts: u32,
        source: E,
        /// Messages of earlier attempts, oldest first. Empty unless the
        /// policy asks for the full error report.
        prior: Vec<String>,
    },

    /// The caller's deadline passed before the call could succeed.
    #[error("deadline exceeded after {attempts} attempt(s)")]
    DeadlineExceeded { attempts: u32, last: Option<E> },
}

impl<E> RetryError<E> {
    /// Number of attempts made.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::DeadlineExceeded { attempts, .. } => *attempts,
        }
    }

    /// The last error returned by the operation, if it ran at all.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Permanent { source, .. } | RetryError::Exhausted { source, .. } => {
                Some(source)
            }
            RetryError::DeadlineExceeded { last, .. } => last,
        }
    }

    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Permanent { source, .. } | RetryError::Exhausted { source, .. } => {
                Some(source)
            }
            RetryError::DeadlineExceeded { last, .. } => last.as_ref(),
        }
    }
}

/// Per-call options.
#[derive(Clone, Default)]
pub struct CallOptions {
    /// Identity used to quarantine the call if it exhausts its retries.
    pub message_id: Option<String>,
    /// Copied into the poison message.
    pub payload: Option<serde_json::Value>,
    /// Overrides the handler's classifier for this call.
    pub classifier: Option<Arc<dyn FailureClassifier>>,
    /// Absolute deadline for the whole call, including backoff sleeps.
    pub deadline: Option<Instant>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn classifier(mut self, classifier: impl FailureClassifier + 'static) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl std::fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("message_id", &self.message_id)
            .field("payload", &self.payload)
            .field("classifier", &self.classifier.is_some())
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Executes operations with classified retries.
pub struct RetryHandler {
    policy: RetryPolicy,
    classifier: Arc<dyn FailureClassifier>,
    poison: Mutex<Vec<PoisonMessage>>,
}

impl RetryHandler {
    /// Create a handler using the default classifier.
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_classifier(policy, DefaultClassifier)
    }

    pub fn with_classifier(policy: RetryPolicy, classifier: impl FailureClassifier + 'static) -> Self {
        Self {
            policy,
            classifier: Arc::new(classifier),
            poison: Mutex::new(Vec::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute with default options (no message identity, no deadline).
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        self.execute_with_retry(operation, CallOptions::default()).await
    }

    /// Execute `operation`, retrying classified failures.
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        mut operation: F,
        options: CallOptions,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        let classifier = options.classifier.as_ref().unwrap_or(&self.classifier);
        let message_id = options.message_id.as_deref().unwrap_or("-");
        let mut attempts: u32 = 0;
        let mut prior: Vec<String> = Vec::new();

        loop {
            attempts += 1;
            let outcome = match with_deadline(options.deadline, operation()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(message_id, attempts, "Deadline exceeded during attempt");
                    return Err(RetryError::DeadlineExceeded { attempts, last: None });
                }
            };

            let error = match outcome {
                Ok(value) => {
                    if attempts > 1 {
                        tracing::debug!(message_id, attempts, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let class = classifier.classify(&error);
            metrics::record_retry_attempt(class.as_str());

            if class == FailureClass::Permanent {
                tracing::error!(message_id, attempts, error = %error, "Permanent failure, not retrying");
                return Err(RetryError::Permanent { attempts, source: error });
            }

            let max_attempts = self.policy.max_attempts_for(class);
            if attempts >= max_attempts {
                return Err(self.exhausted(class, attempts, error, prior, &options));
            }

            let delay = calculate_backoff(&self.policy, attempts - 1);
            if would_exceed(options.deadline, delay) {
                tracing::warn!(message_id, attempts, delay = ?delay, "Backoff would cross deadline, giving up");
                return Err(RetryError::DeadlineExceeded { attempts, last: Some(error) });
            }

            tracing::warn!(
                message_id,
                attempt = attempts,
                max_attempts,
                class = %class,
                delay = ?delay,
                error = %error,
                "Attempt failed, retrying"
            );
            if self.policy.error_report == ErrorReport::All {
                prior.push(render_chain(&error));
            }
            tokio::time::sleep(delay).await;
        }
    }

    fn exhausted<E>(
        &self,
        class: FailureClass,
        attempts: u32,
        error: E,
        prior: Vec<String>,
        options: &CallOptions,
    ) -> RetryError<E>
    where
        E: Error + 'static,
    {
        metrics::record_retry_exhausted(class.as_str());
        let last_error = render_chain(&error);

        match &options.message_id {
            Some(message_id) => {
                tracing::error!(
                    message_id = %message_id,
                    attempts,
                    class = %class,
                    error = %last_error,
                    "Retries exhausted, quarantining poison message"
                );
                self.poison.lock().push(PoisonMessage {
                    message_id: message_id.clone(),
                    failure_class: class,
                    attempts,
                    last_error,
                    quarantined_at: SystemTime::now(),
                    original_payload: options.payload.clone(),
                });
                metrics::record_poison_message();
            }
            None => {
                tracing::error!(attempts, class = %class, error = %last_error, "Retries exhausted");
            }
        }

        RetryError::Exhausted {
            class,
            attempts,
            source: error,
            prior,
        }
    }

    /// Snapshot of quarantined messages, oldest first.
    pub fn get_poison_messages(&self) -> Vec<PoisonMessage> {
        self.poison.lock().clone()
    }

    /// Remove and return all quarantined messages.
    pub fn drain_poison_messages(&self) -> Vec<PoisonMessage> {
        std::mem::take(&mut *self.poison.lock())
    }
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl std::fmt::Debug for RetryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryHandler")
            .field("policy", &self.policy)
            .field("poison_messages", &self.poison.lock().len())
            .finish()
    }
}
