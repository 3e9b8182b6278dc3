//! Deadline enforcement.
//!
//! # Responsibilities
//! - Bound any wait (operation, backoff sleep, open-breaker wait) by a caller deadline
//! - Report deadline expiry as a distinct error
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities; dropping the future cancels the wait
//! - Deadlines are absolute `Instant`s so nested waits share one budget

use std::future::Future;

use thiserror::Error;
use tokio::time::Instant;

/// The caller's deadline passed before the wait completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;

/// Run `fut` to completion, or until `deadline` if one is given.
pub async fn with_deadline<F>(deadline: Option<Instant>, fut: F) -> Result<F::Output, DeadlineExceeded>
where
    F: Future,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| DeadlineExceeded),
        None => Ok(fut.await),
    }
}

/// True when sleeping for `wait` from now would cross `deadline`.
pub fn would_exceed(deadline: Option<Instant>, wait: std::time::Duration) -> bool {
    deadline.is_some_and(|deadline| Instant::now() + wait > deadline)
}
