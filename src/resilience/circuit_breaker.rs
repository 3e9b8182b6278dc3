//! Circuit breaker for dependency protection.
//!
//! # States
//! - Closed: normal operation, failures counted in a sliding window
//! - Open: dependency assumed down, calls fail fast (or run a fallback)
//! - Half-Open: limited trial calls probe for recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: failures within window >= failure_threshold
//! Open → Half-Open: timeout elapsed since opening (evaluated on access)
//! Half-Open → Closed: success_threshold trial successes
//! Half-Open → Open: any trial failure
//! ```
//!
//! # Design Decisions
//! - One breaker per dependency (see `registry.rs`), never global
//! - No background timers: every access path refreshes the state first
//! - The operation's own error is always returned on the closed/half-open path
//! - Trial slots are released by an RAII permit, so a cancelled call never
//!   leaks a half-open slot
//! - Every permit carries the generation it was admitted under; an outcome
//!   from an earlier generation leaves the state alone

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::observability::metrics;
use crate::resilience::timeouts::{with_deadline, DeadlineExceeded};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A call was short-circuited because the breaker is open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker '{breaker}' is open, retry after {retry_after:?}")]
pub struct CircuitOpenError {
    pub breaker: String,
    /// Time until trial calls are allowed. Zero when half-open but all
    /// trial slots are taken.
    pub retry_after: Duration,
}

/// Errors returned by `CircuitBreaker::execute`.
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    #[error(transparent)]
    Open(CircuitOpenError),

    /// The protected operation failed; the original error is preserved.
    #[error("{0}")]
    Operation(E),

    /// The breaker was open and the fallback failed too.
    #[error("fallback failed: {0}")]
    Fallback(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open(_))
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    /// Failures inside the current window.
    pub failure_count: usize,
    /// Trial successes while half-open.
    pub success_count: u32,
    pub last_failure_time: Option<SystemTime>,
    pub opened_at: Option<SystemTime>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    success_count: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<SystemTime>,
    last_failure_wall: Option<SystemTime>,
    trials_in_flight: u32,
    /// Bumped on every state change so stale permits can be ignored.
    generation: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            success_count: 0,
            opened_at: None,
            opened_at_wall: None,
            last_failure_wall: None,
            trials_in_flight: 0,
            generation: 0,
        }
    }
}

/// A three-state circuit breaker guarding one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Admission ticket for one call. Releases its half-open trial slot on drop.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.trial {
            let mut inner = self.breaker.inner.lock();
            if inner.generation == self.generation {
                inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
            }
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. Performs the open → half-open transition when the
    /// timeout has elapsed, so callers must branch on this value, not a copy.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Execute `operation` under breaker protection.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire().map_err(CircuitBreakerError::Open)?;
        self.run(permit, operation).await
    }

    /// Execute `operation`, or `fallback` when the breaker is open.
    pub async fn execute_with_fallback<F, Fut, G, GFut, T, E>(
        &self,
        operation: F,
        fallback: G,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce(CircuitOpenError) -> GFut,
        GFut: Future<Output = Result<T, E>>,
    {
        match self.acquire() {
            Ok(permit) => self.run(permit, operation).await,
            Err(open) => {
                tracing::debug!(breaker = %self.name, "Circuit open, using fallback");
                fallback(open).await.map_err(CircuitBreakerError::Fallback)
            }
        }
    }

    /// Wait until the breaker stops rejecting calls outright.
    ///
    /// Cancellable by `deadline` and by dropping the future.
    pub async fn ready(&self, deadline: Option<Instant>) -> Result<CircuitState, DeadlineExceeded> {
        loop {
            let wait = {
                let mut inner = self.inner.lock();
                let now = Instant::now();
                self.refresh(&mut inner, now);
                match (inner.state, inner.opened_at) {
                    (CircuitState::Open, Some(opened_at)) => {
                        self.config.timeout().saturating_sub(now.duration_since(opened_at))
                    }
                    (state, _) => return Ok(state),
                }
            };
            with_deadline(deadline, tokio::time::sleep(wait)).await?;
        }
    }

    /// Force the breaker closed and clear all counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let previous = inner.state;
        let generation = inner.generation;
        *inner = BreakerState::new();
        inner.generation = generation + 1;
        tracing::info!(breaker = %self.name, from = %previous, "Circuit breaker manually reset");
        if previous != CircuitState::Closed {
            metrics::record_circuit_transition(&self.name, CircuitState::Closed.as_str());
        }
    }

    pub fn get_stats(&self) -> CircuitStats {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.refresh(&mut inner, now);
        self.prune(&mut inner, now);
        CircuitStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failures.len(),
            success_count: inner.success_count,
            last_failure_time: inner.last_failure_wall,
            opened_at: inner.opened_at_wall,
        }
    }

    async fn run<F, Fut, T, E>(&self, permit: CallPermit<'_>, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match operation().await {
            Ok(value) => {
                self.on_success(&permit);
                drop(permit);
                Ok(value)
            }
            Err(error) => {
                self.on_failure(&permit);
                drop(permit);
                Err(CircuitBreakerError::Operation(error))
            }
        }
    }

    fn acquire(&self) -> Result<CallPermit<'_>, CircuitOpenError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => Ok(CallPermit {
                breaker: self,
                generation: inner.generation,
                trial: false,
            }),
            CircuitState::HalfOpen if inner.trials_in_flight < self.config.half_open_max_calls.max(1) => {
                inner.trials_in_flight += 1;
                Ok(CallPermit {
                    breaker: self,
                    generation: inner.generation,
                    trial: true,
                })
            }
            CircuitState::HalfOpen => {
                metrics::record_circuit_rejection(&self.name);
                Err(CircuitOpenError {
                    breaker: self.name.clone(),
                    retry_after: Duration::ZERO,
                })
            }
            CircuitState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::ZERO, |at| now.duration_since(at));
                metrics::record_circuit_rejection(&self.name);
                tracing::debug!(breaker = %self.name, "Circuit open, rejecting call");
                Err(CircuitOpenError {
                    breaker: self.name.clone(),
                    retry_after: self.config.timeout().saturating_sub(elapsed),
                })
            }
        }
    }

    fn on_success(&self, permit: &CallPermit<'_>) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.refresh(&mut inner, now);

        if inner.generation != permit.generation {
            tracing::debug!(breaker = %self.name, state = %inner.state, "Ignoring success admitted under an earlier state");
            return;
        }
        if inner.state == CircuitState::HalfOpen {
            inner.success_count += 1;
            if inner.success_count >= self.config.success_threshold {
                self.transition(&mut inner, CircuitState::Closed, now);
            }
        }
    }

    fn on_failure(&self, permit: &CallPermit<'_>) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.refresh(&mut inner, now);
        inner.last_failure_wall = Some(SystemTime::now());

        if inner.generation != permit.generation {
            tracing::debug!(breaker = %self.name, state = %inner.state, "Ignoring failure admitted under an earlier state");
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                self.prune(&mut inner, now);
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open, now),
            // No permit is issued while open.
            CircuitState::Open => {}
        }
    }

    /// Time-based open → half-open transition.
    fn refresh(&self, inner: &mut BreakerState, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = inner.opened_at {
            if now.duration_since(opened_at) >= self.config.timeout() {
                self.transition(inner, CircuitState::HalfOpen, now);
            }
        }
    }

    fn prune(&self, inner: &mut BreakerState, now: Instant) {
        let window = self.config.failure_window();
        while let Some(oldest) = inner.failures.front() {
            if now.duration_since(*oldest) > window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(now);
                inner.opened_at_wall = Some(SystemTime::now());
                inner.success_count = 0;
                tracing::warn!(
                    breaker = %self.name,
                    from = %from,
                    failures = inner.failures.len(),
                    timeout = ?self.config.timeout(),
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.success_count = 0;
                inner.trials_in_flight = 0;
                tracing::info!(breaker = %self.name, "Circuit breaker half-open, allowing trial calls");
            }
            CircuitState::Closed => {
                inner.failures.clear();
                inner.success_count = 0;
                inner.opened_at = None;
                inner.opened_at_wall = None;
                tracing::info!(breaker = %self.name, from = %from, "Circuit breaker closed");
            }
        }
        metrics::record_circuit_transition(&self.name, to.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error, PartialEq)]
    #[error("dependency down")]
    struct Down;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout_ms: 5_000,
            failure_window_ms: 60_000,
            half_open_max_calls: 1,
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitBreakerError<Down>> {
        breaker.execute(|| async { Err(Down) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), CircuitBreakerError<Down>> {
        breaker.execute(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cycle() {
        let breaker = CircuitBreaker::new("payments", config());

        for _ in 0..3 {
            assert!(matches!(fail(&breaker).await, Err(CircuitBreakerError::Operation(Down))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = succeed(&breaker).await.unwrap_err();
        assert!(err.is_open());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.get_stats().success_count, 1);

        succeed(&breaker).await.unwrap();
        let stats = breaker.get_stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
        assert!(stats.opened_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("search", config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(matches!(fail(&breaker).await, Err(CircuitBreakerError::Operation(Down))));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(succeed(&breaker).await.unwrap_err().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let breaker = CircuitBreaker::new("ledger", CircuitBreakerConfig {
            failure_window_ms: 1_000,
            ..config()
        });
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(1_500)).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.get_stats().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_runs_only_when_open() {
        let breaker = CircuitBreaker::new("pricing", config());

        let value = breaker
            .execute_with_fallback(|| async { Ok::<_, Down>(1) }, |_| async { Ok(0) })
            .await
            .unwrap();
        assert_eq!(value, 1);

        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        let value = breaker
            .execute_with_fallback(|| async { Ok::<_, Down>(1) }, |open| async move {
                assert_eq!(open.breaker, "pricing");
                Ok(0)
            })
            .await
            .unwrap();
        assert_eq!(value, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_trial_calls() {
        let breaker = CircuitBreaker::new("inventory", config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(5)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = breaker.execute(|| async move {
            let _ = release_rx.await;
            Ok::<_, Down>(())
        });
        tokio::pin!(trial);

        // Start the trial so it holds the only half-open slot.
        assert!(futures_poll_once(trial.as_mut()).await.is_none());
        let rejected = succeed(&breaker).await.unwrap_err();
        assert!(matches!(rejected, CircuitBreakerError::Open(CircuitOpenError { retry_after, .. }) if retry_after == Duration::ZERO));

        release_tx.send(()).unwrap();
        trial.await.unwrap();
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_releases_slot() {
        let breaker = CircuitBreaker::new("mailer", config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(5)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            breaker.execute(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, Down>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.get_stats().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_waits_for_timeout() {
        let breaker = CircuitBreaker::new("billing", config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }

        let too_soon = Instant::now() + Duration::from_secs(1);
        assert_eq!(breaker.ready(Some(too_soon)).await, Err(DeadlineExceeded));

        let started = Instant::now();
        assert_eq!(breaker.ready(None).await, Ok(CircuitState::HalfOpen));
        assert!(started.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_closed_call_is_not_a_trial() {
        let breaker = CircuitBreaker::new("reports", CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            timeout_ms: 1_000,
            ..config()
        });

        let slow = breaker.execute(|| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok::<_, Down>(())
        });
        let trip = async {
            let _ = fail(&breaker).await;
            assert_eq!(breaker.state(), CircuitState::Open);
        };
        let (slow_result, ()) = tokio::join!(slow, trip);

        slow_result.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.get_stats().success_count, 0);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_trial_failure_does_not_reopen() {
        let breaker = CircuitBreaker::new("quotes", CircuitBreakerConfig {
            half_open_max_calls: 2,
            ..config()
        });
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(5)).await;

        let stale = breaker.execute(|| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Err::<(), _>(Down)
        });
        let recover = async {
            succeed(&breaker).await.unwrap();
            succeed(&breaker).await.unwrap();
            assert_eq!(breaker.state(), CircuitState::Closed);
        };
        let (stale_result, ()) = tokio::join!(stale, recover);

        assert!(matches!(stale_result, Err(CircuitBreakerError::Operation(Down))));
        let stats = breaker.get_stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes() {
        let breaker = CircuitBreaker::new("auth", config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.reset();
        let stats = breaker.get_stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        succeed(&breaker).await.unwrap();
    }

    /// Poll a future once, returning its output if it completed.
    async fn futures_poll_once<F: Future + Unpin>(fut: F) -> Option<F::Output> {
        let mut fut = fut;
        std::future::poll_fn(|cx| match std::pin::Pin::new(&mut fut).poll(cx) {
            std::task::Poll::Ready(output) => std::task::Poll::Ready(Some(output)),
            std::task::Poll::Pending => std::task::Poll::Ready(None),
        })
        .await
    }
}
