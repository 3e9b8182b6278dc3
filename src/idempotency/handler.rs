//! Idempotent execution cache.
//!
//! # Responsibilities
//! - Run an operation at most once per key while its record is live
//! - Serve the cached result to every later caller within the TTL
//! - Evict expired records lazily on lookup, or in bulk on demand
//!
//! # Design Decisions
//! - One async mutex per key: the "miss → execute → store" path is a
//!   critical section, so concurrent callers with the same key wait for the
//!   first one instead of running the operation again
//! - Different keys never contend beyond the map's shard lock
//! - Failures are not cached; a later call may try again
//! - Results are shared as `Arc<T>`; a record is never mutated once stored
//! - The record sits beside the execution lock, so lookups never wait on it
//! - A record's TTL starts when the operation completes

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::IdempotencyConfig;
use crate::idempotency::key::IdempotencyKey;
use crate::observability::metrics;

/// A stored result.
#[derive(Debug)]
pub struct IdempotencyRecord<T> {
    pub key_hash: String,
    pub result: Arc<T>,
    pub executed_at: SystemTime,
    pub expires_at: Option<Instant>,
}

impl<T> IdempotencyRecord<T> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

/// Per-key state. `running` serializes execution; `record` is read without
/// waiting on it.
#[derive(Debug)]
struct SlotState<T> {
    running: Arc<Mutex<()>>,
    record: parking_lot::Mutex<Option<IdempotencyRecord<T>>>,
}

impl<T> SlotState<T> {
    fn new() -> Self {
        Self {
            running: Arc::new(Mutex::new(())),
            record: parking_lot::Mutex::new(None),
        }
    }

    fn live_result(&self, now: Instant) -> Option<Arc<T>> {
        self.record
            .lock()
            .as_ref()
            .filter(|r| !r.is_expired(now))
            .map(|r| r.result.clone())
    }

    fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }
}

type Slot<T> = Arc<SlotState<T>>;

/// Deduplicates execution of operations by key.
#[derive(Debug)]
pub struct IdempotencyHandler<T> {
    slots: DashMap<String, Slot<T>>,
    ttl: Option<Duration>,
}

impl<T> IdempotencyHandler<T>
where
    T: Send + Sync,
{
    /// Create a handler. `ttl = None` keeps records until cleared.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            slots: DashMap::new(),
            ttl,
        }
    }

    pub fn from_config(config: &IdempotencyConfig) -> Self {
        Self::new(config.ttl())
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Return the cached result for `key`, or run `operation` and cache it.
    pub async fn execute<F, Fut, E>(&self, key: &IdempotencyKey, operation: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key_hash = key.hash();

        let (slot, _running) = loop {
            let slot = self.slot(&key_hash);
            let running = slot.running.clone().lock_owned().await;
            // A bulk sweep may have detached this slot while we waited.
            let still_current = self
                .slots
                .get(&key_hash)
                .is_some_and(|current| Arc::ptr_eq(current.value(), &slot));
            if still_current {
                break (slot, running);
            }
        };

        {
            let mut record = slot.record.lock();
            let cached = record
                .as_ref()
                .map(|existing| (existing.is_expired(Instant::now()), existing.result.clone()));
            match cached {
                Some((false, result)) => {
                    tracing::debug!(key = %key, "Idempotency hit, returning cached result");
                    metrics::record_idempotency_lookup("hit");
                    return Ok(result);
                }
                Some((true, _)) => {
                    tracing::debug!(key = %key, "Idempotency record expired, evicting");
                    metrics::record_idempotency_lookup("expired");
                    *record = None;
                }
                None => metrics::record_idempotency_lookup("miss"),
            }
        }

        tracing::trace!(key = %key, "Idempotency miss, executing operation");
        match operation().await {
            Ok(value) => {
                let result = Arc::new(value);
                let stored_at = Instant::now();
                *slot.record.lock() = Some(IdempotencyRecord {
                    key_hash,
                    result: result.clone(),
                    executed_at: SystemTime::now(),
                    expires_at: self.ttl.map(|ttl| stored_at + ttl),
                });
                Ok(result)
            }
            Err(error) => {
                tracing::debug!(key = %key, "Operation failed, nothing cached");
                Err(error)
            }
        }
    }

    /// Cached result for `key`, if present and live. Never waits, including
    /// while another caller holds the key for execution.
    pub fn get(&self, key: &IdempotencyKey) -> Option<Arc<T>> {
        let slot = self.slots.get(&key.hash())?.value().clone();
        slot.live_result(Instant::now())
    }

    pub fn contains(&self, key: &IdempotencyKey) -> bool {
        self.get(key).is_some()
    }

    /// Forget `key`. Returns true if a slot existed.
    pub fn clear(&self, key: &IdempotencyKey) -> bool {
        self.slots.remove(&key.hash()).is_some()
    }

    pub fn clear_all(&self) {
        self.slots.clear();
    }

    /// Number of tracked keys (including in-flight and expired ones).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Remove every expired or empty record. Slots with an execution in
    /// progress are kept. Returns the number of slots removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| slot.is_running() || slot.live_result(now).is_some());
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            tracing::debug!(removed, remaining = self.slots.len(), "Swept expired idempotency records");
        }
        removed
    }

    fn slot(&self, key_hash: &str) -> Slot<T> {
        if let Some(existing) = self.slots.get(key_hash) {
            return existing.value().clone();
        }
        self.slots
            .entry(key_hash.to_string())
            .or_insert_with(|| Arc::new(SlotState::new()))
            .value()
            .clone()
    }
}
