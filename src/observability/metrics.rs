//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define toolkit metrics (retries, breaker transitions, admission, cache)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `resilience_retry_attempts_total` (counter): failed attempts by class
//! - `resilience_retry_exhausted_total` (counter): calls that ran out of attempts
//! - `resilience_poison_messages_total` (counter): quarantined messages
//! - `resilience_circuit_transitions_total` (counter): breaker state changes
//! - `resilience_circuit_rejections_total` (counter): calls short-circuited while open
//! - `resilience_admission_rejections_total` (counter): shed / rate limited / over capacity
//! - `resilience_queue_length` (gauge): in-flight operations
//! - `resilience_operation_duration_seconds` (histogram): admitted operation latency
//! - `resilience_idempotency_lookups_total` (counter): hit / miss / expired
//! - `resilience_state_transitions_total` (counter): state machine transitions
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed
//! - Labels are low-cardinality: class, breaker name, reason, machine name

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_retry_attempt(class: &'static str) {
    counter!("resilience_retry_attempts_total", "class" => class).increment(1);
}

pub fn record_retry_exhausted(class: &'static str) {
    counter!("resilience_retry_exhausted_total", "class" => class).increment(1);
}

pub fn record_poison_message() {
    counter!("resilience_poison_messages_total").increment(1);
}

pub fn record_circuit_transition(breaker: &str, to: &'static str) {
    counter!(
        "resilience_circuit_transitions_total",
        "breaker" => breaker.to_string(),
        "to" => to
    )
    .increment(1);
}

pub fn record_circuit_rejection(breaker: &str) {
    counter!("resilience_circuit_rejections_total", "breaker" => breaker.to_string()).increment(1);
}

pub fn record_admission_rejection(reason: &'static str) {
    counter!("resilience_admission_rejections_total", "reason" => reason).increment(1);
}

pub fn record_queue_length(length: usize) {
    gauge!("resilience_queue_length").set(length as f64);
}

pub fn record_operation_duration(start: Instant) {
    histogram!("resilience_operation_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_idempotency_lookup(outcome: &'static str) {
    counter!("resilience_idempotency_lookups_total", "outcome" => outcome).increment(1);
}

pub fn record_state_transition(machine: &str, event: &str) {
    counter!(
        "resilience_state_transitions_total",
        "machine" => machine.to_string(),
        "event" => event.to_string()
    )
    .increment(1);
}
