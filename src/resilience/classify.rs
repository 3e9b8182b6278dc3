//! Failure classification.
//!
//! # Responsibilities
//! - Map an operation error to a `FailureClass`
//! - Provide a default heuristic that callers can replace per dependency
//!
//! # Design Decisions
//! - Classifiers are injected (strategy), never hard-coded in the retry loop
//! - The default heuristic prefers error *types* (io kinds, tokio timeouts)
//!   and only then falls back to message text
//! - The whole `source()` chain is inspected, outermost first

use std::error::Error;
use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// Retry-relevant category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network blips, timeouts. Retry with backoff.
    Transient,
    /// Upstream asked us to slow down. Retry with backoff, more patiently.
    RateLimit,
    /// Malformed input. Retrying will not help.
    Validation,
    /// Never retried.
    Permanent,
    /// Unrecognised. Retried like a transient failure.
    Unknown,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::RateLimit => "rate_limit",
            FailureClass::Validation => "validation",
            FailureClass::Permanent => "permanent",
            FailureClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy that assigns a `FailureClass` to an error.
pub trait FailureClassifier: Send + Sync {
    fn classify(&self, error: &(dyn Error + 'static)) -> FailureClass;
}

impl<F> FailureClassifier for F
where
    F: Fn(&(dyn Error + 'static)) -> FailureClass + Send + Sync,
{
    fn classify(&self, error: &(dyn Error + 'static)) -> FailureClass {
        self(error)
    }
}

/// Type- and text-based heuristic used when no classifier is supplied.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "ratelimit", "too many requests", "429"];
const TRANSIENT_MARKERS: &[&str] = &["timeout", "timed out", "connection", "network"];
const VALIDATION_MARKERS: &[&str] = &["validation", "schema", "parse"];

impl FailureClassifier for DefaultClassifier {
    fn classify(&self, error: &(dyn Error + 'static)) -> FailureClass {
        let mut current: Option<&(dyn Error + 'static)> = Some(error);
        while let Some(err) = current {
            if let Some(class) = classify_by_type(err) {
                return class;
            }
            current = err.source();
        }

        classify_by_message(&render_chain(error))
    }
}

fn classify_by_type(error: &(dyn Error + 'static)) -> Option<FailureClass> {
    if error.is::<tokio::time::error::Elapsed>() {
        return Some(FailureClass::Transient);
    }
    if let Some(io_err) = error.downcast_ref::<io::Error>() {
        return match io_err.kind() {
            io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock => Some(FailureClass::Transient),
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
                Some(FailureClass::Validation)
            }
            _ => None,
        };
    }
    if error.is::<serde_json::Error>() {
        return Some(FailureClass::Validation);
    }
    None
}

fn classify_by_message(text: &str) -> FailureClass {
    let text = text.to_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|m| text.contains(m));

    if contains_any(RATE_LIMIT_MARKERS) {
        FailureClass::RateLimit
    } else if contains_any(TRANSIENT_MARKERS) {
        FailureClass::Transient
    } else if contains_any(VALIDATION_MARKERS) {
        FailureClass::Validation
    } else {
        FailureClass::Unknown
    }
}

/// Render an error and all of its sources as one line.
pub(crate) fn render_chain(error: &(dyn Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut current = error.source();
    while let Some(err) = current {
        rendered.push_str(": ");
        rendered.push_str(&err.to_string());
        current = err.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct Message(&'static str);

    #[derive(Debug, thiserror::Error)]
    #[error("upstream call failed")]
    struct Wrapped(#[source] io::Error);

    fn classify(err: &(dyn Error + 'static)) -> FailureClass {
        DefaultClassifier.classify(err)
    }

    #[test]
    fn test_message_heuristic() {
        assert_eq!(classify(&Message("Connection reset by peer")), FailureClass::Transient);
        assert_eq!(classify(&Message("request timeout")), FailureClass::Transient);
        assert_eq!(classify(&Message("network unreachable")), FailureClass::Transient);
        assert_eq!(classify(&Message("schema mismatch on field x")), FailureClass::Validation);
        assert_eq!(classify(&Message("could not parse body")), FailureClass::Validation);
        assert_eq!(classify(&Message("HTTP 429 Too Many Requests")), FailureClass::RateLimit);
        assert_eq!(classify(&Message("disk on fire")), FailureClass::Unknown);
    }

    #[test]
    fn test_io_kinds_are_classified_by_type() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "nope");
        assert_eq!(classify(&refused), FailureClass::Transient);

        let invalid = io::Error::new(io::ErrorKind::InvalidData, "bad frame");
        assert_eq!(classify(&invalid), FailureClass::Validation);
    }

    #[test]
    fn test_source_chain_is_inspected() {
        let err = Wrapped(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert_eq!(classify(&err), FailureClass::Transient);
        assert_eq!(render_chain(&err), "upstream call failed: slow");
    }

    #[test]
    fn test_closure_classifier() {
        let always_permanent = |_: &(dyn Error + 'static)| FailureClass::Permanent;
        assert_eq!(always_permanent.classify(&Message("timeout")), FailureClass::Permanent);
    }
}
