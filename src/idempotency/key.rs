//! Idempotency keys.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity of a logically-once operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct IdempotencyKey {
    pub message_id: String,
    pub business_key: Option<String>,
}

impl IdempotencyKey {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            business_key: None,
        }
    }

    pub fn with_business_key(mut self, business_key: impl Into<String>) -> Self {
        self.business_key = Some(business_key.into());
        self
    }

    /// Deterministic SHA-256 hash, hex encoded.
    ///
    /// The two parts are length-prefixed so `("ab", "c")` and `("a", "bc")`
    /// never collide, and a missing business key differs from an empty one.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update((self.message_id.len() as u64).to_be_bytes());
        hasher.update(self.message_id.as_bytes());
        match &self.business_key {
            Some(business_key) => {
                hasher.update([1u8]);
                hasher.update((business_key.len() as u64).to_be_bytes());
                hasher.update(business_key.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.business_key {
            Some(business_key) => write!(f, "{}/{}", self.message_id, business_key),
            None => f.write_str(&self.message_id),
        }
    }
}

impl From<&str> for IdempotencyKey {
    fn from(message_id: &str) -> Self {
        Self::new(message_id)
    }
}

impl From<String> for IdempotencyKey {
    fn from(message_id: String) -> Self {
        Self::new(message_id)
    }
}
