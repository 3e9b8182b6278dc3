//! Exactly-once effects over at-least-once delivery.
//!
//! # Data Flow
//! ```text
//! message_id + business_key
//!     → IdempotencyKey::hash()
//!     → IdempotencyHandler::execute
//!         ├── live record  → cached Arc<T>
//!         └── miss/expired → run operation → store on success
//! ```

pub mod handler;
pub mod key;

pub use handler::{IdempotencyHandler, IdempotencyRecord};
pub use key::IdempotencyKey;
