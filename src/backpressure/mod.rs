//! Backpressure and load shedding.
//!
//! # Data Flow
//! ```text
//! caller (is_critical)
//!     → controller.rs: shed? rate limited? at capacity?
//!         ├── rejected → Rejection::{LoadShed, RateLimited, Backpressure}
//!         └── admitted → InFlightGuard held while the operation runs
//! ```

pub mod controller;
pub mod rate_limit;

pub use controller::{BackpressureController, BackpressureError, BackpressureStats, InFlightGuard, Rejection};
pub use rate_limit::SlidingWindowLimiter;
