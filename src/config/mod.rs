//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ToolkitConfig (validated, immutable)
//!     → each primitive receives its own section at construction
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; primitives never see changes
//! - All fields have defaults to allow minimal configs
//! - Durations are `*_ms` integers in the file, `Duration` in code
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BackoffStrategy, BackpressureConfig, CircuitBreakerConfig, ClassLimits, ErrorReport, IdempotencyConfig,
    LoadSheddingPolicy, LogFormat, ObservabilityConfig, RetryPolicy, ToolkitConfig,
};
pub use validation::{validate_config, ValidationError};
