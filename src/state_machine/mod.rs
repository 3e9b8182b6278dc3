//! Timed finite-state machines for long-running units of work.
//!
//! # Data Flow
//! ```text
//! StateMachine (immutable, shared)
//!     → create_instance(id, context) → StateMachineInstance (caller-owned)
//!     → transition(instance, event, data) on pipeline outcomes
//!     → check_timeout(instance) from an external scheduler
//!         → "{state}_timeout" fed back into transition()
//! ```

pub mod definition;
pub mod instance;
pub mod presets;

pub use definition::{Context, DefinitionError, State, StateMachine, StateMachineBuilder, Transition, TransitionRejected};
pub use instance::{StateMachineInstance, TransitionRecord};
pub use presets::{decision_lifecycle, incident_lifecycle};
