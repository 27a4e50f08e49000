//! Record aggregate - domain model and state transitions.
//!
//! This module contains the core domain logic for records:
//! - Record types and states (typestate pattern)
//! - State transition methods and the retry policy
//! - Value objects (RecordData, SubstitutionValue, etc.)

pub mod state;
pub mod transitions;

pub use state::*;
pub use transitions::{
    CompileOutcome, DeliveryOutcome, MailDefaults, RenderOutcome, RetryDecision, RetryPolicy,
};
