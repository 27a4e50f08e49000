//! Core domain types for the document pipeline.
//!
//! This module contains pure domain types with no filesystem dependencies:
//! - Input documents and how they become records
//! - Record typestate machine
//! - Retry policy

pub mod input;
pub mod record;
