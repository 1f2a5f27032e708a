//! Domain layer types and invariants.

pub mod endpoint;
pub mod error;
pub mod schedule;
