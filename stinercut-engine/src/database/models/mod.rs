//! Database models for the pipeline engine.
//!
//! These models map directly to the database schema and handle
//! serialization/deserialization of JSON fields.

pub mod execution;
pub mod step;
pub mod step_log;

pub use execution::*;
pub use step::*;
pub use step_log::*;
