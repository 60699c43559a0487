//! stinercut-engine library crate.
//!
//! Durable pipeline execution for media imports: executions and steps live in
//! SQLite, a worker pool runs step handlers, and the scheduler releases steps
//! whose dependencies have completed.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod utils;

pub use error::{Error, Result};
